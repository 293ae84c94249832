//! Date literals used by the peer stores
//!
//! Expiry dates are written as `dd.mm.YYYY`. On read they also accept the
//! two-digit year form `dd.mm.yy` and the ISO `YYYY-MM-DD` form written by
//! older stores. Creation timestamps follow the same rule with a time part.

use crate::{Error, Result};
use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Canonical expiry date format
pub const EXPIRY_FORMAT: &str = "%d.%m.%Y";

/// Canonical creation timestamp format
pub const TIMESTAMP_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// Last day a peer is valid on (inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExpiryDate(NaiveDate);

impl ExpiryDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Result<Self> {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(Self)
            .ok_or_else(|| Error::InvalidDate(format!("{:04}-{:02}-{:02}", year, month, day)))
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// Whole days from `today` until this date; negative once it has passed
    pub fn days_from(&self, today: NaiveDate) -> i64 {
        (self.0 - today).num_days()
    }

    /// True when `today` is strictly after the expiry day
    pub fn has_passed(&self, today: NaiveDate) -> bool {
        today > self.0
    }

    /// Parse any of the accepted literals
    pub fn parse(s: &str) -> Result<Self> {
        parse_date(s.trim()).map(Self)
    }
}

impl fmt::Display for ExpiryDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(EXPIRY_FORMAT))
    }
}

impl FromStr for ExpiryDate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ExpiryDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExpiryDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Moment a record was created or last renewed (local time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(NaiveDateTime);

impl Timestamp {
    pub fn new(at: NaiveDateTime) -> Self {
        Self(at)
    }

    pub fn now() -> Self {
        Self(Local::now().naive_local())
    }

    pub fn datetime(&self) -> NaiveDateTime {
        self.0
    }

    pub fn date(&self) -> NaiveDate {
        self.0.date()
    }

    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        for fmt in [TIMESTAMP_FORMAT, "%Y-%m-%d %H:%M:%S"] {
            if let Ok(at) = NaiveDateTime::parse_from_str(s, fmt) {
                return Ok(Self(at));
            }
        }
        // Some stores only kept the day of creation
        parse_date(s)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(Self)
            .ok_or_else(|| Error::InvalidDate(s.to_string()))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Dispatch on the shape of the literal; `%Y` would happily read "25" as
/// year 25, so the year width decides between the four and two digit forms.
fn parse_date(s: &str) -> Result<NaiveDate> {
    let fmt = if s.contains('-') {
        "%Y-%m-%d"
    } else {
        match s.rsplit('.').next().map(str::len) {
            Some(4) => EXPIRY_FORMAT,
            Some(2) => "%d.%m.%y",
            _ => return Err(Error::InvalidDate(s.to_string())),
        }
    };

    NaiveDate::parse_from_str(s, fmt).map_err(|_| Error::InvalidDate(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("01.07.2025", 2025, 7, 1 ; "four digit year")]
    #[test_case("01.07.25", 2025, 7, 1 ; "two digit year")]
    #[test_case("2025-07-01", 2025, 7, 1 ; "iso legacy")]
    #[test_case(" 31.12.2030 ", 2030, 12, 31 ; "surrounding whitespace")]
    fn test_parse_expiry(input: &str, y: i32, m: u32, d: u32) {
        let date = ExpiryDate::parse(input).unwrap();
        assert_eq!(date, ExpiryDate::from_ymd(y, m, d).unwrap());
    }

    #[test_case("" ; "empty")]
    #[test_case("1.7" ; "missing year")]
    #[test_case("32.01.2025" ; "bad day")]
    #[test_case("01.07.025" ; "three digit year")]
    #[test_case("tomorrow" ; "words")]
    fn test_parse_expiry_rejects(input: &str) {
        assert!(matches!(ExpiryDate::parse(input), Err(Error::InvalidDate(_))));
    }

    #[test]
    fn test_expiry_always_written_with_four_digit_year() {
        let date = ExpiryDate::parse("05.03.26").unwrap();
        assert_eq!(date.to_string(), "05.03.2026");
        assert_eq!(serde_json::to_string(&date).unwrap(), "\"05.03.2026\"");
    }

    #[test]
    fn test_has_passed_is_strict() {
        let expiry = ExpiryDate::from_ymd(2025, 7, 1).unwrap();
        let same_day = NaiveDate::from_ymd_opt(2025, 7, 1).unwrap();
        let next_day = NaiveDate::from_ymd_opt(2025, 7, 2).unwrap();

        assert!(!expiry.has_passed(same_day));
        assert!(expiry.has_passed(next_day));
        assert_eq!(expiry.days_from(next_day), -1);
    }

    #[test]
    fn test_timestamp_formats() {
        let canonical = Timestamp::parse("01.07.2025 13:45:10").unwrap();
        let iso = Timestamp::parse("2025-07-01 13:45:10").unwrap();
        assert_eq!(canonical, iso);
        assert_eq!(iso.to_string(), "01.07.2025 13:45:10");

        let day_only = Timestamp::parse("01.07.2025").unwrap();
        assert_eq!(day_only.to_string(), "01.07.2025 00:00:00");
        assert!(Timestamp::parse("yesterday").is_err());
    }
}
