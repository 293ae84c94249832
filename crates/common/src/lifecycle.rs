//! Active / Archived transitions
//!
//! A peer is valid through the whole of its expiry day. It is archived on the
//! first sweep whose date is strictly later, and only an explicit renewal
//! brings it back.

use crate::dates::{ExpiryDate, Timestamp};
use crate::store::RecordStore;
use crate::types::{PeerRecord, PeerState};
use crate::{Error, Result};
use chrono::{Local, NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use tracing::debug;

/// Source of "now" for lifecycle decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

/// Local wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Clock pinned to a settable instant
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<NaiveDateTime>,
}

impl FixedClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Noon on the given day
    pub fn on(date: NaiveDate) -> Self {
        Self::new(date.and_hms_opt(12, 0, 0).unwrap_or_default())
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock() = now;
    }

    pub fn set_date(&self, date: NaiveDate) {
        let time = self.now.lock().time();
        self.set(date.and_time(time));
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }
}

/// State a record should be in on `today`, given it is currently Active
pub fn evaluate(record: &PeerRecord, today: NaiveDate) -> PeerState {
    if record.expires_at.has_passed(today) {
        PeerState::Archived
    } else {
        PeerState::Active
    }
}

/// Move every expired Active record to the archive in one transaction
///
/// Returns the archived records in store order. A second call with the same
/// date archives nothing.
pub fn sweep_expired(store: &RecordStore, today: NaiveDate) -> Result<Vec<PeerRecord>> {
    store.transact(|txn| {
        let expired: Vec<PeerRecord> = txn
            .active()
            .iter()
            .filter(|r| evaluate(r, today) == PeerState::Archived)
            .cloned()
            .collect();

        for record in &expired {
            debug!(
                "Archiving {} ({}): expired {}",
                record.id, record.name, record.expires_at
            );
            txn.put_archived(record.clone());
        }
        Ok(expired)
    })
}

/// Result of a renewal
#[derive(Debug, Clone)]
pub struct Renewal {
    pub record: PeerRecord,
    /// State the peer was in before renewal
    pub previous: PeerState,
}

impl Renewal {
    pub fn restored(&self) -> bool {
        self.previous == PeerState::Archived
    }
}

/// Set a new expiry and refresh the creation time, restoring from the
/// archive if needed. Identity fields are never touched.
pub fn renew(store: &RecordStore, id: &str, expires_at: ExpiryDate, now: Timestamp) -> Result<Renewal> {
    store.transact(|txn| {
        let (current, previous) = txn
            .state()
            .lookup(id)
            .map(|(r, s)| (r.clone(), s))
            .ok_or_else(|| Error::not_found("renew_peer", id))?;

        let record = PeerRecord {
            expires_at,
            created_at: now,
            ..current
        };
        txn.put_active(record.clone())?;
        Ok(Renewal { record, previous })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocator;
    use crate::store::CorruptPolicy;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn peer(id: &str, ip: u8, expires: NaiveDate) -> PeerRecord {
        PeerRecord {
            id: id.to_string(),
            name: id.to_string(),
            address: Ipv4Addr::new(10, 8, 0, ip),
            private_key: "priv".to_string(),
            public_key: format!("pub-{}", id),
            preshared_key: "psk".to_string(),
            expires_at: ExpiryDate::new(expires),
            created_at: Timestamp::parse("01.01.2025 09:00:00").unwrap(),
        }
    }

    fn store(tmp: &TempDir) -> RecordStore {
        RecordStore::open(tmp.path(), Allocator::default(), CorruptPolicy::Fail).unwrap()
    }

    #[test]
    fn test_boundary_dates() {
        let today = day(2025, 7, 2);
        assert_eq!(evaluate(&peer("id1", 2, day(2025, 7, 2)), today), PeerState::Active);
        assert_eq!(evaluate(&peer("id1", 2, day(2025, 7, 1)), today), PeerState::Archived);
        assert_eq!(evaluate(&peer("id1", 2, day(2026, 1, 1)), today), PeerState::Active);
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.put_active(peer("id1", 2, day(2025, 7, 1))).unwrap();
        store.put_active(peer("id2", 3, day(2025, 7, 2))).unwrap();
        store.put_active(peer("id3", 4, day(2025, 6, 1))).unwrap();

        let archived = sweep_expired(&store, day(2025, 7, 2)).unwrap();
        let ids: Vec<_> = archived.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["id1", "id3"]);

        assert!(sweep_expired(&store, day(2025, 7, 2)).unwrap().is_empty());
        assert_eq!(store.list_active().len(), 1);
        assert_eq!(store.list_archived().len(), 2);
    }

    #[test]
    fn test_renew_restores_from_archive() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let original = peer("id1", 2, day(2025, 7, 1));
        store.put_archived(original.clone()).unwrap();

        let now = Timestamp::parse("10.07.2025 15:30:00").unwrap();
        let renewal = renew(&store, "id1", ExpiryDate::new(day(2025, 12, 31)), now).unwrap();

        assert!(renewal.restored());
        assert_eq!(renewal.record.created_at, now);
        assert_eq!(renewal.record.public_key, original.public_key);
        assert_eq!(renewal.record.address, original.address);

        let active = store.get_active("id1").unwrap();
        assert_eq!(active.expires_at.to_string(), "31.12.2025");
        assert!(store.get_archived("id1").is_err());
    }

    #[test]
    fn test_renew_active_only_updates_dates() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.put_active(peer("id1", 2, day(2025, 7, 1))).unwrap();

        let now = Timestamp::parse("20.06.2025 08:00:00").unwrap();
        let renewal = renew(&store, "id1", ExpiryDate::new(day(2025, 9, 1)), now).unwrap();
        assert!(!renewal.restored());
        assert_eq!(store.list_active().len(), 1);
        assert!(store.list_archived().is_empty());
    }

    #[test]
    fn test_renew_unknown() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let err = renew(&store, "id7", ExpiryDate::new(day(2025, 9, 1)), Timestamp::now()).unwrap_err();
        assert!(matches!(err, Error::NotFound { op: "renew_peer", .. }));
    }

    #[test]
    fn test_fixed_clock() {
        let clock = FixedClock::on(day(2025, 7, 1));
        assert_eq!(clock.today(), day(2025, 7, 1));
        clock.set_date(day(2025, 7, 2));
        assert_eq!(clock.today(), day(2025, 7, 2));
    }
}
