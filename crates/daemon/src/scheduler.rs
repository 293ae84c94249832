//! Daily sweep and notification job

use crate::engine::PeerEngine;
use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Time left until the next `at` strictly after `now`
pub fn until_next(now: NaiveDateTime, at: NaiveTime) -> Duration {
    let mut next = now.date().and_time(at);
    if next <= now {
        next += ChronoDuration::days(1);
    }
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

/// Runs [`PeerEngine::daily_tick`] once a day at a fixed local time
pub struct DailyScheduler {
    engine: Arc<PeerEngine>,
    at: NaiveTime,
    window_days: i64,
}

impl DailyScheduler {
    pub fn new(engine: Arc<PeerEngine>, at: NaiveTime, window_days: i64) -> Self {
        Self {
            engine,
            at,
            window_days,
        }
    }

    /// Run the job loop forever
    pub async fn run(&self) {
        info!("Daily job scheduled at {}", self.at.format("%H:%M"));

        loop {
            let wait = until_next(chrono::Local::now().naive_local(), self.at);
            tokio::time::sleep(wait).await;

            match self.engine.daily_tick(self.window_days).await {
                Ok(report) if report.is_clean() => {}
                Ok(report) => warn!(
                    "Daily job finished with {} failed command(s)",
                    report.failures.len()
                ),
                Err(e) => error!("Daily job error: {}", e),
            }

            // Never fire twice within the same minute
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn now(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 7, 1).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_until_next_same_day() {
        assert_eq!(until_next(now(11, 0, 0), at(12, 0)), Duration::from_secs(3600));
    }

    #[test]
    fn test_until_next_rolls_over() {
        assert_eq!(until_next(now(12, 0, 0), at(12, 0)), Duration::from_secs(24 * 3600));
        assert_eq!(until_next(now(13, 0, 0), at(12, 0)), Duration::from_secs(23 * 3600));
    }
}
