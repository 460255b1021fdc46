//! Check-in timing: jittered sleep, retry budget and kill date.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;

use crate::error::{Error, Result};

/// Source of wall-clock time for kill-date checks.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Jump to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    /// Move forward by `secs` seconds.
    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.now.lock();
        *now += chrono::Duration::seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// How often and how long the agent keeps trying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    /// Base interval between check-ins
    pub sleep: Duration,
    /// Jitter as a percentage of `sleep` (0-100)
    pub skew: u8,
    /// Consecutive failures tolerated before giving up
    pub max_retry: u32,
    /// Absolute time after which the agent stops
    pub kill_date: Option<DateTime<Utc>>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            sleep: Duration::from_secs(30),
            skew: 3,
            max_retry: 7,
            kill_date: None,
        }
    }
}

impl RetrySchedule {
    /// Validate the schedule.
    pub fn validate(&self) -> Result<()> {
        if self.sleep.is_zero() {
            return Err(Error::config("sleep must be non-zero"));
        }
        if self.skew > 100 {
            return Err(Error::config(format!("skew {} exceeds 100%", self.skew)));
        }
        if self.max_retry == 0 {
            return Err(Error::config("max retry must be at least 1"));
        }
        Ok(())
    }

    /// Kill date from Unix epoch seconds; `0` means none.
    pub fn kill_date_from_epoch(secs: i64) -> Result<Option<DateTime<Utc>>> {
        if secs == 0 {
            return Ok(None);
        }
        DateTime::from_timestamp(secs, 0)
            .map(Some)
            .ok_or_else(|| Error::config(format!("kill date {secs} out of range")))
    }

    /// Whether the kill date has been reached at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.kill_date.is_some_and(|kill| now >= kill)
    }

    /// `sleep * (1 ± skew%)`, uniformly distributed.
    pub fn jittered_sleep(&self) -> Duration {
        if self.skew == 0 {
            return self.sleep;
        }
        let spread = f64::from(self.skew) / 100.0;
        let factor = rand::thread_rng().gen_range(-spread..=spread);
        self.sleep.mul_f64((1.0 + factor).max(0.0))
    }

    /// Sleep before the next cycle, never past the kill date.
    pub fn next_sleep(&self, now: DateTime<Utc>) -> Duration {
        let sleep = self.jittered_sleep();
        match self.kill_date {
            Some(kill) => match (kill - now).to_std() {
                Ok(remaining) => sleep.min(remaining),
                Err(_) => Duration::ZERO,
            },
            None => sleep,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_jitter_bounds() {
        let schedule = RetrySchedule {
            sleep: Duration::from_secs(10),
            skew: 100,
            ..Default::default()
        };

        let mut seen = HashSet::new();
        for _ in 0..100 {
            let sleep = schedule.jittered_sleep();
            assert!(sleep <= Duration::from_secs(20));
            seen.insert(sleep);
        }
        // Should have variety
        assert!(seen.len() > 1);
    }

    #[test]
    fn test_no_skew() {
        let schedule = RetrySchedule {
            sleep: Duration::from_secs(5),
            skew: 0,
            ..Default::default()
        };
        assert_eq!(schedule.jittered_sleep(), Duration::from_secs(5));
    }

    #[test]
    fn test_sleep_capped_by_kill_date() {
        let now = Utc::now();
        let schedule = RetrySchedule {
            sleep: Duration::from_secs(3600),
            skew: 0,
            kill_date: Some(now + chrono::Duration::seconds(30)),
            ..Default::default()
        };

        assert_eq!(schedule.next_sleep(now), Duration::from_secs(30));
        assert!(!schedule.is_expired(now));
        assert!(schedule.is_expired(now + chrono::Duration::seconds(30)));
        assert_eq!(
            schedule.next_sleep(now + chrono::Duration::seconds(60)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_kill_date_from_epoch() {
        assert_eq!(RetrySchedule::kill_date_from_epoch(0).unwrap(), None);
        let date = RetrySchedule::kill_date_from_epoch(1_700_000_000).unwrap().unwrap();
        assert_eq!(date.timestamp(), 1_700_000_000);
        assert!(RetrySchedule::kill_date_from_epoch(i64::MAX).is_err());
    }

    #[test]
    fn test_validation() {
        assert!(RetrySchedule::default().validate().is_ok());

        let bad_skew = RetrySchedule { skew: 101, ..Default::default() };
        assert!(bad_skew.validate().is_err());

        let no_retries = RetrySchedule { max_retry: 0, ..Default::default() };
        assert!(no_retries.validate().is_err());

        let no_sleep = RetrySchedule { sleep: Duration::ZERO, ..Default::default() };
        assert!(no_sleep.validate().is_err());
    }

    #[test]
    fn test_manual_clock() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance_secs(90);
        assert_eq!((clock.now() - start).num_seconds(), 90);
    }
}
