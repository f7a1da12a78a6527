//! Time source for stores that evaluate expiry in-process.
//!
//! The PostgreSQL repository uses the database's transaction time instead.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::auth::AuthError;

/// A source of "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// `now + ttl_seconds`, or `Internal` when that falls outside the
/// representable range.
pub fn expiry_after(now: DateTime<Utc>, ttl_seconds: i64) -> Result<DateTime<Utc>, AuthError> {
    Duration::try_seconds(ttl_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| AuthError::Internal(format!("lifetime of {ttl_seconds}s is out of range")))
}

/// A clock that only moves when told to. Used by tests to step across
/// token expiry boundaries.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward (or backward, for a negative duration).
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), start + Duration::seconds(90));
    }

    #[test]
    fn expiry_after_rejects_overflow() {
        let now = Utc::now();
        assert_eq!(expiry_after(now, 60).unwrap(), now + Duration::seconds(60));
        assert!(matches!(
            expiry_after(now, 9_000_000_000_000_000),
            Err(AuthError::Internal(_))
        ));
        assert!(expiry_after(now, i64::MAX).is_err());
    }

    #[test]
    fn manual_clock_can_be_set() {
        let clock = ManualClock::new(Utc::now());
        let target = Utc::now() + Duration::days(3);
        clock.set(target);
        assert_eq!(clock.now(), target);
    }
}
