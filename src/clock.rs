//! Time source used for every `cached_at` stamp and freshness classification.
//!
//! Wall-clock time is used (not a monotonic instant) so that persisted
//! snapshots can be re-evaluated after a process restart.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Production clock backed by [`SystemTime::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually advanced clock for deterministic tests and simulations.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Start at a fixed, arbitrary instant so tests are reproducible.
    pub fn at_epoch_secs(secs: u64) -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(secs))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, to: SystemTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at_epoch_secs(1_700_000_000)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Age of a stamp relative to `now`. A stamp from the future counts as age zero.
pub(crate) fn age(cached_at: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(cached_at).unwrap_or(Duration::ZERO)
}

pub(crate) fn to_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn from_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_epoch_secs(100);
        let start = clock.now();
        clock.advance(Duration::from_secs(30));
        assert_eq!(age(start, clock.now()), Duration::from_secs(30));
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let a = ManualClock::default();
        let b = a.clone();
        a.advance(Duration::from_secs(5));
        assert_eq!(a.now(), b.now());
    }

    #[test]
    fn test_future_stamp_is_age_zero() {
        let now = UNIX_EPOCH + Duration::from_secs(10);
        let later = now + Duration::from_secs(5);
        assert_eq!(age(later, now), Duration::ZERO);
    }

    #[test]
    fn test_millis_round_trip_is_lossless_at_ms_precision() {
        let t = UNIX_EPOCH + Duration::from_millis(1_234_567);
        assert_eq!(from_millis(to_millis(t)), t);
    }
}
