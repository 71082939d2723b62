//! Wall-clock time source
//!
//! All stored times are UTC milliseconds since the epoch. Components take a
//! `WallClock` so expiry logic can be driven by a manual clock under test.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

/// Milliseconds since the Unix epoch
pub type Timestamp = u64;

pub trait WallClock: Send + Sync {
    fn now_ms(&self) -> Timestamp;
}

/// Reads the system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_ms(&self) -> Timestamp {
        Utc::now().timestamp_millis().max(0) as Timestamp
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualWallClock {
    now: Arc<AtomicU64>,
}

impl ManualWallClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl WallClock for ManualWallClock {
    fn now_ms(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Shared handle to a wall clock
pub type SharedWallClock = Arc<dyn WallClock>;

pub fn system_clock() -> SharedWallClock {
    Arc::new(SystemWallClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_all_clones() {
        let clock = ManualWallClock::new(1_000);
        let other = clock.clone();
        clock.advance(Duration::from_millis(250));
        assert_eq!(other.now_ms(), 1_250);
        other.set(5);
        assert_eq!(clock.now_ms(), 5);
    }

    #[test]
    fn test_system_clock_is_recent() {
        // 2020-01-01 in millis
        assert!(SystemWallClock.now_ms() > 1_577_836_800_000);
    }
}
