//! Time sources, kept behind a trait so leader-resident tasks can be driven
//! by a test clock.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::Timestamp;

pub trait Clock: Send + Sync {
    /// Wall-clock time in milliseconds, comparable to node modification times.
    fn wall_now(&self) -> Timestamp;

    /// Monotonic milliseconds since an arbitrary origin, for measuring
    /// elapsed intervals.
    fn elapsed_now(&self) -> u64;
}

/// The system clock.
pub struct WallClock {
    origin: Instant,
}

impl WallClock {
    pub fn new() -> WallClock {
        WallClock {
            origin: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> WallClock {
        WallClock::new()
    }
}

impl Clock for WallClock {
    fn wall_now(&self) -> Timestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(since_epoch.as_millis() as u64)
    }

    fn elapsed_now(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}
