//! Layer 0: Time primitives
//!
//! WallClock for TTLs and timeout windows - never read ambiently inside a
//! state transition; callers pass the clock in so tests control time.

use serde::{Deserialize, Serialize};

/// Wall clock in milliseconds since the Unix epoch.
///
/// Copy is fine here - it's just a measurement, not causality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WallClock(pub u64);

impl WallClock {
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self(ms)
    }

    pub fn plus_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    /// Milliseconds elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn since(self, earlier: WallClock) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_saturates() {
        let a = WallClock(1_000);
        let b = WallClock(400);
        assert_eq!(a.since(b), 600);
        assert_eq!(b.since(a), 0);
    }
}
