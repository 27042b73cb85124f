//! Grace period tracking (spec.md §4.D "Lease & grace semantics").

use std::time::{Duration, Instant};

/// Tracks the `grace_time` window following server start, during which only
/// CLAIM_PREVIOUS may establish new state.
pub struct GracePeriod {
    started: Instant,
    duration: Duration,
}

impl GracePeriod {
    pub fn start(duration: Duration) -> Self {
        Self { started: Instant::now(), duration }
    }

    pub fn is_active(&self) -> bool {
        self.started.elapsed() < self.duration
    }

    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.started.elapsed())
    }
}

/// Claim type carried on OPEN (spec.md §4.D).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Claim {
    Null,
    Fh,
    Previous,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grace_is_active_immediately_after_start() {
        let grace = GracePeriod::start(Duration::from_secs(120));
        assert!(grace.is_active());
    }

    #[test]
    fn grace_inactive_once_duration_elapsed() {
        let grace = GracePeriod::start(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!grace.is_active());
    }
}
