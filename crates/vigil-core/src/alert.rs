// Cooldown-window rate limiting for health alerts
//
// Extended outages must alert once per cooldown window, not once ever
// and not once per tick.

use std::time::{Duration, Instant};

/// Rate limiter with a fixed cooldown window.
#[derive(Debug)]
pub struct AlertLimiter {
    cooldown: Duration,
    last_fired: Option<Instant>,
}

impl AlertLimiter {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_fired: None,
        }
    }

    /// Returns true when the caller should emit the alert now.
    pub fn should_fire(&mut self) -> bool {
        self.should_fire_at(Instant::now())
    }

    /// Clock-injected variant for tests.
    pub fn should_fire_at(&mut self, now: Instant) -> bool {
        match self.last_fired {
            Some(last) if now.duration_since(last) < self.cooldown => false,
            _ => {
                self.last_fired = Some(now);
                true
            }
        }
    }

    /// Forget the last alert, e.g. after the condition clears.
    pub fn reset(&mut self) {
        self.last_fired = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_per_cooldown_window() {
        let mut limiter = AlertLimiter::new(Duration::from_secs(1800));
        let t0 = Instant::now();

        assert!(limiter.should_fire_at(t0));
        // Second alert inside the 30-minute window is suppressed
        assert!(!limiter.should_fire_at(t0 + Duration::from_secs(600)));
        assert!(!limiter.should_fire_at(t0 + Duration::from_secs(1799)));
        // After the window it fires again
        assert!(limiter.should_fire_at(t0 + Duration::from_secs(1800)));
    }

    #[test]
    fn reset_allows_immediate_fire() {
        let mut limiter = AlertLimiter::new(Duration::from_secs(1800));
        let t0 = Instant::now();
        assert!(limiter.should_fire_at(t0));
        limiter.reset();
        assert!(limiter.should_fire_at(t0 + Duration::from_secs(1)));
    }
}
