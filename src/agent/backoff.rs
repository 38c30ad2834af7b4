use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with ±10% random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        // 2^attempt, with overflow protection
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(multiplier).min(self.max)
    }

    /// Delay before retry number `attempt`, jittered so a fleet of agents
    /// does not retry in lockstep.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        let jitter_ms = (delay.as_millis() as u64) / 5;
        if jitter_ms == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        delay
            .saturating_sub(Duration::from_millis(jitter_ms / 2))
            .saturating_add(Duration::from_millis(jitter))
            .min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let backoff = Backoff::from_millis(500, 30_000);
        assert_eq!(backoff.base_delay(0), Duration::from_millis(500));
        assert_eq!(backoff.base_delay(1), Duration::from_millis(1_000));
        assert_eq!(backoff.base_delay(3), Duration::from_millis(4_000));
        assert_eq!(backoff.base_delay(10), Duration::from_millis(30_000));
        assert_eq!(backoff.base_delay(64), Duration::from_millis(30_000));
    }

    #[test]
    fn jitter_stays_close_to_base() {
        let backoff = Backoff::from_millis(1_000, 60_000);
        for attempt in 0..6 {
            let base = backoff.base_delay(attempt).as_millis() as i128;
            let jittered = backoff.delay(attempt).as_millis() as i128;
            assert!((jittered - base).abs() <= base / 10 + 1, "{jittered} vs {base}");
        }
    }

    #[test]
    fn max_below_base_is_raised() {
        let backoff = Backoff::from_millis(2_000, 100);
        assert_eq!(backoff.base_delay(5), Duration::from_millis(2_000));
    }
}
