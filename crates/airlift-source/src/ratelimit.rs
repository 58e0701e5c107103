use std::time::{Duration, Instant};

const PERIOD: Duration = Duration::from_millis(100);

/// Byte-budget rate limiter for the outgoing stream.
///
/// The budget refills every 100 ms; when it is spent, [`RateLimiter::throttled`]
/// reports how long the scheduler should sleep instead of watching
/// write-readiness.
#[derive(Debug)]
pub struct RateLimiter {
    budget: Option<u64>,
    spent: u64,
    period_start: Instant,
}

impl RateLimiter {
    pub fn new(bytes_per_second: Option<u64>) -> Self {
        Self {
            budget: bytes_per_second.map(|rate| (rate / 10).max(1)),
            spent: 0,
            period_start: Instant::now(),
        }
    }

    /// Forgives everything spent so far; used when the demand phase starts
    /// so precopy traffic does not eat the first period.
    pub fn reset(&mut self) {
        self.spent = 0;
        self.period_start = Instant::now();
    }

    pub fn note(&mut self, bytes: u64) {
        self.spent = self.spent.saturating_add(bytes);
    }

    /// `None` while budget remains in the current period, otherwise the
    /// time until the next one.
    pub fn throttled(&mut self, now: Instant) -> Option<Duration> {
        let budget = self.budget?;
        while now.duration_since(self.period_start) >= PERIOD {
            self.period_start += PERIOD;
            self.spent = 0;
        }
        if self.spent >= budget {
            Some(self.period_start + PERIOD - now)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_throttles() {
        let mut rl = RateLimiter::new(None);
        rl.note(u64::MAX);
        assert_eq!(rl.throttled(Instant::now()), None);
    }

    #[test]
    fn budget_exhaustion_reports_a_sleep() {
        let mut rl = RateLimiter::new(Some(40960));
        let now = Instant::now();
        assert!(rl.throttled(now).is_none());
        rl.note(4096);
        assert!(rl.throttled(now).is_none());
        rl.note(4096 * 10);
        let sleep = rl.throttled(now).expect("over budget");
        assert!(sleep <= PERIOD);
    }

    #[test]
    fn budget_refills_next_period() {
        let mut rl = RateLimiter::new(Some(40960));
        let start = Instant::now();
        rl.note(u64::MAX / 2);
        assert!(rl.throttled(start).is_some());
        assert!(rl.throttled(start + PERIOD * 2).is_none());
    }
}
