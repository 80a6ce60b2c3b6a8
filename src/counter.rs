use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Fixed-window rate counter shared by a scheduler's admission loop.
///
/// Deliberately not a sliding window: a burst can straddle two windows. The
/// explorer's own limiter is the hard backstop; this one only keeps us from
/// hammering it.
pub struct Counter {
    rate: u32,
    cycle: Duration,
    inner: Mutex<Window>,
}

struct Window {
    begin: Instant,
    count: u32,
}

impl Counter {
    pub fn new(rate: u32, cycle: Duration) -> Self {
        Self {
            rate,
            cycle,
            inner: Mutex::new(Window {
                begin: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Admit a call of the given weight, or deny it until the window rolls.
    pub fn allow(&self, weight: u32) -> bool {
        let mut w = self.inner.lock().expect("counter lock poisoned");
        if w.count > self.rate - 1 {
            let now = Instant::now();
            if now.duration_since(w.begin) >= self.cycle {
                w.begin = now;
                w.count = 0;
                true
            } else {
                tracing::debug!("rate limit reached");
                false
            }
        } else {
            w.count += weight;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_rate_then_denies() {
        let c = Counter::new(3, Duration::from_secs(60));
        assert!(c.allow(1));
        assert!(c.allow(1));
        assert!(c.allow(1));
        // count is now 3 > rate - 1, window has not elapsed
        assert!(!c.allow(1));
        assert!(!c.allow(1));
    }

    #[test]
    fn weight_counts_against_budget() {
        let c = Counter::new(3, Duration::from_secs(60));
        assert!(c.allow(2));
        assert!(c.allow(2));
        // count is 4, over budget until the window rolls
        assert!(!c.allow(1));
    }

    #[test]
    fn window_roll_resets_the_budget() {
        let c = Counter::new(1, Duration::from_millis(20));
        assert!(c.allow(1));
        assert!(!c.allow(1));
        std::thread::sleep(Duration::from_millis(25));
        assert!(c.allow(1));
    }
}
