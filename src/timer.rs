// Election timing.
//
// Each node owns its own small PRNG for election jitter; two nodes in one
// process never share a seed sequence.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::Instant;

/// Randomized election deadline tracker.
///
/// The deadline is reset on every valid AppendEntries, on granting a vote,
/// and on entering the Follower or Candidate role; each reset draws a fresh
/// uniform timeout from `[min, max]`.
pub(crate) struct ElectionTimer {
    min: Duration,
    max: Duration,
    rng: SmallRng,
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(min: Duration, max: Duration) -> Self {
        let mut timer = Self {
            min,
            max,
            rng: SmallRng::from_os_rng(),
            deadline: Instant::now(),
        };
        timer.reset();
        timer
    }

    /// Draw a fresh randomized timeout and re-arm the deadline.
    pub fn reset(&mut self) {
        let timeout = self.random_timeout();
        self.deadline = Instant::now() + timeout;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// A uniform duration in `[min, max]`.
    pub fn random_timeout(&mut self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(self.rng.random_range(min..=max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_within_range() {
        let mut timer = ElectionTimer::new(Duration::from_millis(300), Duration::from_millis(600));
        for _ in 0..100 {
            let t = timer.random_timeout();
            assert!(t >= Duration::from_millis(300));
            assert!(t <= Duration::from_millis(600));
        }
    }

    #[test]
    fn test_reset_pushes_deadline_forward() {
        let mut timer = ElectionTimer::new(Duration::from_millis(300), Duration::from_millis(600));
        let before = Instant::now();
        timer.reset();
        assert!(timer.deadline() >= before + Duration::from_millis(300));
    }
}
