use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Randomized election deadline.
///
/// Each `reset` draws a fresh timeout from `[min, max]` so members that lose
/// their leader at the same moment rarely time out together.
#[derive(Debug)]
pub struct ElectionTimer {
    min_ms: u64,
    max_ms: u64,
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        let mut timer = Self {
            min_ms,
            max_ms: max_ms.max(min_ms),
            deadline: Instant::now(),
        };
        timer.reset();
        timer
    }

    pub fn reset(&mut self) {
        self.deadline = Instant::now() + self.random_timeout();
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn random_timeout(&self) -> Duration {
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
    }
}
