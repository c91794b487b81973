use std::time::Duration;

/// Linear reconnect backoff: `step × attempt`, capped at `cap`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    step: Duration,
    cap: Duration,
    attempt: u32,
}

impl LinearBackoff {
    pub fn new(step: Duration, cap: Duration) -> Self {
        Self { step, cap, attempt: 0 }
    }

    /// Advance to the next attempt and return how long to wait before it.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.step.saturating_mul(self.attempt).min(self.cap)
    }

    /// Back to zero after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
