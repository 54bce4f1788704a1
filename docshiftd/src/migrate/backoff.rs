use rand::Rng;
use std::time::Duration;

/// Doubling delay schedule starting at `base` and capped at `max`, optionally
/// jittered into the upper half of each step.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    /// Status polling for provider-side copy jobs.
    pub fn polling(base: Duration) -> Self {
        Self::new(base, Duration::from_secs(30), true)
    }

    /// Un-jittered delay before retry number `attempt` (zero-based).
    pub fn step(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_from(attempt, &mut rand::thread_rng())
    }

    pub fn delay_from<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let step = self.step(attempt);
        if !self.jitter || step.is_zero() {
            return step;
        }
        // Never below half the step.
        let half = step / 2;
        half + rng.gen_range(Duration::ZERO..=step - half)
    }
}
