use super::config::BackoffSettings;
use rand::Rng;
use std::time::Duration;

/// Exponential reconnect backoff with multiplicative jitter.
///
/// `current` is the pre-jitter delay for the next attempt. Each call to
/// [`next_delay`](Backoff::next_delay) hands out a jittered copy of it and
/// then grows it by `factor`, never past `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    failures: u32,
}

impl Backoff {
    pub fn new(settings: &BackoffSettings) -> Self {
        let initial = settings.initial();
        let max = settings.max().max(initial);
        Self {
            current: initial,
            initial,
            max,
            factor: if settings.factor.is_finite() && settings.factor >= 1.0 {
                settings.factor
            } else {
                1.0
            },
            jitter: settings.jitter.clamp(0.0, 1.0),
            failures: 0,
        }
    }

    /// Delay before the next reconnect attempt. Never exceeds the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.jittered(self.current).min(self.max);
        self.current = self.current.mul_f64(self.factor).min(self.max);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Back to the floor. Only a stabilized connection calls this.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.jitter == 0.0 {
            return base;
        }
        let scale = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(scale)
    }
}
