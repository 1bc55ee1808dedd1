use std::time::Duration;

/// Restart delay after consecutive listener failures.
///
/// Starts at 1 s, doubles per failure, never exceeds 60 s, and drops back
/// to 1 s after a successful launch.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub const INITIAL: Duration = Duration::from_secs(1);
    pub const MAX: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self::with_bounds(Self::INITIAL, Self::MAX)
    }

    pub fn with_bounds(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the next call returns double (capped)
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Delay the next failure would wait, without advancing
    pub fn peek(&self) -> Duration {
        self.current
    }

    /// Reset after a successful launch
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
