use std::time::Duration;

/// Doubling retry delay, bounded by a maximum.
///
/// The first call to `next_delay` returns `initial`, every following call
/// doubles the previous delay until `max` is reached. `reset` starts over,
/// callers are expected to reset after a successful attempt.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub const fn new(initial: Duration, max: Duration) -> Backoff {
        Backoff {
            initial,
            max,
            current: None,
        }
    }

    /// The delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial,
            Some(previous) => previous.saturating_mul(2),
        };

        let delay = delay.min(self.max);
        self.current = Some(delay);

        delay
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}
