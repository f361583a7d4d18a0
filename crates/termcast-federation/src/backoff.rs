//! Exponential backoff for HQ registration retries (§4.H / §5: "starting
//! at 2s"). A small reusable type rather than ad hoc sleeps scattered
//! through the registration loop.

use std::time::Duration;

const DEFAULT_INITIAL: Duration = Duration::from_secs(2);
const DEFAULT_MAX: Duration = Duration::from_secs(60);

pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            initial: DEFAULT_INITIAL,
            max: DEFAULT_MAX,
            current: DEFAULT_INITIAL,
        }
    }

    /// Returns the delay to wait before the next attempt and doubles the
    /// internal counter, capped at `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Called after a successful attempt so the next failure starts back
    /// at the initial delay instead of continuing to escalate.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_the_cap() {
        let mut b = Backoff::new();
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        assert_eq!(b.next_delay(), Duration::from_secs(4));
        assert_eq!(b.next_delay(), Duration::from_secs(8));
    }

    #[test]
    fn reset_returns_to_the_initial_delay() {
        let mut b = Backoff::new();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(2));
    }
}
