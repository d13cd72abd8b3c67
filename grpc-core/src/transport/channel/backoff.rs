use std::time::Duration;

const DEFAULT_INITIAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX: Duration = Duration::from_secs(120);
const DEFAULT_MULTIPLIER: f64 = 1.6;
const DEFAULT_JITTER: f64 = 0.2;

/// Exponential backoff with jitter for connect retries and for the delay before reconnecting
/// after a GOAWAY-induced close.
///
/// The first attempt after construction or [`reset`](Backoff::reset) is undelayed; every
/// subsequent call to [`next_delay`](Backoff::next_delay) grows the raw delay by `multiplier`,
/// capped at `max`, then applies `±jitter` before returning it.
#[derive(Clone, Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    raw: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL,
            max: DEFAULT_MAX,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
            raw: None,
        }
    }
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            jitter,
            raw: None,
        }
    }

    pub(crate) fn with_initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    pub(crate) fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub(crate) fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub(crate) fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Restarts the sequence: the next call to `next_delay` returns a fresh, unjittered `initial`.
    pub(crate) fn reset(&mut self) {
        self.raw = None;
    }

    /// Advances the sequence and returns the jittered delay to wait before the next attempt.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let raw = match self.raw {
            None => self.initial,
            Some(prev) => {
                let grown = prev.mul_f64(self.multiplier);
                grown.min(self.max)
            }
        };
        self.raw = Some(raw);

        apply_jitter(raw, self.jitter)
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let offset = (pseudo_random() * 2.0 - 1.0) * jitter;
    delay.mul_f64((1.0 + offset).max(0.0))
}

/// A cheap, non-cryptographic source of jitter taken from the low bits of the system clock, to
/// avoid pulling in a `rand` dependency for a value that only needs to avoid thundering-herd
/// reconnects, not resist prediction.
fn pseudo_random() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1_000_000) as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_delay_equals_initial_before_jitter() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(120), 1.6, 0.0);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn delay_grows_by_multiplier_and_caps_at_max() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(3), 2.0, 0.0);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        assert_eq!(b.next_delay(), Duration::from_secs(3));
        assert_eq!(b.next_delay(), Duration::from_secs(3));
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(120), 2.0, 0.0);
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_the_configured_fraction() {
        let mut b = Backoff::new(Duration::from_secs(10), Duration::from_secs(120), 1.0, 0.2);
        for _ in 0..50 {
            let d = b.next_delay();
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(12), "{d:?}");
        }
    }
}
