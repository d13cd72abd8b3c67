use std::sync::atomic::{AtomicI64, Ordering};

/// Token-bucket retry throttle shared by every RPC on a channel.
///
/// A failed RPC costs one token, a successful RPC refunds `token_ratio` tokens, and retries are
/// permitted only while more than half the bucket remains. Tokens are stored in tenths so the
/// fractional ratio can be applied with integer arithmetic, keeping concurrent updates a single
/// atomic add.
#[derive(Debug)]
pub struct RetryThrottle {
    /// Current fill level, in tenths of a token.
    tokens: AtomicI64,
    max_tokens: i64,
    token_ratio: i64,
}

impl RetryThrottle {
    pub fn new(max_tokens: u32, token_ratio: f32) -> Self {
        let max_tokens = i64::from(max_tokens) * 10;
        Self {
            tokens: AtomicI64::new(max_tokens),
            max_tokens,
            token_ratio: (f64::from(token_ratio) * 10.0).round() as i64,
        }
    }

    /// True while the bucket is above half full; retry layers must not retry otherwise.
    pub fn is_retry_allowed(&self) -> bool {
        self.tokens.load(Ordering::Relaxed) > self.max_tokens / 2
    }

    pub fn record_failure(&self) {
        self.update(-10);
    }

    pub fn record_success(&self) {
        self.update(self.token_ratio);
    }

    fn update(&self, delta: i64) {
        let max = self.max_tokens;
        let _ = self
            .tokens
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |t| {
                Some((t + delta).clamp(0, max))
            });
    }

    #[cfg(test)]
    fn tokens(&self) -> f64 {
        self.tokens.load(Ordering::Relaxed) as f64 / 10.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full_and_allows_retries() {
        let t = RetryThrottle::new(10, 0.1);
        assert_eq!(t.tokens(), 10.0);
        assert!(t.is_retry_allowed());
    }

    #[test]
    fn failures_drain_to_the_midpoint_and_block_retries() {
        let t = RetryThrottle::new(10, 0.1);
        for _ in 0..5 {
            t.record_failure();
        }
        // Exactly half full: not strictly above the midpoint, so retries stop.
        assert_eq!(t.tokens(), 5.0);
        assert!(!t.is_retry_allowed());
    }

    #[test]
    fn successes_refund_the_configured_ratio() {
        let t = RetryThrottle::new(10, 0.1);
        for _ in 0..6 {
            t.record_failure();
        }
        assert!(!t.is_retry_allowed());

        // 0.1 tokens per success: eleven successes crosses back over the midpoint.
        for _ in 0..11 {
            t.record_success();
        }
        assert_eq!(t.tokens(), 5.1);
        assert!(t.is_retry_allowed());
    }

    #[test]
    fn bucket_never_goes_below_zero_or_above_max() {
        let t = RetryThrottle::new(2, 1.0);
        for _ in 0..10 {
            t.record_failure();
        }
        assert_eq!(t.tokens(), 0.0);
        for _ in 0..10 {
            t.record_success();
        }
        assert_eq!(t.tokens(), 2.0);
    }
}
