//! Backoff strategy for task-group penalties.

use rand::Rng;

/// Produces the next penalty after a failed scheduling attempt.
pub trait BackoffStrategy: Send + Sync {
    fn initial_ms(&self) -> u64;
    fn next_ms(&self, current_ms: u64) -> u64;
}

/// Doubles the penalty up to a cap, with ±10% jitter to spread group
/// wake-ups.
#[derive(Debug, Clone)]
pub struct TruncatedBinaryBackoff {
    initial_ms: u64,
    max_ms: u64,
    jitter: bool,
}

impl TruncatedBinaryBackoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial_ms: initial_ms.max(1),
            max_ms: max_ms.max(initial_ms.max(1)),
            jitter: true,
        }
    }

    /// Deterministic variant for tests.
    pub fn without_jitter(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            jitter: false,
            ..Self::new(initial_ms, max_ms)
        }
    }
}

impl BackoffStrategy for TruncatedBinaryBackoff {
    fn initial_ms(&self) -> u64 {
        self.initial_ms
    }

    fn next_ms(&self, current_ms: u64) -> u64 {
        let doubled = current_ms.saturating_mul(2).clamp(self.initial_ms, self.max_ms);
        if !self.jitter {
            return doubled;
        }
        let spread = (doubled / 10).max(1);
        let jitter = rand::thread_rng().gen_range(0..=spread * 2);
        (doubled + jitter).saturating_sub(spread).clamp(1, self.max_ms)
    }
}
