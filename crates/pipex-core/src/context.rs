use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Execution context threaded through `Source::generate`, `Transformer::transform`,
/// and `Sink::process`. Named for the original's `We` object: the thing the
/// chain runs "in".
///
/// Carries a cooperative cancellation flag rather than a hard kill switch —
/// long-running generators are expected to check [`We::is_cancelled`]
/// between records and stop yielding, the same contract the original's
/// `Worker._check_interrupt` enforced.
#[derive(Debug, Clone, Default)]
pub struct We {
    cancelled: Arc<AtomicBool>,
}

impl We {
    pub fn new() -> Self {
        We::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// A handle sharing the same cancellation flag, for handing to a
    /// producer/worker thread that needs to both observe and set it.
    pub fn share(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_observed_through_shared_handles() {
        let we = We::new();
        let other = we.share();
        assert!(!other.is_cancelled());
        we.cancel();
        assert!(other.is_cancelled());
    }
}
