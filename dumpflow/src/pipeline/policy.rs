//! Per-stage execution budget.

use std::time::Duration;

/// Timeout and retry budget of one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagePolicy {
    /// Hard limit for one attempt; `None` runs unbounded.
    pub timeout: Option<Duration>,
    /// Extra attempts after a retryable failure.
    pub max_retries: u32,
}

impl StagePolicy {
    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Total attempts the policy allows.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_single_unbounded_attempt() {
        let policy = StagePolicy::default();
        assert_eq!(policy.timeout, None);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_builder() {
        let policy = StagePolicy::default()
            .with_timeout(Duration::from_secs(240))
            .with_max_retries(1);
        assert_eq!(policy.timeout, Some(Duration::from_secs(240)));
        assert_eq!(policy.max_attempts(), 2);
    }
}
