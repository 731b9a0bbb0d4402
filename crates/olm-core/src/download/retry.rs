//! Bounded retry with a fixed, interruptible back-off.

use std::time::Duration;

use super::control::{ControlSignal, TaskControl};
use crate::config::DownloadSettings;

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before each retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Policy from download settings.
    #[must_use]
    pub fn from_settings(settings: &DownloadSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff: settings.retry_backoff(),
        }
    }

    /// True when attempt number `attempt` (0-based) may be followed by another.
    #[must_use]
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Sleep for the back-off. Returns early with the signal if the task is
    /// paused or cancelled meanwhile.
    pub async fn wait(&self, control: &TaskControl) -> Option<ControlSignal> {
        tokio::select! {
            biased;
            signal = control.stopped() => Some(signal),
            () = tokio::time::sleep(self.backoff) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry(0));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[tokio::test]
    async fn test_wait_interrupted_by_cancel() {
        let policy = RetryPolicy {
            max_retries: 1,
            backoff: Duration::from_secs(60),
        };
        let control = TaskControl::new();
        control.cancel();
        assert_eq!(policy.wait(&control).await, Some(ControlSignal::Cancel));
    }

    #[tokio::test]
    async fn test_wait_elapses() {
        let policy = RetryPolicy {
            max_retries: 1,
            backoff: Duration::from_millis(5),
        };
        assert_eq!(policy.wait(&TaskControl::new()).await, None);
    }
}
