//! Bounded wait on a publish acknowledgment

use crate::error::{RedeliveryError, TransportError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Create a timeout policy. Panics if duration is zero.
    pub fn new(duration: Duration) -> Self {
        assert!(duration > Duration::ZERO, "acknowledgment timeout must be non-zero");
        Self { duration }
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run a publish and wait for its confirmation, giving up after the configured duration.
    /// The publish future is dropped on timeout.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, RedeliveryError>
    where
        T: Send,
        Fut: Future<Output = Result<T, TransportError>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result.map_err(RedeliveryError::from),
            Err(_) => Err(RedeliveryError::Timeout {
                elapsed: start.elapsed(),
                timeout: self.duration,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn completes_before_timeout() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(100));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = timeout
            .execute(|| async move {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, TransportError>(42)
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_unconfirmed_publish() {
        let timeout_duration = Duration::from_secs(20);
        let timeout = TimeoutPolicy::new(timeout_duration);

        let result = timeout
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<(), TransportError>(())
            })
            .await;

        match result.unwrap_err() {
            RedeliveryError::Timeout { elapsed, timeout } => {
                assert_eq!(timeout, timeout_duration);
                assert!(elapsed >= timeout_duration, "elapsed should be at least the limit");
            }
            e => panic!("expected Timeout, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn propagates_transport_errors() {
        let timeout = TimeoutPolicy::new(Duration::from_secs(1));

        let result = timeout.execute(|| async { Err::<(), _>(TransportError::Closed) }).await;

        assert_eq!(result.unwrap_err(), RedeliveryError::Transport(TransportError::Closed));
    }

    #[test]
    #[should_panic(expected = "non-zero")]
    fn zero_duration_is_rejected() {
        let _ = TimeoutPolicy::new(Duration::ZERO);
    }
}
