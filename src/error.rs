//! Error types for redelivery
use std::time::Duration;

/// Failure reported by a messaging transport adapter.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// The broker did not accept or confirm a publish.
    #[error("publish to {destination} failed: {reason}")]
    Publish { destination: String, reason: String },
    /// The broker rejected an acknowledgment.
    #[error("acknowledgment of delivery {delivery_id} failed: {reason}")]
    Acknowledge { delivery_id: u64, reason: String },
    /// The underlying session is gone.
    #[error("transport closed")]
    Closed,
}

/// Unified error type for a single publish attempt made by the core.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RedeliveryError {
    /// The transport did not confirm the publish within the configured bound
    #[error("acknowledgment not received after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// The transport reported a failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RedeliveryError {
    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
