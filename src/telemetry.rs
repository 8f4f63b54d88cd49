//! Telemetry for redelivery decisions.
//!
//! Every disposition the engine and the ingest side reach is also emitted as a
//! [`RedeliveryEvent`] to a pluggable sink. Log records remain the primary failure surface;
//! sinks exist for collaborators that want the same information as data.
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait defines how events are consumed. It's implemented
//! as a `tower::Service<RedeliveryEvent>` for composability.
//!
//! ```rust
//! use redeliver::telemetry::{MemorySink, RedeliveryEvent};
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let sink = MemorySink::with_capacity(16);
//! redeliver::telemetry::emit_best_effort(
//!     sink.clone(),
//!     RedeliveryEvent::Scheduled { delivery_id: 1, retry_count: 0, delay: Duration::from_secs(1) },
//! )
//! .await;
//! assert_eq!(sink.len(), 1);
//! # });
//! ```

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// Events emitted while handling failed messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeliveryEvent {
    /// A message was handed to the engine for delayed redelivery.
    Scheduled { delivery_id: u64, retry_count: u32, delay: Duration },
    /// The engine republished a message to its source destination.
    Redelivered { delivery_id: u64, retry_count: u32 },
    /// Republishing failed or was not confirmed in time; the attempt is abandoned.
    RedeliveryFailed { delivery_id: u64, retry_count: u32, timed_out: bool },
    /// A message past the delay threshold was published to the error sink.
    DivertedToErrorSink { delivery_id: u64, retry_count: u32 },
    /// Publishing to the error sink failed; the message is lost.
    ErrorSinkFailed { delivery_id: u64, retry_count: u32, timed_out: bool },
    /// A message past the delay threshold was dropped because no error sink is configured.
    Discarded { delivery_id: u64, retry_count: u32 },
    /// The ingest side found the engine full and is waiting.
    EngineFull { delivery_id: u64 },
    /// The retry-count header could not be parsed.
    MalformedRetryCount { delivery_id: u64 },
    /// A release task panicked; the worker kept running.
    ReleasePanicked,
}

impl fmt::Display for RedeliveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled { delivery_id, retry_count, delay } => write!(
                f,
                "Scheduled(#{}, retry={}, delay={:?})",
                delivery_id, retry_count, delay
            ),
            Self::Redelivered { delivery_id, retry_count } => {
                write!(f, "Redelivered(#{}, retry={})", delivery_id, retry_count)
            }
            Self::RedeliveryFailed { delivery_id, retry_count, timed_out } => write!(
                f,
                "RedeliveryFailed(#{}, retry={}, timed_out={})",
                delivery_id, retry_count, timed_out
            ),
            Self::DivertedToErrorSink { delivery_id, retry_count } => {
                write!(f, "DivertedToErrorSink(#{}, retry={})", delivery_id, retry_count)
            }
            Self::ErrorSinkFailed { delivery_id, retry_count, timed_out } => write!(
                f,
                "ErrorSinkFailed(#{}, retry={}, timed_out={})",
                delivery_id, retry_count, timed_out
            ),
            Self::Discarded { delivery_id, retry_count } => {
                write!(f, "Discarded(#{}, retry={})", delivery_id, retry_count)
            }
            Self::EngineFull { delivery_id } => write!(f, "EngineFull(#{})", delivery_id),
            Self::MalformedRetryCount { delivery_id } => {
                write!(f, "MalformedRetryCount(#{})", delivery_id)
            }
            Self::ReleasePanicked => write!(f, "ReleasePanicked"),
        }
    }
}

/// A telemetry sink that consumes redelivery events.
pub trait TelemetrySink:
    tower::Service<RedeliveryEvent, Response = (), Error = Self::SinkError>
    + Clone
    + Send
    + Sync
    + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// A sink that is not ready or fails simply loses the event.
pub async fn emit_best_effort<S>(sink: S, event: RedeliveryEvent)
where
    S: tower::Service<RedeliveryEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

type SinkFuture = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<RedeliveryEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: RedeliveryEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<RedeliveryEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RedeliveryEvent) -> Self::Future {
        tracing::info!(event = %event, "redelivery_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that keeps the most recent events in memory.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<RedeliveryEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<RedeliveryEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<RedeliveryEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<RedeliveryEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RedeliveryEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
