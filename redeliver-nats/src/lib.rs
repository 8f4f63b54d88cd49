//! NATS companion crate for `redeliver`.
//!
//! Default build ships [`NatsSink`] as a no-op telemetry sink and the JSON encoding of
//! [`RedeliveryEvent`]s. Enable the `client` feature to publish events to a subject and to
//! use [`NatsTransport`], a [`redeliver::Transport`] over a NATS connection.
//!
//! ```toml
//! redeliver-nats = { version = "0.1", features = ["client"] }
//! ```
//!
//! ```rust
//! use redeliver_nats::event_to_json;
//! use redeliver::RedeliveryEvent;
//!
//! let json = event_to_json(&RedeliveryEvent::Redelivered { delivery_id: 3, retry_count: 2 });
//! assert_eq!(json["kind"], "redelivered");
//! ```

use redeliver::telemetry::{RedeliveryEvent, TelemetrySink};
use serde_json::json;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

#[cfg(feature = "client")]
mod transport;
#[cfg(feature = "client")]
pub use transport::NatsTransport;

/// Publishes redelivery events as JSON to a NATS subject.
#[derive(Clone, Debug)]
pub struct NatsSink {
    subject: String,
    #[cfg(feature = "client")]
    client: nats::asynk::Connection,
}

impl NatsSink {
    #[cfg(feature = "client")]
    pub fn new(client: nats::asynk::Connection, subject: impl Into<String>) -> Self {
        Self { subject: subject.into(), client }
    }

    /// Sink that drops every event; the only constructor without the `client` feature.
    #[cfg(not(feature = "client"))]
    pub fn new(subject: impl Into<String>) -> Self {
        Self { subject: subject.into() }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl tower_service::Service<RedeliveryEvent> for NatsSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RedeliveryEvent) -> Self::Future {
        #[cfg(feature = "client")]
        let fut = {
            let subject = self.subject.clone();
            let client = self.client.clone();
            let payload =
                serde_json::to_vec(&event_to_json(&event)).unwrap_or_else(|_| b"{}".to_vec());
            Box::pin(async move {
                if let Err(e) = client.publish(&subject, payload).await {
                    tracing::debug!(subject = %subject, error = %e, "dropping redelivery event");
                }
                Ok(())
            }) as Self::Future
        };

        #[cfg(not(feature = "client"))]
        let fut = {
            let _ = event;
            Box::pin(async move { Ok(()) }) as Self::Future
        };

        fut
    }
}

impl TelemetrySink for NatsSink {
    type SinkError = Infallible;
}

/// JSON shape published for each event. Durations are reported in milliseconds.
pub fn event_to_json(event: &RedeliveryEvent) -> serde_json::Value {
    match event {
        RedeliveryEvent::Scheduled { delivery_id, retry_count, delay } => json!({
            "kind": "scheduled",
            "delivery_id": delivery_id,
            "retry_count": retry_count,
            "delay_ms": delay.as_millis() as u64,
        }),
        RedeliveryEvent::Redelivered { delivery_id, retry_count } => {
            json!({ "kind": "redelivered", "delivery_id": delivery_id, "retry_count": retry_count })
        }
        RedeliveryEvent::RedeliveryFailed { delivery_id, retry_count, timed_out } => json!({
            "kind": "redelivery_failed",
            "delivery_id": delivery_id,
            "retry_count": retry_count,
            "timed_out": timed_out,
        }),
        RedeliveryEvent::DivertedToErrorSink { delivery_id, retry_count } => json!({
            "kind": "diverted_to_error_sink",
            "delivery_id": delivery_id,
            "retry_count": retry_count,
        }),
        RedeliveryEvent::ErrorSinkFailed { delivery_id, retry_count, timed_out } => json!({
            "kind": "error_sink_failed",
            "delivery_id": delivery_id,
            "retry_count": retry_count,
            "timed_out": timed_out,
        }),
        RedeliveryEvent::Discarded { delivery_id, retry_count } => {
            json!({ "kind": "discarded", "delivery_id": delivery_id, "retry_count": retry_count })
        }
        RedeliveryEvent::EngineFull { delivery_id } => {
            json!({ "kind": "engine_full", "delivery_id": delivery_id })
        }
        RedeliveryEvent::MalformedRetryCount { delivery_id } => {
            json!({ "kind": "malformed_retry_count", "delivery_id": delivery_id })
        }
        RedeliveryEvent::ReleasePanicked => json!({ "kind": "release_panicked" }),
    }
}
