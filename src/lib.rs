#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # redeliver
//!
//! Delayed redelivery for messages that failed processing and landed on a dead-letter
//! destination.
//!
//! ## Features
//!
//! - **Exponential backoff** keyed on a retry-count header carried by the message
//! - **Redelivery engine** holding messages in memory until their release time, then
//!   republishing them to the source destination with the count incremented
//! - **Error destination** for messages whose next delay exceeds the configured threshold
//! - **Backpressure**: ingest waits while the engine is at capacity
//! - **Transport seam** so any broker adapter can plug in (see `redeliver-nats`)
//!
//! ## Quick Start
//!
//! ```rust
//! use redeliver::{DeadLetterConsumer, InMemoryTransport, InboundMessage, RedeliveryConfig,
//!     RedeliveryEngine};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RedeliveryConfig::builder("orders")
//!         .base_delay(Duration::from_millis(10))
//!         .backoff_factor(2)
//!         .max_delay(Duration::from_secs(5))
//!         .error_destination("orders.errors")
//!         .build()
//!         .unwrap();
//!
//!     let transport = InMemoryTransport::new();
//!     let engine = RedeliveryEngine::new(&config, transport.clone());
//!     engine.start();
//!
//!     let consumer = Arc::new(DeadLetterConsumer::new(&config, engine, transport.clone()));
//!     let failed = futures::stream::iter(vec![
//!         InboundMessage::new(1, b"order-1".to_vec(), Default::default()),
//!     ]);
//!     consumer.run(failed).await;
//!
//!     tokio::time::sleep(Duration::from_millis(100)).await;
//!     assert_eq!(transport.acknowledged(), vec![1]);
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod sleeper;
pub mod telemetry;
pub mod timeout;
pub mod transport;

// Re-exports
pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use config::{ConfigError, RedeliveryConfig, RedeliveryConfigBuilder};
pub use consumer::{DeadLetterConsumer, Disposition};
pub use engine::{RedeliveryEngine, RedeliveryQueue};
pub use envelope::{DelayedEnvelope, RetryCountHeader};
pub use error::{RedeliveryError, TransportError};
pub use sleeper::{SleepFuture, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{LogSink, MemorySink, NullSink, RedeliveryEvent, TelemetrySink};
pub use timeout::TimeoutPolicy;
pub use transport::{
    Destination, Headers, InMemoryTransport, InboundMessage, OutboundMessage, PublishBehavior,
    PublishRecord, Transport,
};
