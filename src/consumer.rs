//! Ingest pipeline for failed messages.
//!
//! [`DeadLetterConsumer`] decides, per message taken off the dead-letter source, whether it
//! is held for a delayed redelivery or has exhausted its retries:
//!
//! 1. Read the retry count from the configured header. Missing or malformed values count as
//!    zero; malformed values are logged.
//! 2. Wait while the engine reports no spare capacity, polling at `poll_interval`.
//! 3. Compute the next delay from the backoff strategy.
//! 4. Within `max_delay`, submit a [`DelayedEnvelope`]. The inbound message stays
//!    unacknowledged until the engine has republished it.
//! 5. Past `max_delay`, publish an unmodified copy to the error destination if one is
//!    configured, then acknowledge the inbound message whatever the outcome.
//!
//! Example
//! ```rust
//! use redeliver::{DeadLetterConsumer, Disposition, InMemoryTransport, InboundMessage,
//!     RedeliveryConfig, RedeliveryEngine};
//! use std::collections::HashMap;
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let config = RedeliveryConfig::builder("orders")
//!     .base_delay(Duration::from_millis(100))
//!     .backoff_factor(2)
//!     .max_delay(Duration::from_secs(1))
//!     .build()
//!     .unwrap();
//! let transport = InMemoryTransport::new();
//! let engine = RedeliveryEngine::new(&config, transport.clone());
//! let consumer = DeadLetterConsumer::new(&config, engine.clone(), transport);
//!
//! let message = InboundMessage::new(1, b"hello".to_vec(), HashMap::new())
//!     .with_header("x-redelivery-count", "3");
//! let disposition = consumer.on_failed_message(message).await;
//! assert_eq!(disposition, Disposition::Scheduled { delay: Duration::from_millis(800) });
//! assert_eq!(engine.len(), 1);
//! # });
//! ```

use crate::backoff::BackoffStrategy;
use crate::config::RedeliveryConfig;
use crate::engine::{panic_reason, RedeliveryQueue};
use crate::envelope::{DelayedEnvelope, RetryCountHeader};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{emit_best_effort, NullSink, RedeliveryEvent, TelemetrySink};
use crate::timeout::TimeoutPolicy;
use crate::transport::{Destination, InboundMessage, OutboundMessage, Transport};
use futures::{FutureExt, Stream, StreamExt};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Outcome of handling one failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Held by the engine for redelivery after `delay`.
    Scheduled { delay: Duration },
    /// Published to the error destination and acknowledged.
    DivertedToErrorSink,
    /// Publishing to the error destination failed or timed out; acknowledged anyway.
    ErrorSinkFailed,
    /// No error destination configured; acknowledged without publishing.
    Discarded,
}

impl Disposition {
    /// Whether the message was handed to the engine.
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled { .. })
    }
}

/// Decides the fate of each failed message.
pub struct DeadLetterConsumer<Q, T, S = NullSink> {
    queue: Q,
    transport: T,
    backoff: Arc<dyn BackoffStrategy>,
    max_delay: Duration,
    retry_count_header: String,
    error_destination: Option<Destination>,
    error_sink_timeout: TimeoutPolicy,
    poll_interval: Duration,
    max_in_flight: usize,
    sleeper: Arc<dyn Sleeper>,
    sink: S,
}

impl<Q, T, S> fmt::Debug for DeadLetterConsumer<Q, T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterConsumer")
            .field("backoff", &self.backoff)
            .field("max_delay", &self.max_delay)
            .field("retry_count_header", &self.retry_count_header)
            .field("error_destination", &self.error_destination)
            .field("error_sink_timeout", &self.error_sink_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("max_in_flight", &self.max_in_flight)
            .field("sleeper", &self.sleeper)
            .finish_non_exhaustive()
    }
}

impl<Q, T> DeadLetterConsumer<Q, T>
where
    Q: RedeliveryQueue,
    T: Transport,
{
    /// Consumer using the configured backoff policy and waiting on the tokio clock.
    pub fn new(config: &RedeliveryConfig, queue: Q, transport: T) -> Self {
        Self {
            queue,
            transport,
            backoff: Arc::new(config.backoff()),
            max_delay: config.max_delay(),
            retry_count_header: config.retry_count_header().to_string(),
            error_destination: config.error_destination().cloned(),
            error_sink_timeout: TimeoutPolicy::new(config.error_sink_timeout()),
            poll_interval: config.poll_interval(),
            max_in_flight: config.max_in_flight(),
            sleeper: Arc::new(TokioSleeper),
            sink: NullSink,
        }
    }
}

impl<Q, T, S> DeadLetterConsumer<Q, T, S> {
    /// Replace how the consumer waits while the engine is full.
    pub fn with_sleeper<Sl>(mut self, sleeper: Sl) -> Self
    where
        Sl: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Replace the backoff strategy.
    pub fn with_backoff<B>(mut self, backoff: B) -> Self
    where
        B: BackoffStrategy + 'static,
    {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Report decisions to `sink`.
    pub fn with_sink<S2>(self, sink: S2) -> DeadLetterConsumer<Q, T, S2> {
        DeadLetterConsumer {
            queue: self.queue,
            transport: self.transport,
            backoff: self.backoff,
            max_delay: self.max_delay,
            retry_count_header: self.retry_count_header,
            error_destination: self.error_destination,
            error_sink_timeout: self.error_sink_timeout,
            poll_interval: self.poll_interval,
            max_in_flight: self.max_in_flight,
            sleeper: self.sleeper,
            sink,
        }
    }
}

impl<Q, T, S> DeadLetterConsumer<Q, T, S>
where
    Q: RedeliveryQueue + 'static,
    T: Transport,
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    /// Handle one failed message. Never fails; problems are logged and reflected in the
    /// returned [`Disposition`].
    pub async fn on_failed_message(&self, message: InboundMessage) -> Disposition {
        let delivery_id = message.delivery_id();

        let header = RetryCountHeader::read(message.headers(), &self.retry_count_header);
        if let RetryCountHeader::Malformed(value) = header {
            tracing::warn!(
                delivery_id,
                header = %self.retry_count_header,
                value,
                "invalid retry count; treating as first failure"
            );
            self.emit(RedeliveryEvent::MalformedRetryCount { delivery_id }).await;
        }
        let retry_count = header.count();

        while !self.queue.can_accept_task() {
            tracing::warn!(
                delivery_id,
                poll_interval = ?self.poll_interval,
                "redelivery engine is full; waiting for capacity"
            );
            self.emit(RedeliveryEvent::EngineFull { delivery_id }).await;
            self.sleeper.sleep(self.poll_interval).await;
        }

        let delay = self.backoff.next_delay(retry_count);
        if delay > self.max_delay {
            return self.exhaust(message, retry_count, delay).await;
        }

        match DelayedEnvelope::after(message, delay) {
            Ok(envelope) => {
                self.queue.submit(envelope);
                tracing::info!(delivery_id, retry_count, ?delay, "scheduled delayed redelivery");
                self.emit(RedeliveryEvent::Scheduled { delivery_id, retry_count, delay }).await;
                Disposition::Scheduled { delay }
            }
            Err(message) => self.exhaust(message, retry_count, delay).await,
        }
    }

    /// Handle every message from `messages` on its own task. At most `max_in_flight`
    /// messages are undecided at once; the stream is not polled again until one of them is
    /// decided, so a full engine slows the source instead of buffering its messages.
    /// Returns once the stream ends and every handler has finished.
    pub async fn run<St>(self: Arc<Self>, messages: St)
    where
        St: Stream<Item = InboundMessage>,
    {
        let mut messages = std::pin::pin!(messages);
        let mut handlers = JoinSet::new();
        let in_flight = Arc::new(Semaphore::new(self.max_in_flight));

        loop {
            let Ok(permit) = Arc::clone(&in_flight).acquire_owned().await else {
                break;
            };
            let Some(message) = messages.next().await else {
                break;
            };
            let consumer = Arc::clone(&self);
            handlers.spawn(async move {
                let disposition = consumer.on_failed_message(message).await;
                drop(permit);
                disposition
            });
            while let Some(finished) = handlers.try_join_next() {
                log_handler_result(finished);
            }
        }

        tracing::debug!(pending = handlers.len(), "failed-message stream ended");
        while let Some(finished) = handlers.join_next().await {
            log_handler_result(finished);
        }
    }

    async fn exhaust(&self, message: InboundMessage, retry_count: u32, delay: Duration) -> Disposition {
        let delivery_id = message.delivery_id();

        let (disposition, event) = match &self.error_destination {
            Some(destination) => {
                tracing::warn!(
                    delivery_id,
                    retry_count,
                    ?delay,
                    max_delay = ?self.max_delay,
                    destination = %destination,
                    "delay threshold exceeded; publishing to error destination"
                );
                let copy = OutboundMessage::copy_of(&message);
                let published = AssertUnwindSafe(
                    self.error_sink_timeout.execute(|| self.transport.publish(destination, copy)),
                )
                .catch_unwind()
                .await;
                match published {
                    Ok(Ok(())) => (
                        Disposition::DivertedToErrorSink,
                        RedeliveryEvent::DivertedToErrorSink { delivery_id, retry_count },
                    ),
                    Err(panic) => {
                        tracing::error!(
                            delivery_id,
                            destination = %destination,
                            reason = panic_reason(panic.as_ref()),
                            "publish to error destination panicked; message is lost"
                        );
                        (
                            Disposition::ErrorSinkFailed,
                            RedeliveryEvent::ErrorSinkFailed {
                                delivery_id,
                                retry_count,
                                timed_out: false,
                            },
                        )
                    }
                    Ok(Err(e)) => {
                        tracing::error!(
                            delivery_id,
                            destination = %destination,
                            error = %e,
                            "unable to publish message to error destination; message is lost"
                        );
                        (
                            Disposition::ErrorSinkFailed,
                            RedeliveryEvent::ErrorSinkFailed {
                                delivery_id,
                                retry_count,
                                timed_out: e.is_timeout(),
                            },
                        )
                    }
                }
            }
            None => {
                tracing::warn!(
                    delivery_id,
                    retry_count,
                    ?delay,
                    max_delay = ?self.max_delay,
                    "delay threshold exceeded and no error destination configured; discarding message"
                );
                (Disposition::Discarded, RedeliveryEvent::Discarded { delivery_id, retry_count })
            }
        };

        if let Err(e) = self.transport.acknowledge(&message).await {
            tracing::error!(delivery_id, error = %e, "unable to acknowledge dead-lettered message");
        }
        self.emit(event).await;
        disposition
    }

    async fn emit(&self, event: RedeliveryEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}

fn log_handler_result(result: Result<Disposition, tokio::task::JoinError>) {
    match result {
        Ok(disposition) => tracing::trace!(?disposition, "failed message handled"),
        Err(e) => tracing::error!(error = %e, "failed-message handler did not complete"),
    }
}
