//! Redelivery engine.
//!
//! Holds [`DelayedEnvelope`]s in a min-heap keyed by release time and runs one release
//! worker that waits for the earliest envelope to come due, then republishes it to the
//! source destination on its own task.
//!
//! Semantics:
//! - `can_accept_task` is an advisory capacity check. `submit` never blocks and never
//!   rejects, so concurrent producers that each saw spare capacity can overshoot it slightly.
//! - Envelopes are never released before their release time. Envelopes due at the same
//!   instant are released in no particular order.
//! - Each release runs independently; a slow or stalled publish does not hold back the next
//!   due envelope. A release that panics is logged and the worker keeps going; a panic inside
//!   the publish still leads to the acknowledgment.
//! - Whatever the publish outcome, the inbound message is acknowledged exactly once after
//!   the publish attempt. Failed republishes are not retried.
//! - Envelopes live in memory only and are lost on shutdown.
//!
//! Example
//! ```rust
//! use redeliver::{DelayedEnvelope, InMemoryTransport, InboundMessage, RedeliveryConfig,
//!     RedeliveryEngine, RedeliveryQueue};
//! use std::collections::HashMap;
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let config = RedeliveryConfig::builder("orders").capacity(10).build().unwrap();
//! let transport = InMemoryTransport::new();
//! let engine = RedeliveryEngine::new(&config, transport.clone());
//! engine.start();
//!
//! let message = InboundMessage::new(1, b"hello".to_vec(), HashMap::new());
//! engine.submit(DelayedEnvelope::after(message, Duration::from_millis(5)).unwrap());
//! assert!(engine.can_accept_task());
//! # tokio::time::sleep(Duration::from_millis(100)).await;
//! # assert_eq!(transport.acknowledged(), vec![1]);
//! # });
//! ```

use crate::config::RedeliveryConfig;
use crate::envelope::{DelayedEnvelope, RetryCountHeader};
use crate::telemetry::{emit_best_effort, NullSink, RedeliveryEvent, TelemetrySink};
use crate::timeout::TimeoutPolicy;
use crate::transport::{Destination, OutboundMessage, Transport};
use futures::FutureExt;
use std::any::Any;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Admission side of a redelivery engine.
pub trait RedeliveryQueue: Send + Sync {
    /// Hold an envelope until its release time. Never blocks and does not enforce capacity;
    /// callers check [`can_accept_task`](Self::can_accept_task) first.
    fn submit(&self, envelope: DelayedEnvelope);

    /// Whether fewer envelopes than the configured capacity are currently held.
    fn can_accept_task(&self) -> bool;
}

impl<Q: RedeliveryQueue + ?Sized> RedeliveryQueue for Arc<Q> {
    fn submit(&self, envelope: DelayedEnvelope) {
        (**self).submit(envelope)
    }

    fn can_accept_task(&self) -> bool {
        (**self).can_accept_task()
    }
}

/// Delay-release engine that republishes due envelopes to their source destination.
pub struct RedeliveryEngine<T, S = NullSink> {
    transport: T,
    source: Destination,
    retry_count_header: String,
    republish_timeout: TimeoutPolicy,
    capacity: usize,
    held: Mutex<BinaryHeap<DelayedEnvelope>>,
    wake: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
    sink: S,
}

impl<T, S> std::fmt::Debug for RedeliveryEngine<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedeliveryEngine")
            .field("source", &self.source)
            .field("retry_count_header", &self.retry_count_header)
            .field("republish_timeout", &self.republish_timeout)
            .field("capacity", &self.capacity)
            .field("held", &lock(&self.held).len())
            .field("transport", &"<transport>")
            .field("sink", &"<sink>")
            .finish()
    }
}

impl<T: Transport> RedeliveryEngine<T> {
    /// Create an engine. The release worker does not run until [`start`](Self::start).
    pub fn new(config: &RedeliveryConfig, transport: T) -> Arc<Self> {
        Self::with_sink(config, transport, NullSink)
    }
}

impl<T, S> RedeliveryEngine<T, S>
where
    T: Transport,
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    /// Create an engine that reports its decisions to `sink`.
    pub fn with_sink(config: &RedeliveryConfig, transport: T, sink: S) -> Arc<Self> {
        Arc::new(Self {
            transport,
            source: config.source_destination().clone(),
            retry_count_header: config.retry_count_header().to_string(),
            republish_timeout: TimeoutPolicy::new(config.republish_timeout()),
            capacity: config.capacity(),
            held: Mutex::new(BinaryHeap::with_capacity(config.capacity())),
            wake: Notify::new(),
            worker: Mutex::new(None),
            sink,
        })
    }

    /// Spawn the release worker on the current tokio runtime. Calling it again while the
    /// worker is running has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut worker = lock(&self.worker);
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::debug!("redelivery worker already running");
            return;
        }
        tracing::info!(
            source = %self.source,
            capacity = self.capacity,
            "starting redelivery worker"
        );
        *worker = Some(tokio::spawn(Arc::clone(self).release_loop()));
    }

    /// Stop the release worker. Held envelopes stay in memory and are released again after
    /// a later [`start`](Self::start); releases already dispatched run to completion.
    pub fn shutdown(&self) {
        if let Some(handle) = lock(&self.worker).take() {
            handle.abort();
            tracing::info!(held = self.len(), "redelivery worker stopped");
        }
    }

    /// Number of envelopes currently held.
    pub fn len(&self) -> usize {
        lock(&self.held).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.held).is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Release time of the next envelope to come due, if any.
    pub fn next_release_at(&self) -> Option<Instant> {
        lock(&self.held).peek().map(DelayedEnvelope::release_at)
    }

    /// Republish one envelope to the source destination and acknowledge the inbound copy.
    ///
    /// The retry-count header is incremented (a malformed value restarts at one), all other
    /// headers and the payload are carried over unchanged. Publish failures, timeouts and
    /// panics are logged and not retried; the inbound message is acknowledged regardless.
    pub async fn redeliver(&self, envelope: DelayedEnvelope) {
        let message = envelope.into_message();
        let delivery_id = message.delivery_id();

        let header = RetryCountHeader::read(message.headers(), &self.retry_count_header);
        if let RetryCountHeader::Malformed(value) = header {
            tracing::error!(
                delivery_id,
                header = %self.retry_count_header,
                value,
                "invalid retry count on redelivery; resetting the counter"
            );
        }
        let retry_count = header.incremented();

        let mut outbound = OutboundMessage::copy_of(&message);
        outbound.headers.insert(self.retry_count_header.clone(), retry_count.to_string());

        tracing::info!(delivery_id, retry_count, destination = %self.source, "redelivering message");
        let published = AssertUnwindSafe(
            self.republish_timeout.execute(|| self.transport.publish(&self.source, outbound)),
        )
        .catch_unwind()
        .await;

        let event = match published {
            Ok(Ok(())) => RedeliveryEvent::Redelivered { delivery_id, retry_count },
            Err(panic) => {
                tracing::error!(
                    delivery_id,
                    retry_count,
                    destination = %self.source,
                    reason = panic_reason(panic.as_ref()),
                    "republish panicked"
                );
                RedeliveryEvent::ReleasePanicked
            }
            Ok(Err(e)) => {
                tracing::error!(
                    delivery_id,
                    retry_count,
                    destination = %self.source,
                    error = %e,
                    "unable to republish message to its source"
                );
                RedeliveryEvent::RedeliveryFailed {
                    delivery_id,
                    retry_count,
                    timed_out: e.is_timeout(),
                }
            }
        };

        if let Err(e) = self.transport.acknowledge(&message).await {
            tracing::error!(delivery_id, error = %e, "unable to acknowledge dead-lettered message");
        }
        self.emit(event).await;
    }

    async fn release_loop(self: Arc<Self>) {
        loop {
            let envelope = self.next_due().await;
            tokio::spawn(Arc::clone(&self).release(envelope));
        }
    }

    /// Wait until the earliest envelope is due and take it.
    async fn next_due(&self) -> DelayedEnvelope {
        loop {
            let next_release = {
                let mut held = lock(&self.held);
                let now = Instant::now();
                match held.peek().map(|head| (head.is_due(now), head.release_at())) {
                    Some((true, _)) => {
                        if let Some(envelope) = held.pop() {
                            return envelope;
                        }
                        None
                    }
                    head => head.map(|(_, release_at)| release_at),
                }
            };

            match next_release {
                Some(release_at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(release_at) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                None => self.wake.notified().await,
            }
        }
    }

    async fn release(self: Arc<Self>, envelope: DelayedEnvelope) {
        let released = AssertUnwindSafe(self.redeliver(envelope)).catch_unwind().await;
        if let Err(panic) = released {
            tracing::error!(reason = panic_reason(panic.as_ref()), "redelivery task panicked");
            self.emit(RedeliveryEvent::ReleasePanicked).await;
        }
    }

    async fn emit(&self, event: RedeliveryEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}

impl<T, S> RedeliveryQueue for RedeliveryEngine<T, S>
where
    T: Transport,
    S: Send + Sync,
{
    fn submit(&self, envelope: DelayedEnvelope) {
        let release_at = envelope.release_at();
        let earliest = {
            let mut held = lock(&self.held);
            let earliest = match held.peek() {
                Some(head) => release_at < head.release_at(),
                None => true,
            };
            held.push(envelope);
            earliest
        };
        if earliest {
            // the worker may be sleeping toward a later envelope
            self.wake.notify_one();
        }
    }

    fn can_accept_task(&self) -> bool {
        lock(&self.held).len() < self.capacity
    }
}

pub(crate) fn panic_reason(panic: &(dyn Any + Send)) -> &str {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        reason
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        reason
    } else {
        "<non-string panic>"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;
    use crate::transport::{Headers, InMemoryTransport, InboundMessage, PublishBehavior};
    use std::time::Duration;

    fn config(capacity: usize) -> RedeliveryConfig {
        RedeliveryConfig::builder("SOURCE_QUEUE")
            .capacity(capacity)
            .retry_count_header("sol_rx_delivery_count")
            .republish_timeout(Duration::from_secs(20))
            .build()
            .unwrap()
    }

    fn message(id: u64) -> InboundMessage {
        InboundMessage::new(id, b"HELLO_WORLD".to_vec(), Headers::new())
    }

    fn due_in(id: u64, delay: Duration) -> DelayedEnvelope {
        DelayedEnvelope::after(message(id), delay).unwrap()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn can_accept_task_is_strictly_below_capacity() {
        let engine = RedeliveryEngine::new(&config(2), InMemoryTransport::new());
        assert!(engine.can_accept_task());
        engine.submit(due_in(1, Duration::from_secs(5)));
        assert!(engine.can_accept_task());
        engine.submit(due_in(2, Duration::from_secs(5)));
        assert!(!engine.can_accept_task());
        assert_eq!(engine.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_does_not_enforce_capacity() {
        let engine = RedeliveryEngine::new(&config(1), InMemoryTransport::new());
        for id in 0..3 {
            engine.submit(due_in(id, Duration::from_secs(1)));
        }
        assert_eq!(engine.len(), 3);
        assert!(!engine.can_accept_task());
    }

    #[tokio::test(start_paused = true)]
    async fn redeliver_increments_header_and_preserves_others() {
        let transport = InMemoryTransport::new();
        let engine = RedeliveryEngine::new(&config(10), transport.clone());
        let inbound = message(11)
            .with_header("sol_rx_delivery_count", "1")
            .with_header("HEADER1", "1");

        engine.redeliver(DelayedEnvelope::after(inbound, Duration::ZERO).unwrap()).await;

        let sent = transport.published_to(&Destination::from("SOURCE_QUEUE"));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, b"HELLO_WORLD");
        assert_eq!(sent[0].headers.get("sol_rx_delivery_count").map(String::as_str), Some("2"));
        assert_eq!(sent[0].headers.get("HEADER1").map(String::as_str), Some("1"));
        assert_eq!(sent[0].headers.len(), 2);
        assert_eq!(transport.acknowledged(), vec![11]);
    }

    #[tokio::test(start_paused = true)]
    async fn first_redelivery_stamps_count_of_one() {
        let transport = InMemoryTransport::new();
        let engine = RedeliveryEngine::new(&config(10), transport.clone());
        let inbound = message(1).with_header("HEADER1", "1");

        engine.redeliver(DelayedEnvelope::after(inbound, Duration::ZERO).unwrap()).await;

        let sent = transport.published_to(&Destination::from("SOURCE_QUEUE"));
        assert_eq!(sent[0].headers.get("sol_rx_delivery_count").map(String::as_str), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_count_restarts_at_one() {
        let transport = InMemoryTransport::new();
        let engine = RedeliveryEngine::new(&config(10), transport.clone());
        let inbound = message(1).with_header("sol_rx_delivery_count", "abc");

        engine.redeliver(DelayedEnvelope::after(inbound, Duration::ZERO).unwrap()).await;

        let sent = transport.published_to(&Destination::from("SOURCE_QUEUE"));
        assert_eq!(sent[0].headers.get("sol_rx_delivery_count").map(String::as_str), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_republish_still_acknowledges_once() {
        let transport = InMemoryTransport::new();
        transport.fail_publishes_to("SOURCE_QUEUE");
        let sink = MemorySink::new();
        let engine = RedeliveryEngine::with_sink(&config(10), transport.clone(), sink.clone());

        engine.redeliver(due_in(4, Duration::ZERO)).await;

        assert_eq!(transport.published().len(), 1, "failed publish is not retried");
        assert_eq!(transport.acknowledged(), vec![4]);
        assert_eq!(
            sink.events(),
            vec![RedeliveryEvent::RedeliveryFailed { delivery_id: 4, retry_count: 1, timed_out: false }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_republish_times_out_then_acknowledges() {
        let transport = InMemoryTransport::new();
        transport.script(|_, _| PublishBehavior::Stall);
        let sink = MemorySink::new();
        let engine = RedeliveryEngine::with_sink(&config(10), transport.clone(), sink.clone());

        let started = Instant::now();
        engine.redeliver(due_in(8, Duration::ZERO)).await;

        assert!(started.elapsed() >= Duration::from_secs(20));
        assert_eq!(transport.acknowledged(), vec![8]);
        assert!(matches!(
            sink.events().as_slice(),
            [RedeliveryEvent::RedeliveryFailed { timed_out: true, .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn never_releases_early() {
        let transport = InMemoryTransport::new();
        let engine = RedeliveryEngine::new(&config(10), transport.clone());
        let submitted_at = Instant::now();
        engine.submit(due_in(1, Duration::from_secs(5)));
        engine.start();

        tokio::time::sleep(Duration::from_millis(4_999)).await;
        settle().await;
        assert!(transport.published().is_empty());
        assert_eq!(engine.len(), 1);

        tokio::time::sleep(Duration::from_millis(2)).await;
        settle().await;
        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert!(published[0].at >= submitted_at + Duration::from_secs(5));
        assert_eq!(transport.acknowledged(), vec![1]);
        assert!(engine.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn releases_in_due_order_regardless_of_submit_order() {
        let transport = InMemoryTransport::new();
        let engine = RedeliveryEngine::new(&config(10), transport.clone());
        engine.start();

        engine.submit(due_in(3, Duration::from_secs(30)));
        engine.submit(due_in(1, Duration::from_secs(10)));
        engine.submit(due_in(2, Duration::from_secs(20)));

        tokio::time::sleep(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(transport.acknowledged(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_submission_wakes_sleeping_worker() {
        let transport = InMemoryTransport::new();
        let engine = RedeliveryEngine::new(&config(10), transport.clone());
        engine.start();
        engine.submit(due_in(1, Duration::from_secs(60)));
        settle().await;

        engine.submit(due_in(2, Duration::from_secs(1)));
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;

        assert_eq!(transport.acknowledged(), vec![2]);
        assert_eq!(engine.len(), 1);
        assert!(engine.next_release_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_publish_does_not_hold_back_next_release() {
        let transport = InMemoryTransport::new();
        transport.script(|_, message| {
            if message.payload == b"slow" {
                PublishBehavior::Stall
            } else {
                PublishBehavior::Ack
            }
        });
        let engine = RedeliveryEngine::new(&config(10), transport.clone());
        engine.start();

        let slow = InboundMessage::new(1, b"slow".to_vec(), Headers::new());
        engine.submit(DelayedEnvelope::after(slow, Duration::from_secs(1)).unwrap());
        engine.submit(due_in(2, Duration::from_secs(2)));

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(transport.acknowledged(), vec![2], "fast release must not wait on the slow one");

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(transport.acknowledged(), vec![2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_publish_is_acknowledged_and_worker_keeps_going() {
        let transport = InMemoryTransport::new();
        transport.script(|_, message| {
            if message.payload == b"boom" {
                PublishBehavior::Panic
            } else {
                PublishBehavior::Ack
            }
        });
        let sink = MemorySink::new();
        let engine = RedeliveryEngine::with_sink(&config(10), transport.clone(), sink.clone());
        engine.start();

        let boom = InboundMessage::new(1, b"boom".to_vec(), Headers::new());
        engine.submit(DelayedEnvelope::after(boom, Duration::from_secs(1)).unwrap());
        engine.submit(due_in(2, Duration::from_secs(2)));

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;

        assert_eq!(transport.acknowledged(), vec![1, 2], "a panicking publish still acknowledges");
        assert!(sink.events().contains(&RedeliveryEvent::ReleasePanicked));
        assert!(sink.events().contains(&RedeliveryEvent::Redelivered { delivery_id: 2, retry_count: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_keeps_held_envelopes() {
        let transport = InMemoryTransport::new();
        let engine = RedeliveryEngine::new(&config(10), transport.clone());
        engine.start();
        engine.submit(due_in(1, Duration::from_secs(5)));
        settle().await;

        engine.shutdown();
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert!(transport.published().is_empty());
        assert_eq!(engine.len(), 1);

        engine.start();
        settle().await;
        assert_eq!(transport.acknowledged(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn many_simultaneous_releases_all_complete() {
        let transport = InMemoryTransport::new();
        transport.script(|_, _| PublishBehavior::Delay(Duration::from_millis(500)));
        let engine = RedeliveryEngine::new(&config(1_000), transport.clone());
        engine.start();

        for id in 0..200 {
            engine.submit(due_in(id, Duration::from_secs(1)));
        }

        // sequential publishing would need 100s
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(transport.acknowledged().len(), 200);
    }
}
