//! [`Transport`] over a NATS connection.
//!
//! Failed messages are read from a subscription (typically a JetStream dead-letter consumer).
//! Each one gets a local delivery id; the original message is kept until it is acknowledged
//! with `+ACK` on its reply subject.

use async_trait::async_trait;
use futures::stream::{self, Stream};
use nats::asynk::{Connection, Message, Subscription};
use nats::header::HeaderMap;
use redeliver::{Destination, Headers, InboundMessage, OutboundMessage, Transport, TransportError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const ACK: &[u8] = b"+ACK";

#[derive(Clone)]
pub struct NatsTransport {
    client: Connection,
    next_delivery_id: Arc<AtomicU64>,
    /// Received messages by delivery id. The core acknowledges each message exactly once,
    /// including when its publish panics, and that removes the entry. Entries still here at
    /// shutdown are dropped and the broker redelivers them after its ack wait.
    pending: Arc<Mutex<HashMap<u64, Message>>>,
}

impl std::fmt::Debug for NatsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsTransport")
            .field("pending", &lock(&self.pending).len())
            .finish_non_exhaustive()
    }
}

impl NatsTransport {
    pub fn new(client: Connection) -> Self {
        Self {
            client,
            next_delivery_id: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn connect(url: &str) -> std::io::Result<Self> {
        Ok(Self::new(nats::asynk::connect(url).await?))
    }

    /// Stream of failed messages from `subject`, ready for `DeadLetterConsumer::run`.
    pub async fn failed_messages(
        &self,
        subject: &str,
    ) -> std::io::Result<impl Stream<Item = InboundMessage>> {
        let subscription = self.client.subscribe(subject).await?;
        tracing::info!(subject, "subscribed to dead-letter subject");
        Ok(stream::unfold((self.clone(), subscription), |(transport, subscription)| async move {
            let message = next_message(&subscription).await?;
            let inbound = transport.track(message);
            Some((inbound, (transport, subscription)))
        }))
    }

    /// Messages received but not yet acknowledged.
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    fn track(&self, message: Message) -> InboundMessage {
        let delivery_id = self.next_delivery_id.fetch_add(1, Ordering::Relaxed);
        let inbound = InboundMessage::new(
            delivery_id,
            message.data.clone(),
            message.headers.as_ref().map(headers_from_nats).unwrap_or_default(),
        );
        lock(&self.pending).insert(delivery_id, message);
        inbound
    }
}

async fn next_message(subscription: &Subscription) -> Option<Message> {
    let message = subscription.next().await;
    if message.is_none() {
        tracing::info!("dead-letter subscription closed");
    }
    message
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(
        &self,
        destination: &Destination,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let publish_error = |e: std::io::Error| TransportError::Publish {
            destination: destination.to_string(),
            reason: e.to_string(),
        };
        let headers = headers_to_nats(&message.headers);
        self.client
            .publish_with_reply_or_headers(destination.as_str(), None, Some(&headers), &message.payload)
            .await
            .map_err(publish_error)?;
        // confirmation is the server having received the publish
        self.client.flush().await.map_err(publish_error)
    }

    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), TransportError> {
        let delivery_id = message.delivery_id();
        let original = lock(&self.pending).remove(&delivery_id).ok_or_else(|| {
            TransportError::Acknowledge { delivery_id, reason: "unknown delivery".into() }
        })?;
        if original.reply.is_none() {
            tracing::debug!(delivery_id, "message has no reply subject; nothing to acknowledge");
            return Ok(());
        }
        original
            .respond(ACK)
            .await
            .map_err(|e| TransportError::Acknowledge { delivery_id, reason: e.to_string() })
    }
}

fn headers_from_nats(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(key, values)| values.iter().next().map(|value| (key.clone(), value.clone())))
        .collect()
}

fn headers_to_nats(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        map.insert(key.as_str(), value.clone());
    }
    map
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
