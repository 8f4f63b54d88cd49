//! Delayed envelopes and the retry-count header.

use crate::transport::{Headers, InboundMessage};
use std::cmp::Ordering;
use std::time::Duration;
use tokio::time::Instant;

/// An inbound message paired with the instant it becomes eligible for redelivery.
///
/// Envelopes are immutable. They order by release time with the earliest envelope as the
/// greatest element, so a `BinaryHeap<DelayedEnvelope>` pops the next-due envelope first.
/// Envelopes sharing a release time have no defined order between them.
///
/// Equality and ordering look only at the release time: two envelopes carrying different
/// messages but due at the same instant compare equal. Compare [`message`](Self::message)
/// to tell envelopes apart.
#[derive(Debug, Clone)]
pub struct DelayedEnvelope {
    message: InboundMessage,
    release_at: Instant,
}

impl DelayedEnvelope {
    pub fn new(message: InboundMessage, release_at: Instant) -> Self {
        Self { message, release_at }
    }

    /// Envelope released `delay` from now. Hands the message back if `now + delay` is not
    /// representable as an instant.
    pub fn after(message: InboundMessage, delay: Duration) -> Result<Self, InboundMessage> {
        match Instant::now().checked_add(delay) {
            Some(release_at) => Ok(Self::new(message, release_at)),
            None => Err(message),
        }
    }

    pub fn release_at(&self) -> Instant {
        self.release_at
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.release_at <= now
    }

    pub fn message(&self) -> &InboundMessage {
        &self.message
    }

    pub fn into_message(self) -> InboundMessage {
        self.message
    }
}

impl PartialEq for DelayedEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.release_at == other.release_at
    }
}

impl Eq for DelayedEnvelope {}

impl Ord for DelayedEnvelope {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: earliest release is the max of a BinaryHeap
        other.release_at.cmp(&self.release_at)
    }
}

impl PartialOrd for DelayedEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// What a message's retry-count header says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCountHeader<'a> {
    Missing,
    Parsed(u32),
    /// Present but not a non-negative integer that fits in `u32`.
    Malformed(&'a str),
}

impl<'a> RetryCountHeader<'a> {
    pub fn read(headers: &'a Headers, key: &str) -> Self {
        match headers.get(key) {
            None => Self::Missing,
            Some(value) => match value.parse::<u32>() {
                Ok(count) => Self::Parsed(count),
                Err(_) => Self::Malformed(value),
            },
        }
    }

    /// Attempts already made. Missing and malformed values count as zero.
    pub fn count(&self) -> u32 {
        match self {
            Self::Parsed(count) => *count,
            Self::Missing | Self::Malformed(_) => 0,
        }
    }

    /// Value to stamp on the next redelivery. Malformed values restart the count at one.
    pub fn incremented(&self) -> u32 {
        match self {
            Self::Parsed(count) => count.saturating_add(1),
            Self::Missing | Self::Malformed(_) => 1,
        }
    }
}
