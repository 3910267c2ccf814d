//! Bounded buffer of messages sent while the connection is down.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::types::Envelope;

/// A message waiting for the connection to come back.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMessage {
    #[must_use]
    pub fn new(topic: String, payload: Value) -> Self {
        Self {
            topic,
            payload,
            enqueued_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(self.topic.clone(), self.payload.clone())
    }
}

/// FIFO with a fixed capacity. Inserting into a full queue evicts the oldest entry.
#[derive(Debug)]
pub struct OutboundQueue {
    messages: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl OutboundQueue {
    /// `capacity` is clamped to at least one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a message, returning the entry evicted to make room, if any.
    pub fn enqueue(&mut self, topic: String, payload: Value) -> Option<QueuedMessage> {
        let evicted = if self.messages.len() >= self.capacity {
            self.messages.pop_front()
        } else {
            None
        };
        self.messages.push_back(QueuedMessage::new(topic, payload));
        evicted
    }

    /// Send queued messages oldest first.
    ///
    /// Stops at the first failure: the failed message and everything after it stay queued
    /// in their original order. Returns how many messages were sent.
    pub fn drain_into<F, E>(&mut self, mut send: F) -> Result<usize, E>
    where
        F: FnMut(&QueuedMessage) -> Result<(), E>,
    {
        let mut sent = 0;
        while let Some(message) = self.messages.front() {
            send(message)?;
            self.messages.pop_front();
            sent += 1;
        }
        Ok(sent)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.messages.iter()
    }
}
