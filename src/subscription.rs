#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bon::Builder;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::ws::error::WsError;

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Called with the topic and the error when a subscription request cannot be delivered.
pub type ErrorCallback = Arc<dyn Fn(&str, &WsError) + Send + Sync>;

/// Per-subscription behaviour.
#[non_exhaustive]
#[derive(Clone, Builder)]
pub struct SubscriptionOptions {
    /// Keep the subscription across automatic reconnects. When `false` it is dropped the
    /// first time the connection is lost.
    #[builder(default = true)]
    pub auto_reconnect: bool,
    /// Consecutive failed deliveries tolerated before the subscription is dropped
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,
    /// Notified of every failed delivery
    pub on_error: Option<ErrorCallback>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_retries: DEFAULT_MAX_RETRIES,
            on_error: None,
        }
    }
}

impl fmt::Debug for SubscriptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("auto_reconnect", &self.auto_reconnect)
            .field("max_retries", &self.max_retries)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Server-side topic interest, replayed to the peer after every (re)connect.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Topic name (e.g., `market:update`)
    pub topic: String,
    /// Opaque parameters forwarded with the subscription request
    pub params: Value,
    pub options: SubscriptionOptions,
    /// When the subscription was first created
    pub created_at: DateTime<Utc>,
    /// Consecutive failed deliveries
    pub failures: u32,
}

/// Topic-keyed set of subscriptions.
///
/// Only tracks what the peer should push. Local listeners live on the event bus and are
/// unaffected by anything done here.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<String, Subscription>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the subscription for `topic`. Returns whether one was replaced.
    ///
    /// Replacing keeps the original creation time and resets the failure count.
    pub fn subscribe(&mut self, topic: &str, params: Value, options: SubscriptionOptions) -> bool {
        if let Some(existing) = self.entries.get_mut(topic) {
            existing.params = params;
            existing.options = options;
            existing.failures = 0;
            return true;
        }

        self.entries.insert(
            topic.to_owned(),
            Subscription {
                topic: topic.to_owned(),
                params,
                options,
                created_at: Utc::now(),
                failures: 0,
            },
        );
        false
    }

    pub fn unsubscribe(&mut self, topic: &str) -> Option<Subscription> {
        self.entries.remove(topic)
    }

    #[must_use]
    pub fn get(&self, topic: &str) -> Option<&Subscription> {
        self.entries.get(topic)
    }

    /// All subscriptions, ordered by topic.
    #[must_use]
    pub fn list_active(&self) -> Vec<Subscription> {
        self.entries.values().cloned().collect()
    }

    /// Topic and parameters of every subscription, ordered by topic.
    #[must_use]
    pub fn requests(&self) -> Vec<(String, Value)> {
        self.entries
            .values()
            .map(|sub| (sub.topic.clone(), sub.params.clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop subscriptions that opted out of surviving a lost connection.
    pub fn retain_auto_reconnect(&mut self) {
        self.entries.retain(|_, sub| sub.options.auto_reconnect);
    }

    /// The subscription request for `topic` reached the transport.
    pub fn record_success(&mut self, topic: &str) {
        if let Some(sub) = self.entries.get_mut(topic) {
            sub.failures = 0;
        }
    }

    /// The subscription request for `topic` could not be delivered.
    ///
    /// Notifies the subscription's error callback and drops the subscription once it has
    /// failed more than `max_retries` times in a row. Returns whether it was dropped.
    pub fn record_failure(&mut self, topic: &str, error: &WsError) -> bool {
        let Some(sub) = self.entries.get_mut(topic) else {
            return false;
        };
        sub.failures = sub.failures.saturating_add(1);
        let exhausted = sub.failures > sub.options.max_retries;

        if let Some(on_error) = sub.options.on_error.clone()
            && panic::catch_unwind(AssertUnwindSafe(|| on_error(topic, error))).is_err()
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(%topic, "Subscription error callback panicked");
        }

        if exhausted {
            #[cfg(feature = "tracing")]
            tracing::warn!(%topic, %error, "Dropping subscription after repeated failures");
            self.entries.remove(topic);
        }
        exhausted
    }
}
