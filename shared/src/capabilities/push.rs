use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum PushError {
    #[error("push channel not available")]
    NotAvailable,

    #[error("invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("subscription failed: {reason}")]
    SubscriptionFailed {
        reason: String,
        #[serde(default)]
        is_retryable: bool,
    },

    #[error("channel closed")]
    Closed,
}

impl PushError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::SubscriptionFailed { is_retryable, .. } => *is_retryable,
            Self::NotAvailable | Self::InvalidTopic { .. } | Self::Closed => false,
        }
    }
}

/// One change notification. Delivery is at-least-once and unordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub topic: String,
    pub value: serde_json::Value,
}

type CancelHook = Box<dyn FnOnce() + Send>;

/// Live subscription to one topic. Dropping it unsubscribes as well.
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<PushMessage>,
    cancel: Option<CancelHook>,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        rx: mpsc::UnboundedReceiver<PushMessage>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            topic: topic.into(),
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next notification, or `None` once the channel side has gone away.
    pub async fn recv(&mut self) -> Option<PushMessage> {
        self.rx.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            debug!(topic = %self.topic, "unsubscribing");
            cancel();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Realtime change feed from the remote service.
#[async_trait::async_trait]
pub trait PushChannel: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, PushError>;
}

fn validate_topic(topic: &str) -> Result<(), PushError> {
    if topic.trim().is_empty() {
        return Err(PushError::InvalidTopic {
            topic: topic.to_string(),
            reason: "topic cannot be empty".into(),
        });
    }
    if topic.chars().any(char::is_control) {
        return Err(PushError::InvalidTopic {
            topic: topic.to_string(),
            reason: "topic contains control characters".into(),
        });
    }
    Ok(())
}

type SubscriberMap = HashMap<u64, (String, mpsc::UnboundedSender<PushMessage>)>;

/// In-process fan-out channel. Shells bridge their realtime client into it
/// with [`BroadcastPushChannel::publish`].
#[derive(Clone, Default)]
pub struct BroadcastPushChannel {
    subscribers: Arc<Mutex<SubscriberMap>>,
    next_id: Arc<AtomicU64>,
}

impl BroadcastPushChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `value` to every live subscriber of `topic`; returns how many received it.
    pub fn publish(&self, topic: &str, value: serde_json::Value) -> usize {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return 0;
        };
        let mut delivered = 0;
        subscribers.retain(|_, (sub_topic, tx)| {
            if sub_topic != topic {
                return true;
            }
            let message = PushMessage {
                topic: topic.to_string(),
                value: value.clone(),
            };
            match tx.send(message) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.values().filter(|(t, _)| t == topic).count())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl PushChannel for BroadcastPushChannel {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, PushError> {
        validate_topic(topic)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .map_err(|_| PushError::Closed)?
            .insert(id, (topic.to_string(), tx));

        let subscribers = Arc::clone(&self.subscribers);
        Ok(Subscription::new(topic, rx, move || {
            if let Ok(mut subs) = subscribers.lock() {
                subs.remove(&id);
            }
        }))
    }
}
