use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use meter_core::SecretDigest;

use crate::error::StreamError;

/// What a subscriber should do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationAction {
    /// Evict one credential digest from the quota cache.
    InvalidateKey,
    /// Anything this version does not understand. Ignored by subscribers.
    #[serde(other)]
    Unknown,
}

/// Wire message published on the invalidation topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    pub action: InvalidationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_digest: Option<SecretDigest>,
}

impl InvalidationMessage {
    #[must_use]
    pub fn invalidate_key(digest: SecretDigest) -> Self {
        Self {
            action: InvalidationAction::InvalidateKey,
            credential_digest: Some(digest),
        }
    }
}

/// Pub/sub fan-out of credential mutations to every authorizer instance.
///
/// Delivery is best-effort: a subscriber that falls behind loses messages
/// and relies on the cache TTL instead.
#[async_trait]
pub trait InvalidationChannel: Send + Sync {
    async fn publish(&self, message: &InvalidationMessage) -> Result<(), StreamError>;

    fn subscribe(&self) -> InvalidationSubscription;
}

/// Receiving half of an [`InvalidationChannel`], filtered to
/// [`InvalidationAction::InvalidateKey`] messages.
#[derive(Debug)]
pub struct InvalidationSubscription {
    topic: String,
    rx: broadcast::Receiver<String>,
}

impl InvalidationSubscription {
    /// Wait for the next digest to evict. Returns `None` once the channel is
    /// closed.
    pub async fn recv(&mut self) -> Option<SecretDigest> {
        loop {
            let raw = match self.rx.recv().await {
                Ok(raw) => raw,
                Err(RecvError::Lagged(missed)) => {
                    warn!(topic = %self.topic, missed, "invalidation subscriber lagged, relying on cache TTL");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            };
            match serde_json::from_str::<InvalidationMessage>(&raw) {
                Ok(InvalidationMessage {
                    action: InvalidationAction::InvalidateKey,
                    credential_digest: Some(digest),
                }) => return Some(digest),
                Ok(other) => {
                    debug!(topic = %self.topic, action = ?other.action, "ignoring invalidation message");
                }
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, "malformed invalidation message");
                }
            }
        }
    }
}

/// In-process [`InvalidationChannel`] on a `tokio` broadcast channel.
///
/// Messages travel serialized so that subscribers see exactly what a remote
/// pub/sub topic would deliver.
#[derive(Debug, Clone)]
pub struct BroadcastInvalidationChannel {
    topic: String,
    tx: broadcast::Sender<String>,
}

impl BroadcastInvalidationChannel {
    pub fn new(topic: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            topic: topic.into(),
            tx,
        }
    }

    /// Publish an arbitrary raw payload. Lets tests exercise filtering of
    /// foreign messages.
    pub fn publish_raw(&self, raw: impl Into<String>) {
        // No subscribers is not an error for a pub/sub topic.
        let _ = self.tx.send(raw.into());
    }
}

#[async_trait]
impl InvalidationChannel for BroadcastInvalidationChannel {
    async fn publish(&self, message: &InvalidationMessage) -> Result<(), StreamError> {
        let raw = serde_json::to_string(message)?;
        let receivers = self.tx.send(raw).unwrap_or(0);
        debug!(topic = %self.topic, receivers, "published invalidation");
        Ok(())
    }

    fn subscribe(&self) -> InvalidationSubscription {
        InvalidationSubscription {
            topic: self.topic.clone(),
            rx: self.tx.subscribe(),
        }
    }
}
