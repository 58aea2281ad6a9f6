//! Channel router
//!
//! Maps a topic to the set of connection handles subscribed to it and fans
//! published events out over each handle's exclusive write path. The router
//! holds no policy: admission, authorization, and teardown ordering are the
//! session's job. Publishing to a topic nobody is watching drops the event;
//! there is no buffering or replay.

use crate::protocol::{Event, Topic};
use crate::registry::ConnectionHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Topic-keyed subscriber table
pub struct ChannelRouter {
    topics: RwLock<HashMap<Topic, Vec<Arc<ConnectionHandle>>>>,
}

impl ChannelRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Add a handle to its topic's subscriber set
    ///
    /// A handle subscribes to exactly one topic for its lifetime; the topic
    /// is read off the handle itself.
    pub async fn subscribe(&self, handle: Arc<ConnectionHandle>) {
        let mut topics = self.topics.write().await;
        let subscribers = topics.entry(handle.topic().clone()).or_default();
        if subscribers.iter().any(|h| h.id() == handle.id()) {
            return;
        }

        tracing::debug!(topic = %handle.topic(), handle = %handle.id(), "Subscribed");
        subscribers.push(handle);
    }

    /// Remove a handle from its topic; idempotent
    pub async fn unsubscribe(&self, topic: &Topic, handle_id: Uuid) {
        let mut topics = self.topics.write().await;
        let Some(subscribers) = topics.get_mut(topic) else {
            return;
        };

        let before = subscribers.len();
        subscribers.retain(|h| h.id() != handle_id);
        if before != subscribers.len() {
            tracing::debug!(topic = %topic, handle = %handle_id, "Unsubscribed");
        }
        if subscribers.is_empty() {
            topics.remove(topic);
        }
    }

    /// Deliver an event to every current subscriber of a topic
    ///
    /// Returns how many subscribers actually received it. The event is
    /// serialized once; a subscriber whose session is gone is skipped and
    /// never blocks or aborts delivery to the rest.
    pub async fn publish(&self, topic: &Topic, event: &Event) -> usize {
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "Failed to serialize event");
                return 0;
            }
        };

        let topics = self.topics.read().await;
        let Some(subscribers) = topics.get(topic) else {
            return 0;
        };

        let mut delivered = 0;
        for handle in subscribers {
            if handle.send(frame.clone()) {
                delivered += 1;
            } else {
                tracing::debug!(
                    topic = %topic,
                    handle = %handle.id(),
                    "Skipped delivery to closing connection"
                );
            }
        }
        delivered
    }

    /// Number of subscribers currently on a topic
    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.read().await.get(topic).map_or(0, Vec::len)
    }

    /// Number of topics with at least one subscriber
    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}

impl Default for ChannelRouter {
    fn default() -> Self {
        Self::new()
    }
}
