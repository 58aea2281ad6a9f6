//! Publisher interface for the task executor
//!
//! The narrow API a background worker uses to emit progress for a topic.
//! It knows nothing about connections; the router resolves fan-out. Every
//! method returns the delivered count and never fails the calling task:
//! an absent listener is an expected condition (the client may simply have
//! disconnected), not an error.

use crate::protocol::{Event, Identity, TaskStatus, Topic};
use crate::router::ChannelRouter;
use std::sync::Arc;

/// Maximum prompt characters echoed back in the started notice
const PROMPT_PREVIEW_CHARS: usize = 50;

/// Emits task progress events onto topics
#[derive(Clone)]
pub struct ProgressPublisher {
    router: Arc<ChannelRouter>,
}

impl ProgressPublisher {
    /// Create a publisher over a router
    pub fn new(router: Arc<ChannelRouter>) -> Self {
        Self { router }
    }

    /// Publish one event to a topic, returning the delivered count
    pub async fn publish(&self, topic: &Topic, event: Event) -> usize {
        let delivered = self.router.publish(topic, &event).await;
        if delivered == 0 {
            tracing::debug!(topic = %topic, kind = event.kind(), "No active listeners");
        } else {
            tracing::debug!(
                topic = %topic,
                kind = event.kind(),
                delivered,
                "Event delivered"
            );
        }
        delivered
    }

    /// Announce that a task started processing a prompt
    pub async fn notify_started(
        &self,
        identity: &Identity,
        conversation_id: &str,
        prompt: &str,
    ) -> usize {
        let topic = Topic::new(identity.clone(), conversation_id);
        let preview: String = prompt.chars().take(PROMPT_PREVIEW_CHARS).collect();
        let event = Event::status(
            &topic,
            TaskStatus::Started,
            format!("Processing prompt: {}...", preview),
        );
        self.publish(&topic, event).await
    }

    /// Stream an incremental progress frame
    pub async fn notify_progress(
        &self,
        identity: &Identity,
        conversation_id: &str,
        frame: serde_json::Value,
    ) -> usize {
        let topic = Topic::new(identity.clone(), conversation_id);
        let event = Event::frame(&topic, frame);
        self.publish(&topic, event).await
    }

    /// Deliver the terminal successful result, then a completion status
    pub async fn notify_completed(
        &self,
        identity: &Identity,
        conversation_id: &str,
        result: serde_json::Value,
    ) -> usize {
        let topic = Topic::new(identity.clone(), conversation_id);
        let delivered = self.publish(&topic, Event::response(&topic, result)).await;
        self.publish(
            &topic,
            Event::status(
                &topic,
                TaskStatus::Completed,
                "Response generation completed successfully",
            ),
        )
        .await;
        delivered
    }

    /// Report a task failure as an ordinary error event plus a failed status
    ///
    /// The reason is the human-readable description shown to the client;
    /// internal diagnostics never travel this path.
    pub async fn notify_failed(
        &self,
        identity: &Identity,
        conversation_id: &str,
        reason: &str,
    ) -> usize {
        let topic = Topic::new(identity.clone(), conversation_id);
        let delivered = self.publish(&topic, Event::error(&topic, reason)).await;
        self.publish(
            &topic,
            Event::status(&topic, TaskStatus::Failed, format!("Task failed: {}", reason)),
        )
        .await;
        delivered
    }
}
