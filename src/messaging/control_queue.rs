//! # Control Queue
//!
//! Per-partition ordered-ish delivery of orchestration messages with
//! visibility-timeout semantics, batched dequeue, large-payload
//! indirection, and poison handling.

use crate::constants::MAX_MESSAGE_DEQUEUE_COUNT;
use crate::error::{Result, TaskHubError};
use crate::messaging::codec::LargeMessageCodec;
use crate::messaging::message::{MessageData, TaskMessage};
use crate::storage::{MessageQueue, RetryPolicy};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Receipt for one enqueued message.
#[derive(Debug, Clone)]
pub struct EnqueuedMessage {
    pub msg_id: i64,
    /// Blob created for the payload, when it was off-loaded.
    pub blob_name: Option<String>,
}

/// A partition's control queue.
///
/// The queue name doubles as the partition id (`<hub>-control-NN`).
pub struct ControlQueue {
    queue: Arc<dyn MessageQueue>,
    codec: Arc<LargeMessageCodec>,
    name: String,
    visibility_timeout: Duration,
    batch_size: usize,
    retry: RetryPolicy,
}

impl ControlQueue {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        codec: Arc<LargeMessageCodec>,
        name: String,
        visibility_timeout: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            codec,
            name,
            visibility_timeout,
            batch_size,
            retry: RetryPolicy::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a message. Timer messages whose `fire_at` lies in the future
    /// are enqueued with a matching initial invisibility delay.
    pub async fn enqueue(&self, message: &TaskMessage) -> Result<EnqueuedMessage> {
        let delay = message
            .event
            .scheduled_fire_at()
            .and_then(|fire_at| (fire_at - Utc::now()).to_std().ok())
            .filter(|delay| !delay.is_zero());

        let encoded = self.codec.encode(message).await?;
        let msg_id = self
            .retry
            .run("control_enqueue", || {
                let queue = self.queue.clone();
                let name = self.name.clone();
                let body = encoded.body.clone();
                async move { queue.send(&name, &body, delay).await }
            })
            .await?;

        debug!(
            queue = %self.name,
            msg_id,
            instance_id = message.instance_id(),
            event_type = message.event.event_type_name(),
            delay_secs = delay.map(|d| d.as_secs()).unwrap_or(0),
            "Control message enqueued"
        );
        Ok(EnqueuedMessage {
            msg_id,
            blob_name: encoded.blob_name,
        })
    }

    /// Pull and decode up to one batch of messages.
    ///
    /// Poison messages (undecodable past the dequeue-count threshold, or
    /// delivered more than the threshold allows) are removed here and never
    /// surfaced.
    pub async fn dequeue_batch(&self) -> Result<Vec<MessageData>> {
        let received = self
            .retry
            .run("control_dequeue", || {
                let queue = self.queue.clone();
                let name = self.name.clone();
                let visibility = self.visibility_timeout;
                let batch_size = self.batch_size;
                async move { queue.receive_batch(&name, visibility, batch_size).await }
            })
            .await?;

        let mut batch = Vec::with_capacity(received.len());
        for message in received {
            if message.dequeue_count > MAX_MESSAGE_DEQUEUE_COUNT {
                error!(
                    queue = %self.name,
                    msg_id = message.msg_id,
                    dequeue_count = message.dequeue_count,
                    "Poison message exceeded dequeue threshold, deleting"
                );
                self.remove_poison(&message.body, message.msg_id).await;
                continue;
            }

            match self.codec.decode(&message.body).await {
                Ok((task_message, envelope)) => batch.push(MessageData {
                    task_message,
                    msg_id: message.msg_id,
                    dequeue_count: message.dequeue_count,
                    queue_name: self.name.clone(),
                    compressed_blob_name: envelope.compressed_blob_name,
                    total_bytes: message.body.len(),
                    sequence_number: envelope.sequence_number,
                    activity_id: envelope.activity_id,
                    enqueued_at: message.enqueued_at,
                }),
                Err(TaskHubError::Decode { message: reason }) => {
                    if message.dequeue_count >= MAX_MESSAGE_DEQUEUE_COUNT {
                        error!(
                            queue = %self.name,
                            msg_id = message.msg_id,
                            reason = %reason,
                            "Undecodable message reached poison threshold, deleting"
                        );
                        self.remove_poison(&message.body, message.msg_id).await;
                    } else {
                        warn!(
                            queue = %self.name,
                            msg_id = message.msg_id,
                            dequeue_count = message.dequeue_count,
                            reason = %reason,
                            "Message decode failed, abandoning for redelivery"
                        );
                        let _ = self.queue.set_visibility(&self.name, message.msg_id, Duration::ZERO).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Ok(batch)
    }

    /// Extend a message's invisibility to a fresh visibility timeout.
    pub async fn renew(&self, message: &MessageData) -> Result<bool> {
        Ok(self
            .queue
            .set_visibility(&self.name, message.msg_id, self.visibility_timeout)
            .await?)
    }

    /// Permanently remove a consumed message, deleting its off-loaded blob.
    pub async fn delete(&self, message: &MessageData) -> Result<bool> {
        let deleted = self.queue.delete(&self.name, message.msg_id).await?;
        if let Some(blob_name) = &message.compressed_blob_name {
            self.codec.delete_blob_deferred(blob_name.clone());
        }
        Ok(deleted)
    }

    /// Restore a message's visibility immediately. The off-loaded blob is
    /// kept; the redelivered message still references it.
    pub async fn abandon(&self, message: &MessageData) -> Result<bool> {
        Ok(self
            .queue
            .set_visibility(&self.name, message.msg_id, Duration::ZERO)
            .await?)
    }

    async fn remove_poison(&self, body: &str, msg_id: i64) {
        if let Err(error) = self.queue.delete(&self.name, msg_id).await {
            error!(queue = %self.name, msg_id, error = %error, "Failed to delete poison message");
            return;
        }
        // Best effort: reclaim the blob if the envelope still names one.
        if let Ok(envelope) =
            serde_json::from_str::<crate::messaging::message::MessageEnvelope>(body)
        {
            if let Some(blob_name) = envelope.compressed_blob_name {
                self.codec.delete_blob_deferred(blob_name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{HistoryEvent, OrchestrationInstance};
    use crate::storage::memory::{InMemoryBlobStore, InMemoryMessageQueue};
    use crate::storage::BlobStore;
    use serde_json::json;

    async fn control_queue() -> (ControlQueue, Arc<InMemoryMessageQueue>) {
        let queue = Arc::new(InMemoryMessageQueue::new());
        queue.create_queue_if_not_exists("hub-control-00").await.unwrap();
        let blobs = Arc::new(InMemoryBlobStore::new());
        blobs
            .create_container_if_not_exists("hub-largemessages")
            .await
            .unwrap();
        let codec = Arc::new(LargeMessageCodec::new(
            blobs,
            "hub-largemessages".to_string(),
            64 * 1024,
        ));
        (
            ControlQueue::new(
                queue.clone(),
                codec,
                "hub-control-00".to_string(),
                Duration::from_secs(300),
                32,
            ),
            queue,
        )
    }

    fn start_message(instance_id: &str) -> TaskMessage {
        TaskMessage::for_new_execution(HistoryEvent::execution_started(
            instance_id,
            "hello",
            "1.0",
            Some(json!({"n": 1})),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn enqueue_dequeue_delete_round_trip() {
        let (control, _) = control_queue().await;
        let message = start_message("i1");
        control.enqueue(&message).await.unwrap();

        let batch = control.dequeue_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].task_message, message);
        assert_eq!(batch[0].dequeue_count, 1);
        assert_eq!(batch[0].queue_name, "hub-control-00");

        assert!(control.delete(&batch[0]).await.unwrap());
        assert!(control.dequeue_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn future_timers_are_initially_invisible() {
        let (control, _) = control_queue().await;
        let timer = TaskMessage::new(
            HistoryEvent::TimerFired {
                event_id: -1,
                timestamp: Utc::now(),
                timer_id: 2,
                fire_at: Utc::now() + chrono::Duration::seconds(120),
            },
            OrchestrationInstance::new("i1"),
        );
        control.enqueue(&timer).await.unwrap();
        assert!(control.dequeue_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn abandon_restores_visibility() {
        let (control, _) = control_queue().await;
        control.enqueue(&start_message("i1")).await.unwrap();

        let batch = control.dequeue_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(control.dequeue_batch().await.unwrap().is_empty());

        assert!(control.abandon(&batch[0]).await.unwrap());
        let redelivered = control.dequeue_batch().await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].dequeue_count, 2);
    }

    #[tokio::test]
    async fn undecodable_messages_become_poison() {
        let (control, raw_queue) = control_queue().await;
        raw_queue
            .send("hub-control-00", "{\"nonsense\":true}", None)
            .await
            .unwrap();

        // Abandoned (not surfaced) until the threshold, then deleted.
        for _ in 0..MAX_MESSAGE_DEQUEUE_COUNT {
            assert!(control.dequeue_batch().await.unwrap().is_empty());
        }
        assert_eq!(raw_queue.queue_depth("hub-control-00").await.unwrap(), 0);
    }
}
