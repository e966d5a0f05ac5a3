//! # Work-Item Queue
//!
//! The hub-wide queue of activity invocations. Same contract as a control
//! queue, but unpartitioned and dequeued one activity per work item.

use crate::constants::MAX_MESSAGE_DEQUEUE_COUNT;
use crate::error::{Result, TaskHubError};
use crate::messaging::codec::LargeMessageCodec;
use crate::messaging::control_queue::EnqueuedMessage;
use crate::messaging::message::{MessageData, MessageEnvelope, TaskMessage};
use crate::storage::{MessageQueue, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// The hub's activity work-item queue.
pub struct WorkItemQueue {
    queue: Arc<dyn MessageQueue>,
    codec: Arc<LargeMessageCodec>,
    name: String,
    visibility_timeout: Duration,
    retry: RetryPolicy,
}

impl WorkItemQueue {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        codec: Arc<LargeMessageCodec>,
        name: String,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            codec,
            name,
            visibility_timeout,
            retry: RetryPolicy::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue one activity invocation.
    pub async fn enqueue(&self, message: &TaskMessage) -> Result<EnqueuedMessage> {
        let encoded = self.codec.encode(message).await?;
        let msg_id = self
            .retry
            .run("work_item_enqueue", || {
                let queue = self.queue.clone();
                let name = self.name.clone();
                let body = encoded.body.clone();
                async move { queue.send(&name, &body, None).await }
            })
            .await?;

        debug!(
            queue = %self.name,
            msg_id,
            instance_id = message.instance_id(),
            "Activity work item enqueued"
        );
        Ok(EnqueuedMessage {
            msg_id,
            blob_name: encoded.blob_name,
        })
    }

    /// Pull at most one activity invocation.
    pub async fn dequeue_one(&self) -> Result<Option<MessageData>> {
        loop {
            let received = self
                .retry
                .run("work_item_dequeue", || {
                    let queue = self.queue.clone();
                    let name = self.name.clone();
                    let visibility = self.visibility_timeout;
                    async move { queue.receive_batch(&name, visibility, 1).await }
                })
                .await?;

            let message = match received.into_iter().next() {
                Some(message) => message,
                None => return Ok(None),
            };

            if message.dequeue_count > MAX_MESSAGE_DEQUEUE_COUNT {
                error!(
                    queue = %self.name,
                    msg_id = message.msg_id,
                    dequeue_count = message.dequeue_count,
                    "Poison work item exceeded dequeue threshold, deleting"
                );
                self.remove_poison(&message.body, message.msg_id).await;
                continue;
            }

            match self.codec.decode(&message.body).await {
                Ok((task_message, envelope)) => {
                    return Ok(Some(MessageData {
                        task_message,
                        msg_id: message.msg_id,
                        dequeue_count: message.dequeue_count,
                        queue_name: self.name.clone(),
                        compressed_blob_name: envelope.compressed_blob_name,
                        total_bytes: message.body.len(),
                        sequence_number: envelope.sequence_number,
                        activity_id: envelope.activity_id,
                        enqueued_at: message.enqueued_at,
                    }))
                }
                Err(TaskHubError::Decode { message: reason }) => {
                    if message.dequeue_count >= MAX_MESSAGE_DEQUEUE_COUNT {
                        error!(
                            queue = %self.name,
                            msg_id = message.msg_id,
                            reason = %reason,
                            "Undecodable work item reached poison threshold, deleting"
                        );
                        self.remove_poison(&message.body, message.msg_id).await;
                    } else {
                        warn!(
                            queue = %self.name,
                            msg_id = message.msg_id,
                            reason = %reason,
                            "Work item decode failed, abandoning for redelivery"
                        );
                        let _ = self
                            .queue
                            .set_visibility(&self.name, message.msg_id, Duration::ZERO)
                            .await;
                    }
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Extend an in-flight work item's lock.
    pub async fn renew(&self, message: &MessageData) -> Result<bool> {
        Ok(self
            .queue
            .set_visibility(&self.name, message.msg_id, self.visibility_timeout)
            .await?)
    }

    /// Remove a completed work item, deleting its off-loaded blob.
    pub async fn delete(&self, message: &MessageData) -> Result<bool> {
        let deleted = self.queue.delete(&self.name, message.msg_id).await?;
        if let Some(blob_name) = &message.compressed_blob_name {
            self.codec.delete_blob_deferred(blob_name.clone());
        }
        Ok(deleted)
    }

    /// Restore a work item's visibility immediately.
    pub async fn abandon(&self, message: &MessageData) -> Result<bool> {
        Ok(self
            .queue
            .set_visibility(&self.name, message.msg_id, Duration::ZERO)
            .await?)
    }

    async fn remove_poison(&self, body: &str, msg_id: i64) {
        if let Err(error) = self.queue.delete(&self.name, msg_id).await {
            error!(queue = %self.name, msg_id, error = %error, "Failed to delete poison work item");
            return;
        }
        if let Ok(envelope) = serde_json::from_str::<MessageEnvelope>(body) {
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
    use chrono::Utc;
    use serde_json::json;

    async fn work_item_queue() -> WorkItemQueue {
        let queue = Arc::new(InMemoryMessageQueue::new());
        queue
            .create_queue_if_not_exists("hub-workitems")
            .await
            .unwrap();
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
        WorkItemQueue::new(
            queue,
            codec,
            "hub-workitems".to_string(),
            Duration::from_secs(300),
        )
    }

    fn activity_message(instance_id: &str) -> TaskMessage {
        TaskMessage::new(
            HistoryEvent::TaskScheduled {
                event_id: 0,
                timestamp: Utc::now(),
                name: "send_email".to_string(),
                version: "1.0".to_string(),
                input: Some(json!({"to": "someone"})),
            },
            OrchestrationInstance::new(instance_id),
        )
    }

    #[tokio::test]
    async fn one_activity_per_dequeue() {
        let queue = work_item_queue().await;
        queue.enqueue(&activity_message("i1")).await.unwrap();
        queue.enqueue(&activity_message("i2")).await.unwrap();

        let first = queue.dequeue_one().await.unwrap().expect("first");
        let second = queue.dequeue_one().await.unwrap().expect("second");
        assert_ne!(first.msg_id, second.msg_id);
        assert!(queue.dequeue_one().await.unwrap().is_none());

        assert!(queue.delete(&first).await.unwrap());
        assert!(queue.delete(&second).await.unwrap());
    }

    #[tokio::test]
    async fn abandoned_work_items_come_back() {
        let queue = work_item_queue().await;
        queue.enqueue(&activity_message("i1")).await.unwrap();

        let item = queue.dequeue_one().await.unwrap().expect("item");
        assert!(queue.abandon(&item).await.unwrap());

        let again = queue.dequeue_one().await.unwrap().expect("redelivered");
        assert_eq!(again.msg_id, item.msg_id);
        assert_eq!(again.dequeue_count, 2);
    }
}
