//! # Message Structures for Control and Work-Item Queues
//!
//! Defines the task-message wire format shared by control queues and the
//! activity work-item queue, plus the per-delivery [`MessageData`] wrapper
//! that carries queue receipts through a work item's lifetime.

use crate::history::{HistoryEvent, OrchestrationInstance};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A history event addressed to an orchestration instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub event: HistoryEvent,
    pub orchestration_instance: OrchestrationInstance,
}

impl TaskMessage {
    pub fn new(event: HistoryEvent, orchestration_instance: OrchestrationInstance) -> Self {
        Self {
            event,
            orchestration_instance,
        }
    }

    /// Message carrying an `ExecutionStarted` event; the instance identity
    /// is lifted from the event itself.
    pub fn for_new_execution(event: HistoryEvent) -> Option<Self> {
        match &event {
            HistoryEvent::ExecutionStarted {
                orchestration_instance,
                ..
            } => {
                let instance = orchestration_instance.clone();
                Some(Self::new(event, instance))
            }
            _ => None,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.orchestration_instance.instance_id
    }
}

/// Queue envelope for a task message.
///
/// Exactly one of `task_message` / `compressed_blob_name` is present: small
/// payloads travel inline, large ones are off-loaded to the blob store and
/// referenced by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_message: Option<TaskMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_blob_name: Option<String>,
    /// Monotonic per-sender sequence for tracing.
    pub sequence_number: i64,
    /// Correlation id flowing through logs and activity sessions.
    pub activity_id: Uuid,
}

/// One received control or work-item queue message, decoded.
///
/// Holds everything needed to renew, delete, or abandon the underlying
/// queue message and to clean up its off-loaded blob.
#[derive(Debug, Clone)]
pub struct MessageData {
    pub task_message: TaskMessage,
    /// Queue receipt for delete/renew/abandon.
    pub msg_id: i64,
    /// Delivery count reported by the queue.
    pub dequeue_count: u32,
    /// Queue this message was received from.
    pub queue_name: String,
    /// Blob holding the full payload, when off-loaded.
    pub compressed_blob_name: Option<String>,
    /// Serialized size of the envelope as received.
    pub total_bytes: usize,
    pub sequence_number: i64,
    pub activity_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

impl MessageData {
    /// Fingerprint identifying this delivery within the worker.
    pub fn fingerprint(&self) -> (String, i64) {
        (self.queue_name.clone(), self.msg_id)
    }

    pub fn instance_id(&self) -> &str {
        self.task_message.instance_id()
    }
}
