//! # Work Items
//!
//! Dispatch units surfaced to the host: a batch of orchestration messages
//! bound to a session, or a single activity invocation.

use crate::history::OrchestrationRuntimeState;
use crate::messaging::{MessageData, TaskMessage};
use chrono::{DateTime, Utc};

/// A leased orchestration session handed to the dispatcher host.
///
/// Carries the new message batch plus the replayable runtime state and the
/// etag guarding the next history commit. The session stays leased to the
/// holder until completed/abandoned and released.
#[derive(Debug, Clone)]
pub struct TaskOrchestrationWorkItem {
    pub instance_id: String,
    /// Current generation, when the instance has committed history.
    pub execution_id: Option<String>,
    /// Partition the message batch was received on.
    pub partition_id: String,
    /// Messages to feed into the orchestrator, in arrival order.
    pub new_messages: Vec<TaskMessage>,
    /// Projection of the committed history.
    pub runtime_state: OrchestrationRuntimeState,
    /// Optimistic concurrency guard for the checkpoint.
    pub etag: Option<i64>,
    /// When the inbound messages' visibility timeout lapses.
    pub lock_expires_at: DateTime<Utc>,
}

impl TaskOrchestrationWorkItem {
    /// Execution id to commit under: the committed generation's, or the one
    /// introduced by an `ExecutionStarted` message in this batch.
    pub fn effective_execution_id(&self) -> Option<String> {
        if let Some(id) = &self.execution_id {
            return Some(id.clone());
        }
        self.new_messages.iter().find_map(|m| match &m.event {
            crate::history::HistoryEvent::ExecutionStarted {
                orchestration_instance,
                ..
            } => orchestration_instance.execution_id.clone(),
            _ => None,
        })
    }
}

/// A single leased activity invocation.
#[derive(Debug, Clone)]
pub struct TaskActivityWorkItem {
    /// Work-item identity; unique per delivery.
    pub id: i64,
    /// The `TaskScheduled` message to execute.
    pub task_message: TaskMessage,
    /// When the work item's queue lock lapses.
    pub lock_expires_at: DateTime<Utc>,
    /// Queue receipt retained for complete/renew/abandon.
    pub(crate) message: MessageData,
}

impl TaskActivityWorkItem {
    pub(crate) fn new(message: MessageData, lock_expires_at: DateTime<Utc>) -> Self {
        Self {
            id: message.msg_id,
            task_message: message.task_message.clone(),
            lock_expires_at,
            message,
        }
    }
}

/// Point-in-time lock horizon for a freshly received work item.
pub(crate) fn lock_expiry(visibility_timeout: std::time::Duration) -> DateTime<Utc> {
    Utc::now()
        + chrono::Duration::from_std(visibility_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300))
}
