//! # History Events
//!
//! The append-only event vocabulary that defines an orchestration's state.
//! Events are serde-tagged so queue payloads and history rows share one wire
//! format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of one orchestration generation.
///
/// `execution_id` advances whenever the orchestration continues-as-new; a
/// `None` execution id targets whatever generation is current.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrchestrationInstance {
    pub instance_id: String,
    pub execution_id: Option<String>,
}

impl OrchestrationInstance {
    /// Instance identity targeting the current generation.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: None,
        }
    }

    /// Instance identity pinned to a specific generation.
    pub fn with_execution(instance_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: Some(execution_id.into()),
        }
    }
}

/// Computed status of an orchestration generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    ContinuedAsNew,
}

impl OrchestrationStatus {
    /// True for statuses that no further message can change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Terminated | Self::ContinuedAsNew
        )
    }

    /// Parse the snake_case form produced by [`Display`](std::fmt::Display).
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "terminated" => Some(Self::Terminated),
            "continued_as_new" => Some(Self::ContinuedAsNew),
            _ => None,
        }
    }

    /// All terminal statuses, in declaration order.
    pub fn terminal_statuses() -> [OrchestrationStatus; 4] {
        [
            Self::Completed,
            Self::Failed,
            Self::Terminated,
            Self::ContinuedAsNew,
        ]
    }
}

impl std::fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
            Self::ContinuedAsNew => "continued_as_new",
        };
        write!(f, "{name}")
    }
}

/// Event id used by externally-raised events that never entered a
/// deterministic orchestrator turn.
pub const EXTERNAL_EVENT_ID: i32 = -1;

/// One entry in an orchestration history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum HistoryEvent {
    ExecutionStarted {
        event_id: i32,
        timestamp: DateTime<Utc>,
        orchestration_instance: OrchestrationInstance,
        name: String,
        version: String,
        input: Option<Value>,
    },
    ExecutionCompleted {
        event_id: i32,
        timestamp: DateTime<Utc>,
        orchestration_status: OrchestrationStatus,
        result: Option<Value>,
        failure_details: Option<String>,
    },
    ExecutionTerminated {
        event_id: i32,
        timestamp: DateTime<Utc>,
        reason: Option<String>,
    },
    ContinuedAsNew {
        event_id: i32,
        timestamp: DateTime<Utc>,
        input: Option<Value>,
    },
    TaskScheduled {
        event_id: i32,
        timestamp: DateTime<Utc>,
        name: String,
        version: String,
        input: Option<Value>,
    },
    TaskCompleted {
        event_id: i32,
        timestamp: DateTime<Utc>,
        task_scheduled_id: i32,
        result: Option<Value>,
    },
    TaskFailed {
        event_id: i32,
        timestamp: DateTime<Utc>,
        task_scheduled_id: i32,
        reason: Option<String>,
        details: Option<Value>,
    },
    TimerCreated {
        event_id: i32,
        timestamp: DateTime<Utc>,
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        event_id: i32,
        timestamp: DateTime<Utc>,
        timer_id: i32,
        fire_at: DateTime<Utc>,
    },
    EventRaised {
        event_id: i32,
        timestamp: DateTime<Utc>,
        name: String,
        input: Option<Value>,
    },
    GenericEvent {
        event_id: i32,
        timestamp: DateTime<Utc>,
        data: Option<Value>,
    },
}

impl HistoryEvent {
    pub fn event_id(&self) -> i32 {
        match self {
            Self::ExecutionStarted { event_id, .. }
            | Self::ExecutionCompleted { event_id, .. }
            | Self::ExecutionTerminated { event_id, .. }
            | Self::ContinuedAsNew { event_id, .. }
            | Self::TaskScheduled { event_id, .. }
            | Self::TaskCompleted { event_id, .. }
            | Self::TaskFailed { event_id, .. }
            | Self::TimerCreated { event_id, .. }
            | Self::TimerFired { event_id, .. }
            | Self::EventRaised { event_id, .. }
            | Self::GenericEvent { event_id, .. } => *event_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::ExecutionStarted { timestamp, .. }
            | Self::ExecutionCompleted { timestamp, .. }
            | Self::ExecutionTerminated { timestamp, .. }
            | Self::ContinuedAsNew { timestamp, .. }
            | Self::TaskScheduled { timestamp, .. }
            | Self::TaskCompleted { timestamp, .. }
            | Self::TaskFailed { timestamp, .. }
            | Self::TimerCreated { timestamp, .. }
            | Self::TimerFired { timestamp, .. }
            | Self::EventRaised { timestamp, .. }
            | Self::GenericEvent { timestamp, .. } => *timestamp,
        }
    }

    /// Short name used in logs and poison diagnostics.
    pub fn event_type_name(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution_started",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionTerminated { .. } => "execution_terminated",
            Self::ContinuedAsNew { .. } => "continued_as_new",
            Self::TaskScheduled { .. } => "task_scheduled",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TimerCreated { .. } => "timer_created",
            Self::TimerFired { .. } => "timer_fired",
            Self::EventRaised { .. } => "event_raised",
            Self::GenericEvent { .. } => "generic_event",
        }
    }

    /// The future delivery time carried by timer messages, when present.
    pub fn scheduled_fire_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::TimerFired { fire_at, .. } | Self::TimerCreated { fire_at, .. } => Some(*fire_at),
            _ => None,
        }
    }

    /// True for the events that represent a failure outcome; these are the
    /// events rewind neutralizes.
    pub fn is_failure(&self) -> bool {
        match self {
            Self::TaskFailed { .. } => true,
            Self::ExecutionCompleted {
                orchestration_status,
                ..
            } => *orchestration_status == OrchestrationStatus::Failed,
            _ => false,
        }
    }

    /// Build an `ExecutionStarted` event for a fresh generation.
    pub fn execution_started(
        instance_id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        input: Option<Value>,
    ) -> Self {
        let instance_id = instance_id.into();
        Self::ExecutionStarted {
            event_id: EXTERNAL_EVENT_ID,
            timestamp: Utc::now(),
            orchestration_instance: OrchestrationInstance::with_execution(
                instance_id,
                uuid::Uuid::new_v4().to_string(),
            ),
            name: name.into(),
            version: version.into(),
            input,
        }
    }

    /// Replace a failure event with a neutral placeholder carrying the
    /// original payload, preserving the event id so replay stays aligned.
    pub fn neutralized(&self) -> Self {
        Self::GenericEvent {
            event_id: self.event_id(),
            timestamp: self.timestamp(),
            data: serde_json::to_value(self).ok(),
        }
    }
}
