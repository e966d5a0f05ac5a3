//! # Orchestration Runtime State
//!
//! The replayable in-memory projection of an orchestration history. The
//! projection is a pure fold over events: replaying any committed history
//! from empty reproduces the same state, which is what makes duplicate
//! message delivery a no-op.

use super::events::{HistoryEvent, OrchestrationInstance, OrchestrationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Summary row describing one orchestration generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub orchestration_instance: OrchestrationInstance,
    pub name: String,
    pub version: String,
    pub status: OrchestrationStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub custom_status: Option<Value>,
}

/// Query filter over instance summaries.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub created_time_from: Option<DateTime<Utc>>,
    pub created_time_to: Option<DateTime<Utc>>,
    pub statuses: Option<Vec<OrchestrationStatus>>,
}

impl InstanceFilter {
    /// True when the summary passes every populated criterion.
    pub fn matches(&self, state: &OrchestrationState) -> bool {
        if let Some(from) = self.created_time_from {
            if state.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.created_time_to {
            if state.created_at > to {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&state.status) {
                return false;
            }
        }
        true
    }
}

/// The replayable projection of one orchestration generation.
///
/// Committed events and the events appended since the last checkpoint are
/// tracked separately; [`update_state`](crate::storage::HistoryStore::update_state)
/// persists only the new suffix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestrationRuntimeState {
    events: Vec<HistoryEvent>,
    new_events: Vec<HistoryEvent>,
    /// Host-provided status payload surfaced on the summary row.
    pub custom_status: Option<Value>,
}

impl OrchestrationRuntimeState {
    /// Rebuild state from a committed history.
    pub fn from_history(events: Vec<HistoryEvent>) -> Self {
        Self {
            events,
            new_events: Vec::new(),
            custom_status: None,
        }
    }

    /// Committed events.
    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    /// Events appended since the last checkpoint.
    pub fn new_events(&self) -> &[HistoryEvent] {
        &self.new_events
    }

    /// Committed history length plus pending appends.
    pub fn total_event_count(&self) -> usize {
        self.events.len() + self.new_events.len()
    }

    /// Append an event produced by the current work item.
    pub fn append_event(&mut self, event: HistoryEvent) {
        self.new_events.push(event);
    }

    /// Fold the pending appends into the committed history after a
    /// successful checkpoint.
    pub fn checkpoint_committed(&mut self) {
        self.events.append(&mut self.new_events);
    }

    fn all_events(&self) -> impl Iterator<Item = &HistoryEvent> {
        self.events.iter().chain(self.new_events.iter())
    }

    /// The `ExecutionStarted` event, if this generation has one.
    pub fn execution_started(&self) -> Option<&HistoryEvent> {
        self.all_events()
            .find(|e| matches!(e, HistoryEvent::ExecutionStarted { .. }))
    }

    /// Identity of this generation, from its `ExecutionStarted` event.
    pub fn orchestration_instance(&self) -> Option<&OrchestrationInstance> {
        match self.execution_started() {
            Some(HistoryEvent::ExecutionStarted {
                orchestration_instance,
                ..
            }) => Some(orchestration_instance),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self.execution_started() {
            Some(HistoryEvent::ExecutionStarted { name, .. }) => Some(name),
            _ => None,
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self.execution_started() {
            Some(HistoryEvent::ExecutionStarted { version, .. }) => Some(version),
            _ => None,
        }
    }

    pub fn input(&self) -> Option<&Value> {
        match self.execution_started() {
            Some(HistoryEvent::ExecutionStarted { input, .. }) => input.as_ref(),
            _ => None,
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.execution_started().map(HistoryEvent::timestamp)
    }

    /// Terminal output: the completion result, or termination reason.
    pub fn output(&self) -> Option<Value> {
        for event in self.all_events() {
            match event {
                HistoryEvent::ExecutionCompleted {
                    result,
                    failure_details,
                    ..
                } => {
                    return result
                        .clone()
                        .or_else(|| failure_details.clone().map(Value::String));
                }
                HistoryEvent::ExecutionTerminated { reason, .. } => {
                    return reason.clone().map(Value::String);
                }
                _ => {}
            }
        }
        None
    }

    /// Computed status of this generation.
    pub fn status(&self) -> OrchestrationStatus {
        let mut status = OrchestrationStatus::Pending;
        for event in self.all_events() {
            status = match event {
                HistoryEvent::ExecutionStarted { .. } => OrchestrationStatus::Running,
                HistoryEvent::ExecutionCompleted {
                    orchestration_status,
                    ..
                } => *orchestration_status,
                HistoryEvent::ExecutionTerminated { .. } => OrchestrationStatus::Terminated,
                HistoryEvent::ContinuedAsNew { .. } => OrchestrationStatus::ContinuedAsNew,
                _ => status,
            };
        }
        status
    }

    /// Latest completion timestamp when the generation is terminal.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        if !self.status().is_terminal() {
            return None;
        }
        self.all_events()
            .filter(|e| {
                matches!(
                    e,
                    HistoryEvent::ExecutionCompleted { .. }
                        | HistoryEvent::ExecutionTerminated { .. }
                        | HistoryEvent::ContinuedAsNew { .. }
                )
            })
            .map(HistoryEvent::timestamp)
            .last()
    }

    /// Project the summary row for this generation.
    ///
    /// Returns `None` until an `ExecutionStarted` event exists.
    pub fn to_orchestration_state(&self) -> Option<OrchestrationState> {
        let instance = self.orchestration_instance()?.clone();
        Some(OrchestrationState {
            orchestration_instance: instance,
            name: self.name().unwrap_or_default().to_string(),
            version: self.version().unwrap_or_default().to_string(),
            status: self.status(),
            created_at: self.created_at().unwrap_or_else(Utc::now),
            last_updated_at: Utc::now(),
            completed_at: self.completed_at(),
            input: self.input().cloned(),
            output: self.output(),
            custom_status: self.custom_status.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::events::EXTERNAL_EVENT_ID;
    use serde_json::json;

    fn started(instance_id: &str) -> HistoryEvent {
        HistoryEvent::execution_started(instance_id, "hello", "1.0", Some(json!({"n": 1})))
    }

    #[test]
    fn empty_state_is_pending() {
        let state = OrchestrationRuntimeState::default();
        assert_eq!(state.status(), OrchestrationStatus::Pending);
        assert!(state.execution_started().is_none());
        assert!(state.to_orchestration_state().is_none());
    }

    #[test]
    fn replay_reproduces_the_projection() {
        let mut live = OrchestrationRuntimeState::default();
        live.append_event(started("i1"));
        live.append_event(HistoryEvent::TaskScheduled {
            event_id: 0,
            timestamp: Utc::now(),
            name: "work".to_string(),
            version: "1.0".to_string(),
            input: None,
        });
        live.checkpoint_committed();
        live.append_event(HistoryEvent::TaskCompleted {
            event_id: EXTERNAL_EVENT_ID,
            timestamp: Utc::now(),
            task_scheduled_id: 0,
            result: Some(json!("ok")),
        });
        live.checkpoint_committed();

        let replayed = OrchestrationRuntimeState::from_history(live.events().to_vec());
        assert_eq!(replayed.status(), live.status());
        assert_eq!(replayed.name(), live.name());
        assert_eq!(replayed.total_event_count(), live.total_event_count());
    }

    #[test]
    fn status_follows_lifecycle_events() {
        let mut state = OrchestrationRuntimeState::default();
        state.append_event(started("i1"));
        assert_eq!(state.status(), OrchestrationStatus::Running);

        state.append_event(HistoryEvent::ExecutionCompleted {
            event_id: 1,
            timestamp: Utc::now(),
            orchestration_status: OrchestrationStatus::Completed,
            result: Some(json!(42)),
            failure_details: None,
        });
        assert_eq!(state.status(), OrchestrationStatus::Completed);
        assert_eq!(state.output(), Some(json!(42)));
        assert!(state.completed_at().is_some());
    }

    #[test]
    fn terminate_wins_over_running() {
        let mut state = OrchestrationRuntimeState::default();
        state.append_event(started("i1"));
        state.append_event(HistoryEvent::ExecutionTerminated {
            event_id: EXTERNAL_EVENT_ID,
            timestamp: Utc::now(),
            reason: Some("manual".to_string()),
        });
        assert_eq!(state.status(), OrchestrationStatus::Terminated);
        assert_eq!(state.output(), Some(json!("manual")));
    }

    #[test]
    fn checkpoint_moves_new_events_into_history() {
        let mut state = OrchestrationRuntimeState::default();
        state.append_event(started("i1"));
        assert_eq!(state.events().len(), 0);
        assert_eq!(state.new_events().len(), 1);

        state.checkpoint_committed();
        assert_eq!(state.events().len(), 1);
        assert!(state.new_events().is_empty());
    }

    #[test]
    fn filter_applies_all_criteria() {
        let mut state = OrchestrationRuntimeState::default();
        state.append_event(started("i1"));
        let summary = state.to_orchestration_state().expect("summary");

        let mut filter = InstanceFilter::default();
        assert!(filter.matches(&summary));

        filter.statuses = Some(vec![OrchestrationStatus::Completed]);
        assert!(!filter.matches(&summary));

        filter.statuses = Some(vec![OrchestrationStatus::Running]);
        filter.created_time_to = Some(summary.created_at + chrono::Duration::seconds(1));
        assert!(filter.matches(&summary));

        filter.created_time_from = Some(summary.created_at + chrono::Duration::seconds(1));
        assert!(!filter.matches(&summary));
    }
}
