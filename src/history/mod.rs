//! # Orchestration History
//!
//! Event vocabulary and the replayable runtime-state projection.

pub mod events;
pub mod runtime_state;

pub use events::{
    HistoryEvent, OrchestrationInstance, OrchestrationStatus, EXTERNAL_EVENT_ID,
};
pub use runtime_state::{InstanceFilter, OrchestrationRuntimeState, OrchestrationState};

/// Neutralize failure events in place so a replay yields a live state.
///
/// Used by history-store rewind: `TaskFailed` events and failed
/// `ExecutionCompleted` events become `GenericEvent` placeholders with their
/// original ids. Returns how many events were rewritten.
pub fn neutralize_failures(events: &mut [HistoryEvent]) -> usize {
    let mut rewritten = 0;
    for event in events.iter_mut() {
        if event.is_failure() {
            *event = event.neutralized();
            rewritten += 1;
        }
    }
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn neutralize_rewrites_only_failures() {
        let mut events = vec![
            HistoryEvent::execution_started("i1", "flow", "1.0", None),
            HistoryEvent::TaskScheduled {
                event_id: 0,
                timestamp: Utc::now(),
                name: "step".to_string(),
                version: "1.0".to_string(),
                input: None,
            },
            HistoryEvent::TaskFailed {
                event_id: 1,
                timestamp: Utc::now(),
                task_scheduled_id: 0,
                reason: Some("boom".to_string()),
                details: None,
            },
        ];

        assert_eq!(neutralize_failures(&mut events), 1);
        assert!(events.iter().all(|e| !e.is_failure()));
        assert_eq!(events[2].event_id(), 1);

        // Second pass finds nothing left to rewrite.
        assert_eq!(neutralize_failures(&mut events), 0);
    }
}
