//! Shared helpers for service-level tests: a fast-converging configuration,
//! service bootstrap over the in-memory backend, and a tiny "hello world"
//! orchestrator the tests drive by hand in place of the dispatcher host.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use taskhub_core::history::{
    HistoryEvent, OrchestrationInstance, OrchestrationRuntimeState, OrchestrationStatus,
    EXTERNAL_EVENT_ID,
};
use taskhub_core::messaging::TaskMessage;
use taskhub_core::orchestration::TaskOrchestrationWorkItem;
use taskhub_core::{OrchestrationService, StorageBackend, TaskHubConfig};

/// Configuration tuned so lease acquisition and queue polls converge in
/// milliseconds instead of seconds.
pub fn test_config(task_hub: &str, worker_id: &str) -> TaskHubConfig {
    TaskHubConfig {
        task_hub_name: task_hub.to_string(),
        worker_id: worker_id.to_string(),
        partition_count: 4,
        lease_interval: Duration::from_secs(30),
        lease_renew_interval: Duration::from_millis(100),
        lease_acquire_interval: Duration::from_millis(25),
        poll_backoff_min: Duration::from_millis(10),
        poll_backoff_max: Duration::from_millis(50),
        ..TaskHubConfig::default()
    }
}

pub async fn start_service(config: TaskHubConfig, storage: StorageBackend) -> Arc<OrchestrationService> {
    let service = Arc::new(OrchestrationService::new(config, storage).expect("service"));
    service.start().await.expect("start");
    service
}

pub fn execution_started_message(instance_id: &str, name: &str, input: Value) -> TaskMessage {
    TaskMessage::for_new_execution(HistoryEvent::execution_started(
        instance_id,
        name,
        "1.0",
        Some(input),
    ))
    .expect("execution started message")
}

/// Next deterministic event id for events appended by the orchestrator.
pub fn next_event_id(state: &OrchestrationRuntimeState) -> i32 {
    state.total_event_count() as i32
}

pub fn task_scheduled(state: &OrchestrationRuntimeState, activity_name: &str, input: Value) -> HistoryEvent {
    HistoryEvent::TaskScheduled {
        event_id: next_event_id(state),
        timestamp: Utc::now(),
        name: activity_name.to_string(),
        version: "1.0".to_string(),
        input: Some(input),
    }
}

pub fn completed_event(state: &OrchestrationRuntimeState, result: Value) -> HistoryEvent {
    HistoryEvent::ExecutionCompleted {
        event_id: next_event_id(state),
        timestamp: Utc::now(),
        orchestration_status: OrchestrationStatus::Completed,
        result: Some(result),
        failure_details: None,
    }
}

pub fn activity_response(work_instance: &OrchestrationInstance, task_scheduled_id: i32, result: Value) -> TaskMessage {
    TaskMessage::new(
        HistoryEvent::TaskCompleted {
            event_id: EXTERNAL_EVENT_ID,
            timestamp: Utc::now(),
            task_scheduled_id,
            result: Some(result),
        },
        work_instance.clone(),
    )
}

/// Fold the work item's inbound messages into its runtime state the way a
/// deterministic orchestrator replay would, starting a fresh state when the
/// batch opens a new generation.
pub fn fold_inbound(work_item: &TaskOrchestrationWorkItem) -> OrchestrationRuntimeState {
    let mut state = work_item.runtime_state.clone();

    for message in &work_item.new_messages {
        if let HistoryEvent::ExecutionStarted { .. } = &message.event {
            state = OrchestrationRuntimeState::default();
        }
        // Duplicate completions for an already-recorded task are replay
        // no-ops.
        if let HistoryEvent::TaskCompleted {
            task_scheduled_id, ..
        } = &message.event
        {
            let already_recorded = state
                .events()
                .iter()
                .chain(state.new_events().iter())
                .any(|e| {
                    matches!(
                        e,
                        HistoryEvent::TaskCompleted { task_scheduled_id: recorded, .. }
                            if recorded == task_scheduled_id
                    )
                });
            if already_recorded {
                continue;
            }
        }
        state.append_event(message.event.clone());
    }
    state
}

pub fn hello_input() -> Value {
    json!({"greeting": "hello"})
}
