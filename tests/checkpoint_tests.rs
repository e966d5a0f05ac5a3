//! Checkpoint-protocol behaviors: optimistic-concurrency recovery,
//! zero-event commits, lock renewal, and creation dedupe.

mod common;

use common::*;
use serde_json::json;
use std::time::Duration;
use taskhub_core::history::{HistoryEvent, OrchestrationRuntimeState, OrchestrationStatus};
use taskhub_core::storage::HistoryStore;
use taskhub_core::{StorageBackend, TaskHubError};
use tokio_util::sync::CancellationToken;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn precondition_conflict_abandons_and_redelivers() {
    let backend = StorageBackend::in_memory();
    let service = start_service(test_config("hub", "worker-a"), backend.clone()).await;
    let ctx = CancellationToken::new();

    service
        .create_task_orchestration(
            execution_started_message("i1", "contended", json!({})),
            None,
        )
        .await
        .expect("create");

    let work_item = service
        .lock_next_task_orchestration_work_item(LOCK_TIMEOUT, &ctx)
        .await
        .expect("lock")
        .expect("work item");
    assert_eq!(work_item.etag, None);

    // A competing worker commits the same generation first.
    let competing_started = work_item
        .new_messages
        .iter()
        .find(|m| matches!(m.event, HistoryEvent::ExecutionStarted { .. }))
        .expect("started message");
    let execution_id = match &competing_started.event {
        HistoryEvent::ExecutionStarted {
            orchestration_instance,
            ..
        } => orchestration_instance.execution_id.clone().unwrap(),
        _ => unreachable!(),
    };
    let mut competing_state = OrchestrationRuntimeState::default();
    competing_state.append_event(competing_started.event.clone());
    backend
        .history
        .update_state(&competing_state, "i1", &execution_id, None, &[])
        .await
        .expect("competing commit");

    // Our checkpoint loses the race: recovered, batch abandoned.
    let state = fold_inbound(&work_item);
    service
        .complete_task_orchestration_work_item(&work_item, state, vec![], vec![], vec![], None)
        .await
        .expect("conflict is recovered, not an error");
    assert_eq!(service.stats().precondition_conflicts, 1);
    assert_eq!(service.stats().checkpoints_committed, 0);
    service
        .release_task_orchestration_work_item(&work_item)
        .await
        .expect("release");

    // The abandoned batch redelivers with the winner's state attached.
    let work_item = service
        .lock_next_task_orchestration_work_item(LOCK_TIMEOUT, &ctx)
        .await
        .expect("lock")
        .expect("redelivered work item");
    assert_eq!(work_item.etag, Some(1));
    assert!(work_item.runtime_state.execution_started().is_some());

    service.stop().await;
}

#[tokio::test]
async fn zero_event_checkpoint_still_commits() {
    let backend = StorageBackend::in_memory();
    let service = start_service(test_config("hub", "worker-a"), backend.clone()).await;
    let ctx = CancellationToken::new();

    service
        .create_task_orchestration(
            execution_started_message("i1", "quiet", json!({})),
            None,
        )
        .await
        .expect("create");

    let work_item = service
        .lock_next_task_orchestration_work_item(LOCK_TIMEOUT, &ctx)
        .await
        .expect("lock")
        .expect("work item");

    // The host appends nothing; Phase 2 must still advance the etag.
    let empty_state = work_item.runtime_state.clone();
    assert_eq!(empty_state.new_events().len(), 0);
    service
        .complete_task_orchestration_work_item(&work_item, empty_state, vec![], vec![], vec![], None)
        .await
        .expect("empty checkpoint");

    let execution_id = work_item.effective_execution_id().expect("execution id");
    let record = backend
        .history
        .get_history("i1", Some(&execution_id))
        .await
        .expect("history")
        .expect("record");
    assert_eq!(record.etag, 1);
    assert!(record.events.is_empty());

    service
        .release_task_orchestration_work_item(&work_item)
        .await
        .expect("release");
    service.stop().await;
}

#[tokio::test]
async fn work_item_locks_can_be_renewed() {
    let backend = StorageBackend::in_memory();
    let service = start_service(test_config("hub", "worker-a"), backend.clone()).await;
    let ctx = CancellationToken::new();

    service
        .create_task_orchestration(
            execution_started_message("i1", "slow", json!({})),
            None,
        )
        .await
        .expect("create");

    let mut work_item = service
        .lock_next_task_orchestration_work_item(LOCK_TIMEOUT, &ctx)
        .await
        .expect("lock")
        .expect("work item");
    let before = work_item.lock_expires_at;
    tokio::time::sleep(Duration::from_millis(20)).await;
    service
        .renew_task_orchestration_work_item_lock(&mut work_item)
        .await
        .expect("renew orchestration lock");
    assert!(work_item.lock_expires_at > before);

    // Same for the activity quartet.
    let mut state = fold_inbound(&work_item);
    let scheduled = task_scheduled(&state, "linger", json!({}));
    state.append_event(scheduled.clone());
    let instance = state.orchestration_instance().expect("instance").clone();
    service
        .complete_task_orchestration_work_item(
            &work_item,
            state,
            vec![taskhub_core::messaging::TaskMessage::new(scheduled, instance)],
            vec![],
            vec![],
            None,
        )
        .await
        .expect("checkpoint");
    service
        .release_task_orchestration_work_item(&work_item)
        .await
        .expect("release");

    let mut activity = service
        .lock_next_task_activity_work_item(LOCK_TIMEOUT, &ctx)
        .await
        .expect("lock activity")
        .expect("activity");
    let before = activity.lock_expires_at;
    tokio::time::sleep(Duration::from_millis(20)).await;
    service
        .renew_task_activity_work_item_lock(&mut activity)
        .await
        .expect("renew activity lock");
    assert!(activity.lock_expires_at > before);

    service
        .abandon_task_activity_work_item(&activity)
        .await
        .expect("abandon activity");
    service.stop().await;
}

#[tokio::test]
async fn abandoned_work_items_redeliver_with_higher_dequeue_count() {
    let backend = StorageBackend::in_memory();
    let service = start_service(test_config("hub", "worker-a"), backend.clone()).await;
    let ctx = CancellationToken::new();

    service
        .create_task_orchestration(
            execution_started_message("i1", "crashy", json!({})),
            None,
        )
        .await
        .expect("create");

    let work_item = service
        .lock_next_task_orchestration_work_item(LOCK_TIMEOUT, &ctx)
        .await
        .expect("lock")
        .expect("work item");
    let first_batch: Vec<String> = work_item
        .new_messages
        .iter()
        .map(|m| m.event.event_type_name().to_string())
        .collect();

    // Simulated processing failure: abandon, then release.
    service
        .abandon_task_orchestration_work_item(&work_item)
        .await
        .expect("abandon");
    service
        .release_task_orchestration_work_item(&work_item)
        .await
        .expect("release");
    assert_eq!(service.stats().orchestration_work_items_abandoned, 1);

    let work_item = service
        .lock_next_task_orchestration_work_item(LOCK_TIMEOUT, &ctx)
        .await
        .expect("lock")
        .expect("redelivered work item");
    let second_batch: Vec<String> = work_item
        .new_messages
        .iter()
        .map(|m| m.event.event_type_name().to_string())
        .collect();
    assert_eq!(first_batch, second_batch);

    let state = fold_inbound(&work_item);
    service
        .complete_task_orchestration_work_item(&work_item, state, vec![], vec![], vec![], None)
        .await
        .expect("checkpoint");
    service
        .release_task_orchestration_work_item(&work_item)
        .await
        .expect("release");
    service.stop().await;
}

#[tokio::test]
async fn creation_dedupes_live_instances() {
    let backend = StorageBackend::in_memory();
    let service = start_service(test_config("hub", "worker-a"), backend.clone()).await;
    let ctx = CancellationToken::new();

    service
        .create_task_orchestration(
            execution_started_message("i1", "first", json!({})),
            None,
        )
        .await
        .expect("create");

    // A live (non-terminal) instance blocks re-creation.
    let duplicate = service
        .create_task_orchestration(
            execution_started_message("i1", "second", json!({})),
            None,
        )
        .await;
    assert!(matches!(
        duplicate,
        Err(TaskHubError::InstanceAlreadyExists { .. })
    ));

    // Explicit dedupe statuses are honored instead.
    let allowed = service
        .create_task_orchestration(
            execution_started_message("i1", "third", json!({})),
            Some(&[OrchestrationStatus::Completed]),
        )
        .await;
    assert!(allowed.is_ok(), "pending status is not in the dedupe set");

    let _ = service
        .lock_next_task_orchestration_work_item(LOCK_TIMEOUT, &ctx)
        .await
        .expect("lock");
    service.stop().await;
}
