//! Partition ownership across workers and instance-to-partition routing.

mod common;

use common::*;
use serde_json::json;
use std::time::Duration;
use taskhub_core::constants::control_queue_name;
use taskhub_core::partition::partition_index;
use taskhub_core::storage::MessageQueue;
use taskhub_core::{OrchestrationService, StorageBackend, TaskHubError};

#[tokio::test]
async fn two_workers_converge_to_balanced_ownership() {
    let backend = StorageBackend::in_memory();

    let worker_a = start_service(test_config("hub", "worker-a"), backend.clone()).await;

    // A lone worker owns every partition.
    let mut owned_a = Vec::new();
    for _ in 0..100 {
        owned_a = worker_a.owned_partitions().await;
        if owned_a.len() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(owned_a.len(), 4);

    // A second worker steals one lease per scan until the split is 2/2.
    let worker_b = start_service(test_config("hub", "worker-b"), backend.clone()).await;
    let mut balanced = false;
    for _ in 0..200 {
        let a = worker_a.owned_partitions().await.len();
        let b = worker_b.owned_partitions().await.len();
        if a == 2 && b == 2 {
            balanced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(balanced, "ownership must converge to 2/2");

    // No partition is owned twice.
    let mut all: Vec<String> = worker_a.owned_partitions().await;
    all.extend(worker_b.owned_partitions().await);
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 4);

    worker_b.stop().await;

    // The survivor reclaims the released partitions.
    let mut reclaimed = false;
    for _ in 0..200 {
        if worker_a.owned_partitions().await.len() == 4 {
            reclaimed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(reclaimed, "worker A must reclaim released partitions");

    worker_a.stop().await;
}

#[tokio::test]
async fn partition_count_is_immutable_per_hub() {
    let backend = StorageBackend::in_memory();

    let mut config = test_config("hub", "worker-a");
    config.partition_count = 4;
    let service = OrchestrationService::new(config, backend.clone()).expect("service");
    service.create_if_not_exists().await.expect("provision");

    let mut conflicting = test_config("hub", "worker-b");
    conflicting.partition_count = 8;
    let other = OrchestrationService::new(conflicting, backend.clone()).expect("service");
    let result = other.create_if_not_exists().await;
    assert!(matches!(result, Err(TaskHubError::Configuration { .. })));
}

#[tokio::test]
async fn messages_route_to_the_hashed_partition() {
    let backend = StorageBackend::in_memory();
    let config = test_config("hub", "worker-a");
    let partition_count = config.partition_count;

    // Provision without starting, so enqueued messages stay observable.
    let service = OrchestrationService::new(config, backend.clone()).expect("service");
    service.create_if_not_exists().await.expect("provision");

    let instance_ids: Vec<String> = (0..10).map(|n| format!("instance-{n}")).collect();
    for instance_id in &instance_ids {
        service
            .create_task_orchestration(
                execution_started_message(instance_id, "routed", json!({})),
                None,
            )
            .await
            .expect("create");
    }

    for index in 0..partition_count {
        let expected = instance_ids
            .iter()
            .filter(|id| partition_index(id, partition_count) == index)
            .count() as u64;
        let depth = backend
            .queue
            .queue_depth(&control_queue_name("hub", index))
            .await
            .expect("depth");
        assert_eq!(
            depth, expected,
            "partition {index} must hold exactly its hashed instances"
        );
    }
}

#[tokio::test]
async fn single_partition_serializes_every_instance() {
    let backend = StorageBackend::in_memory();
    let mut config = test_config("hub1", "worker-a");
    config.partition_count = 1;

    let service = OrchestrationService::new(config, backend.clone()).expect("service");
    service.create_if_not_exists().await.expect("provision");

    for n in 0..5 {
        service
            .create_task_orchestration(
                execution_started_message(&format!("solo-{n}"), "single", json!({})),
                None,
            )
            .await
            .expect("create");
    }

    let depth = backend
        .queue
        .queue_depth(&control_queue_name("hub1", 0))
        .await
        .expect("depth");
    assert_eq!(depth, 5);
}
