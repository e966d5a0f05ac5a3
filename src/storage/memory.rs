//! # In-Memory Storage Backend
//!
//! Single-process implementations of the storage traits. Visibility
//! timeouts, optimistic etags, and lease token checks behave like the real
//! backends so the orchestration layers can be exercised without external
//! infrastructure. Not suitable for production: no cross-process
//! coordination, no persistence.

use super::{
    AcquireOutcome, BlobStore, HistoryRecord, HistoryStore, Lease, LeaseStore, MessageQueue,
    PurgeResult, ReceivedMessage, ReleaseOutcome, RenewOutcome, StorageError, TaskHubInfo,
};
use crate::history::{
    neutralize_failures, HistoryEvent, InstanceFilter, OrchestrationInstance,
    OrchestrationRuntimeState, OrchestrationState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

fn chrono_interval(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(30))
}

// ---------------------------------------------------------------------------
// Message queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredMessage {
    msg_id: i64,
    body: String,
    visible_at: DateTime<Utc>,
    dequeue_count: u32,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: i64,
    messages: Vec<StoredMessage>,
}

/// In-memory visibility-timeout queue.
#[derive(Debug, Default)]
pub struct InMemoryMessageQueue {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn create_queue_if_not_exists(&self, queue_name: &str) -> Result<(), StorageError> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue_name.to_string()).or_default();
        Ok(())
    }

    async fn drop_queue(&self, queue_name: &str) -> Result<(), StorageError> {
        let mut queues = self.queues.lock().await;
        queues.remove(queue_name);
        Ok(())
    }

    async fn send(
        &self,
        queue_name: &str,
        body: &str,
        delay: Option<Duration>,
    ) -> Result<i64, StorageError> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| StorageError::not_found(format!("queue {queue_name}")))?;

        queue.next_id += 1;
        let msg_id = queue.next_id;
        let now = Utc::now();
        queue.messages.push(StoredMessage {
            msg_id,
            body: body.to_string(),
            visible_at: now + chrono_interval(delay.unwrap_or(Duration::ZERO)),
            dequeue_count: 0,
            enqueued_at: now,
        });
        Ok(msg_id)
    }

    async fn receive_batch(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, StorageError> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| StorageError::not_found(format!("queue {queue_name}")))?;

        let now = Utc::now();
        let mut received = Vec::new();
        // Oldest-first gives the ordered-ish delivery real queues provide.
        queue.messages.sort_by_key(|m| m.msg_id);
        for message in queue.messages.iter_mut() {
            if received.len() >= max_messages {
                break;
            }
            if message.visible_at <= now {
                message.visible_at = now + chrono_interval(visibility_timeout);
                message.dequeue_count += 1;
                received.push(ReceivedMessage {
                    msg_id: message.msg_id,
                    body: message.body.clone(),
                    dequeue_count: message.dequeue_count,
                    enqueued_at: message.enqueued_at,
                });
            }
        }
        Ok(received)
    }

    async fn set_visibility(
        &self,
        queue_name: &str,
        msg_id: i64,
        visibility_timeout: Duration,
    ) -> Result<bool, StorageError> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| StorageError::not_found(format!("queue {queue_name}")))?;

        match queue.messages.iter_mut().find(|m| m.msg_id == msg_id) {
            Some(message) => {
                message.visible_at = Utc::now() + chrono_interval(visibility_timeout);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, queue_name: &str, msg_id: i64) -> Result<bool, StorageError> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| StorageError::not_found(format!("queue {queue_name}")))?;

        let before = queue.messages.len();
        queue.messages.retain(|m| m.msg_id != msg_id);
        Ok(queue.messages.len() < before)
    }

    async fn queue_depth(&self, queue_name: &str) -> Result<u64, StorageError> {
        let queues = self.queues.lock().await;
        let queue = queues
            .get(queue_name)
            .ok_or_else(|| StorageError::not_found(format!("queue {queue_name}")))?;
        Ok(queue.messages.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Blob store
// ---------------------------------------------------------------------------

/// In-memory blob store with overwrite semantics.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    containers: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn create_container_if_not_exists(&self, container: &str) -> Result<(), StorageError> {
        let mut containers = self.containers.lock().await;
        containers.entry(container.to_string()).or_default();
        Ok(())
    }

    async fn drop_container(&self, container: &str) -> Result<(), StorageError> {
        let mut containers = self.containers.lock().await;
        containers.remove(container);
        Ok(())
    }

    async fn put(&self, container: &str, blob_name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(container)
            .ok_or_else(|| StorageError::not_found(format!("container {container}")))?;
        container.insert(blob_name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, container: &str, blob_name: &str) -> Result<Vec<u8>, StorageError> {
        let containers = self.containers.lock().await;
        containers
            .get(container)
            .and_then(|c| c.get(blob_name))
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("blob {container}/{blob_name}")))
    }

    async fn delete(&self, container: &str, blob_name: &str) -> Result<bool, StorageError> {
        let mut containers = self.containers.lock().await;
        Ok(containers
            .get_mut(container)
            .map(|c| c.remove(blob_name).is_some())
            .unwrap_or(false))
    }

    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let containers = self.containers.lock().await;
        Ok(containers
            .get(container)
            .map(|c| {
                let mut names: Vec<String> = c
                    .keys()
                    .filter(|name| name.starts_with(prefix))
                    .cloned()
                    .collect();
                names.sort();
                names
            })
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Lease store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LeaseStoreState {
    hub_info: Option<TaskHubInfo>,
    leases: HashMap<String, Lease>,
}

/// In-memory lease store with token-checked optimistic writes.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    state: Mutex<LeaseStoreState>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn new_token() -> String {
        Uuid::new_v4().to_string()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn create_if_not_exists(&self, hub_info: &TaskHubInfo) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.hub_info.is_none() {
            state.hub_info = Some(hub_info.clone());
        }
        Ok(())
    }

    async fn get_or_create_task_hub_info(
        &self,
        default_info: &TaskHubInfo,
    ) -> Result<TaskHubInfo, StorageError> {
        let mut state = self.state.lock().await;
        match &state.hub_info {
            Some(existing) => Ok(existing.clone()),
            None => {
                state.hub_info = Some(default_info.clone());
                Ok(default_info.clone())
            }
        }
    }

    async fn create_lease_if_not_exists(&self, partition_id: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state
            .leases
            .entry(partition_id.to_string())
            .or_insert_with(|| Lease {
                partition_id: partition_id.to_string(),
                owner: None,
                token: Self::new_token(),
                expires_at: Utc::now(),
                epoch: 0,
            });
        Ok(())
    }

    async fn acquire(
        &self,
        partition_id: &str,
        worker_id: &str,
        lease_interval: Duration,
    ) -> Result<AcquireOutcome, StorageError> {
        let mut state = self.state.lock().await;
        let lease = state
            .leases
            .get_mut(partition_id)
            .ok_or_else(|| StorageError::not_found(format!("lease {partition_id}")))?;

        if !lease.is_available() && lease.owner.as_deref() != Some(worker_id) {
            return Ok(AcquireOutcome::AlreadyOwned {
                owner: lease.owner.clone(),
            });
        }

        lease.owner = Some(worker_id.to_string());
        lease.token = Self::new_token();
        lease.expires_at = Utc::now() + chrono_interval(lease_interval);
        lease.epoch += 1;
        Ok(AcquireOutcome::Acquired(lease.clone()))
    }

    async fn renew(
        &self,
        lease: &Lease,
        lease_interval: Duration,
    ) -> Result<RenewOutcome, StorageError> {
        let mut state = self.state.lock().await;
        let stored = state
            .leases
            .get_mut(&lease.partition_id)
            .ok_or_else(|| StorageError::not_found(format!("lease {}", lease.partition_id)))?;

        if stored.token != lease.token {
            return Ok(RenewOutcome::Lost);
        }

        stored.expires_at = Utc::now() + chrono_interval(lease_interval);
        Ok(RenewOutcome::Renewed(stored.clone()))
    }

    async fn steal(
        &self,
        lease: &Lease,
        worker_id: &str,
        lease_interval: Duration,
    ) -> Result<AcquireOutcome, StorageError> {
        let mut state = self.state.lock().await;
        let stored = state
            .leases
            .get_mut(&lease.partition_id)
            .ok_or_else(|| StorageError::not_found(format!("lease {}", lease.partition_id)))?;

        if stored.token != lease.token {
            return Ok(AcquireOutcome::AlreadyOwned {
                owner: stored.owner.clone(),
            });
        }

        stored.owner = Some(worker_id.to_string());
        stored.token = Self::new_token();
        stored.expires_at = Utc::now() + chrono_interval(lease_interval);
        stored.epoch += 1;
        Ok(AcquireOutcome::Acquired(stored.clone()))
    }

    async fn release(&self, lease: &Lease) -> Result<ReleaseOutcome, StorageError> {
        let mut state = self.state.lock().await;
        let stored = state
            .leases
            .get_mut(&lease.partition_id)
            .ok_or_else(|| StorageError::not_found(format!("lease {}", lease.partition_id)))?;

        if stored.token != lease.token {
            return Ok(ReleaseOutcome::Lost);
        }

        stored.owner = None;
        stored.token = Self::new_token();
        stored.expires_at = Utc::now();
        stored.epoch += 1;
        Ok(ReleaseOutcome::Released)
    }

    async fn list_leases(&self) -> Result<Vec<Lease>, StorageError> {
        let state = self.state.lock().await;
        let mut leases: Vec<Lease> = state.leases.values().cloned().collect();
        leases.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(leases)
    }

    async fn delete_all(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.hub_info = None;
        state.leases.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// History store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ExecutionRow {
    events: Vec<HistoryEvent>,
    etag: i64,
    blob_names: Vec<String>,
}

#[derive(Debug, Clone)]
struct InstanceRow {
    current_execution_id: String,
    execution_order: Vec<String>,
    summaries: HashMap<String, OrchestrationState>,
}

#[derive(Debug, Default)]
struct HistoryStoreState {
    // Keyed by instance id; executions keyed by execution id within.
    instances: HashMap<String, InstanceRow>,
    executions: HashMap<(String, String), ExecutionRow>,
}

/// In-memory optimistic-concurrency history store.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    state: Mutex<HistoryStoreState>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn ensure_store(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn drop_store(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.instances.clear();
        state.executions.clear();
        Ok(())
    }

    async fn get_history(
        &self,
        instance_id: &str,
        execution_id: Option<&str>,
    ) -> Result<Option<HistoryRecord>, StorageError> {
        let state = self.state.lock().await;
        let instance = match state.instances.get(instance_id) {
            Some(instance) => instance,
            None => return Ok(None),
        };

        let execution_id = execution_id
            .map(str::to_string)
            .unwrap_or_else(|| instance.current_execution_id.clone());

        Ok(state
            .executions
            .get(&(instance_id.to_string(), execution_id.clone()))
            .map(|row| HistoryRecord {
                execution_id,
                events: row.events.clone(),
                etag: row.etag,
            }))
    }

    async fn update_state(
        &self,
        runtime_state: &OrchestrationRuntimeState,
        instance_id: &str,
        execution_id: &str,
        expected_etag: Option<i64>,
        history_event_blob_names: &[String],
    ) -> Result<i64, StorageError> {
        let mut state = self.state.lock().await;
        let key = (instance_id.to_string(), execution_id.to_string());

        // The entire append + summary write happens under one lock, so a
        // failed precondition leaves nothing behind.
        let current_etag = state.executions.get(&key).map(|row| row.etag);
        if current_etag != expected_etag {
            return Err(StorageError::precondition_failed(format!(
                "instance {instance_id} execution {execution_id}: expected etag {expected_etag:?}, stored {current_etag:?}"
            )));
        }

        let row = state.executions.entry(key).or_insert_with(|| ExecutionRow {
            events: Vec::new(),
            etag: 0,
            blob_names: Vec::new(),
        });

        row.events.extend(runtime_state.new_events().iter().cloned());
        row.etag += 1;
        row.blob_names
            .extend(history_event_blob_names.iter().cloned());
        let new_etag = row.etag;

        // Summary row last, mirroring the batched-write ordering rule.
        if let Some(mut summary) = runtime_state.to_orchestration_state() {
            summary.orchestration_instance.execution_id = Some(execution_id.to_string());
            let instance = state
                .instances
                .entry(instance_id.to_string())
                .or_insert_with(|| InstanceRow {
                    current_execution_id: execution_id.to_string(),
                    execution_order: vec![execution_id.to_string()],
                    summaries: HashMap::new(),
                });
            if !instance.execution_order.iter().any(|e| e == execution_id) {
                instance.execution_order.push(execution_id.to_string());
            }
            instance.current_execution_id = execution_id.to_string();
            instance
                .summaries
                .insert(execution_id.to_string(), summary);
        }

        Ok(new_etag)
    }

    async fn set_new_execution(
        &self,
        instance: &OrchestrationInstance,
        started: &HistoryEvent,
    ) -> Result<(), StorageError> {
        let (name, version, input, timestamp) = match started {
            HistoryEvent::ExecutionStarted {
                name,
                version,
                input,
                timestamp,
                ..
            } => (name.clone(), version.clone(), input.clone(), *timestamp),
            other => {
                return Err(StorageError::permanent(
                    "set_new_execution",
                    format!("expected execution_started event, got {}", other.event_type_name()),
                ))
            }
        };

        let execution_id = instance
            .execution_id
            .clone()
            .ok_or_else(|| StorageError::permanent("set_new_execution", "missing execution id"))?;

        let mut state = self.state.lock().await;
        let summary = OrchestrationState {
            orchestration_instance: instance.clone(),
            name,
            version,
            status: crate::history::OrchestrationStatus::Pending,
            created_at: timestamp,
            last_updated_at: timestamp,
            completed_at: None,
            input,
            output: None,
            custom_status: None,
        };

        let row = state
            .instances
            .entry(instance.instance_id.clone())
            .or_insert_with(|| InstanceRow {
                current_execution_id: execution_id.clone(),
                execution_order: Vec::new(),
                summaries: HashMap::new(),
            });
        row.current_execution_id = execution_id.clone();
        if !row.execution_order.iter().any(|e| e == &execution_id) {
            row.execution_order.push(execution_id.clone());
        }
        row.summaries.insert(execution_id, summary);
        Ok(())
    }

    async fn get_state(
        &self,
        instance_id: &str,
        all_executions: bool,
    ) -> Result<Vec<OrchestrationState>, StorageError> {
        let state = self.state.lock().await;
        let instance = match state.instances.get(instance_id) {
            Some(instance) => instance,
            None => return Ok(Vec::new()),
        };

        if all_executions {
            Ok(instance
                .execution_order
                .iter()
                .filter_map(|id| instance.summaries.get(id))
                .cloned()
                .collect())
        } else {
            Ok(instance
                .summaries
                .get(&instance.current_execution_id)
                .cloned()
                .into_iter()
                .collect())
        }
    }

    async fn query_state(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<OrchestrationState>, StorageError> {
        let state = self.state.lock().await;
        let mut matches: Vec<OrchestrationState> = state
            .instances
            .values()
            .filter_map(|row| row.summaries.get(&row.current_execution_id))
            .filter(|summary| filter.matches(summary))
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            a.orchestration_instance
                .instance_id
                .cmp(&b.orchestration_instance.instance_id)
        });
        Ok(matches)
    }

    async fn rewind_history(&self, instance_id: &str) -> Result<Vec<String>, StorageError> {
        let mut state = self.state.lock().await;
        let current_execution_id = state
            .instances
            .get(instance_id)
            .map(|row| row.current_execution_id.clone())
            .ok_or_else(|| StorageError::not_found(format!("instance {instance_id}")))?;

        let key = (instance_id.to_string(), current_execution_id.clone());
        if let Some(row) = state.executions.get_mut(&key) {
            let rewritten = neutralize_failures(&mut row.events);
            if rewritten > 0 {
                row.etag += 1;
            }
        }

        if let Some(instance) = state.instances.get_mut(instance_id) {
            if let Some(summary) = instance.summaries.get_mut(&current_execution_id) {
                summary.status = crate::history::OrchestrationStatus::Pending;
                summary.completed_at = None;
                summary.output = None;
                summary.last_updated_at = Utc::now();
            }
        }

        // No sub-orchestration events exist in this core, so there are no
        // descendants to revive.
        Ok(Vec::new())
    }

    async fn purge_instance_history(&self, instance_id: &str) -> Result<PurgeResult, StorageError> {
        let mut state = self.state.lock().await;
        let mut result = PurgeResult::default();

        if let Some(instance) = state.instances.remove(instance_id) {
            for execution_id in instance.execution_order {
                if let Some(row) = state
                    .executions
                    .remove(&(instance_id.to_string(), execution_id))
                {
                    result.instances_purged += 1;
                    result.blob_names.extend(row.blob_names);
                }
            }
        }
        Ok(result)
    }

    async fn purge_by_filter(&self, filter: &InstanceFilter) -> Result<PurgeResult, StorageError> {
        let matching: Vec<String> = {
            let state = self.state.lock().await;
            state
                .instances
                .iter()
                .filter(|(_, row)| {
                    row.summaries
                        .get(&row.current_execution_id)
                        .map(|s| filter.matches(s))
                        .unwrap_or(false)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut result = PurgeResult::default();
        for instance_id in matching {
            result.merge(self.purge_instance_history(&instance_id).await?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::OrchestrationStatus;
    use serde_json::json;

    #[tokio::test]
    async fn queue_visibility_timeout_round_trip() {
        let queue = InMemoryMessageQueue::new();
        queue.create_queue_if_not_exists("q1").await.unwrap();
        queue.send("q1", "hello", None).await.unwrap();

        let batch = queue
            .receive_batch("q1", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].dequeue_count, 1);

        // Invisible while locked.
        let empty = queue
            .receive_batch("q1", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert!(empty.is_empty());

        // Abandon restores visibility immediately and redelivery bumps the count.
        queue
            .set_visibility("q1", batch[0].msg_id, Duration::ZERO)
            .await
            .unwrap();
        let again = queue
            .receive_batch("q1", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].dequeue_count, 2);

        assert!(queue.delete("q1", again[0].msg_id).await.unwrap());
        assert!(!queue.delete("q1", again[0].msg_id).await.unwrap());
    }

    #[tokio::test]
    async fn delayed_messages_stay_invisible() {
        let queue = InMemoryMessageQueue::new();
        queue.create_queue_if_not_exists("q1").await.unwrap();
        queue
            .send("q1", "later", Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let batch = queue
            .receive_batch("q1", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert_eq!(queue.queue_depth("q1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lease_acquire_renew_steal_release() {
        let store = InMemoryLeaseStore::new();
        store.create_lease_if_not_exists("p0").await.unwrap();
        let interval = Duration::from_secs(30);

        let lease = match store.acquire("p0", "worker-a", interval).await.unwrap() {
            AcquireOutcome::Acquired(lease) => lease,
            other => panic!("expected acquire, got {other:?}"),
        };
        assert_eq!(lease.owner.as_deref(), Some("worker-a"));

        // A second worker cannot acquire a held lease.
        assert!(matches!(
            store.acquire("p0", "worker-b", interval).await.unwrap(),
            AcquireOutcome::AlreadyOwned { .. }
        ));

        // But it can steal it, invalidating the old token.
        let stolen = match store.steal(&lease, "worker-b", interval).await.unwrap() {
            AcquireOutcome::Acquired(stolen) => stolen,
            other => panic!("expected steal, got {other:?}"),
        };
        assert_eq!(stolen.owner.as_deref(), Some("worker-b"));
        assert!(stolen.epoch > lease.epoch);

        // The original owner discovers the loss on renewal.
        assert!(matches!(
            store.renew(&lease, interval).await.unwrap(),
            RenewOutcome::Lost
        ));
        assert_eq!(store.release(&lease).await.unwrap(), ReleaseOutcome::Lost);

        // The thief can release cleanly.
        assert_eq!(store.release(&stolen).await.unwrap(), ReleaseOutcome::Released);
        let leases = store.list_leases().await.unwrap();
        assert!(leases[0].is_available());
    }

    #[tokio::test]
    async fn hub_info_read_through_create() {
        let store = InMemoryLeaseStore::new();
        let info = TaskHubInfo {
            task_hub_name: "hub".to_string(),
            partition_count: 4,
            created_at: Utc::now(),
        };

        let first = store.get_or_create_task_hub_info(&info).await.unwrap();
        assert_eq!(first.partition_count, 4);

        // A conflicting default loses to the stored sentinel.
        let conflicting = TaskHubInfo {
            partition_count: 8,
            ..info
        };
        let second = store.get_or_create_task_hub_info(&conflicting).await.unwrap();
        assert_eq!(second.partition_count, 4);
    }

    #[tokio::test]
    async fn history_etag_guards_concurrent_writers() {
        let store = InMemoryHistoryStore::new();
        let started = HistoryEvent::execution_started("i1", "flow", "1.0", Some(json!(1)));
        let instance = match &started {
            HistoryEvent::ExecutionStarted {
                orchestration_instance,
                ..
            } => orchestration_instance.clone(),
            _ => unreachable!(),
        };
        let execution_id = instance.execution_id.clone().unwrap();

        store.set_new_execution(&instance, &started).await.unwrap();

        let mut state = OrchestrationRuntimeState::default();
        state.append_event(started.clone());
        let etag = store
            .update_state(&state, "i1", &execution_id, None, &[])
            .await
            .unwrap();
        assert_eq!(etag, 1);

        // A stale writer loses.
        let stale = store.update_state(&state, "i1", &execution_id, None, &[]).await;
        assert!(matches!(stale, Err(StorageError::PreconditionFailed { .. })));

        // The winner can continue from the new etag.
        state.checkpoint_committed();
        state.append_event(HistoryEvent::ExecutionCompleted {
            event_id: 1,
            timestamp: Utc::now(),
            orchestration_status: OrchestrationStatus::Completed,
            result: None,
            failure_details: None,
        });
        let etag = store
            .update_state(&state, "i1", &execution_id, Some(etag), &[])
            .await
            .unwrap();
        assert_eq!(etag, 2);

        let record = store.get_history("i1", None).await.unwrap().unwrap();
        assert_eq!(record.events.len(), 2);
        assert_eq!(record.etag, 2);

        let summaries = store.get_state("i1", false).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].status, OrchestrationStatus::Completed);
    }

    #[tokio::test]
    async fn rewind_neutralizes_failures_and_resets_summary() {
        let store = InMemoryHistoryStore::new();
        let started = HistoryEvent::execution_started("i1", "flow", "1.0", None);
        let instance = match &started {
            HistoryEvent::ExecutionStarted {
                orchestration_instance,
                ..
            } => orchestration_instance.clone(),
            _ => unreachable!(),
        };
        let execution_id = instance.execution_id.clone().unwrap();
        store.set_new_execution(&instance, &started).await.unwrap();

        let mut state = OrchestrationRuntimeState::default();
        state.append_event(started);
        state.append_event(HistoryEvent::TaskScheduled {
            event_id: 0,
            timestamp: Utc::now(),
            name: "step".to_string(),
            version: "1.0".to_string(),
            input: None,
        });
        state.append_event(HistoryEvent::TaskFailed {
            event_id: 1,
            timestamp: Utc::now(),
            task_scheduled_id: 0,
            reason: Some("boom".to_string()),
            details: None,
        });
        state.append_event(HistoryEvent::ExecutionCompleted {
            event_id: 2,
            timestamp: Utc::now(),
            orchestration_status: OrchestrationStatus::Failed,
            result: None,
            failure_details: Some("boom".to_string()),
        });
        store
            .update_state(&state, "i1", &execution_id, None, &[])
            .await
            .unwrap();

        let descendants = store.rewind_history("i1").await.unwrap();
        assert!(descendants.is_empty());

        let record = store.get_history("i1", None).await.unwrap().unwrap();
        assert!(record.events.iter().all(|e| !e.is_failure()));

        let summary = &store.get_state("i1", false).await.unwrap()[0];
        assert_eq!(summary.status, OrchestrationStatus::Pending);
    }

    #[tokio::test]
    async fn purge_removes_rows_and_reports_blobs() {
        let store = InMemoryHistoryStore::new();
        let started = HistoryEvent::execution_started("i1", "flow", "1.0", None);
        let instance = match &started {
            HistoryEvent::ExecutionStarted {
                orchestration_instance,
                ..
            } => orchestration_instance.clone(),
            _ => unreachable!(),
        };
        let execution_id = instance.execution_id.clone().unwrap();
        store.set_new_execution(&instance, &started).await.unwrap();

        let mut state = OrchestrationRuntimeState::default();
        state.append_event(started);
        store
            .update_state(
                &state,
                "i1",
                &execution_id,
                None,
                &["i1/blob-a.json.gz".to_string()],
            )
            .await
            .unwrap();

        let result = store.purge_instance_history("i1").await.unwrap();
        assert_eq!(result.instances_purged, 1);
        assert_eq!(result.blob_names, vec!["i1/blob-a.json.gz".to_string()]);
        assert!(store.get_history("i1", None).await.unwrap().is_none());
        assert!(store.get_state("i1", false).await.unwrap().is_empty());
    }
}
