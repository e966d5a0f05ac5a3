//! # Orchestration Service Facade
//!
//! ## Architecture: Work-Item and Client Contracts over Leased Partitions
//!
//! The facade wires the leaf components together and exposes two surfaces:
//!
//! - **Work-item contract** for the dispatcher host: lock/renew/complete/
//!   abandon/release for orchestration sessions and activity invocations.
//!   Completion runs the three-phase checkpoint (enqueue outbound → commit
//!   history under the session etag → delete inbound), which is what makes
//!   logical progress exactly-once under crashes and duplicate delivery.
//! - **Client contract** for instance management: create, send messages,
//!   terminate, rewind, query state and history, purge, and completion
//!   waits.
//!
//! Only optimistic-concurrency conflicts and cancellation are recovered
//! here; every other error releases the current work item and propagates so
//! the dispatcher can apply its own backoff.

use crate::config::TaskHubConfig;
use crate::constants::{
    control_queue_name, large_message_container_name, work_item_queue_name,
    COMPLETION_POLL_INTERVAL_MS,
};
use crate::error::{Result, TaskHubError};
use crate::history::{
    HistoryEvent, InstanceFilter, OrchestrationInstance, OrchestrationRuntimeState,
    OrchestrationState, OrchestrationStatus, EXTERNAL_EVENT_ID,
};
use crate::leasing::PartitionManager;
use crate::messaging::{ControlQueue, LargeMessageCodec, TaskMessage, WorkItemQueue};
use crate::orchestration::stats::{HubStats, HubStatsSnapshot};
use crate::orchestration::work_items::{
    lock_expiry, TaskActivityWorkItem, TaskOrchestrationWorkItem,
};
use crate::partition::partition_index;
use crate::sessions::SessionManager;
use crate::storage::{
    BlobStore, HistoryStore, LeaseStore, MessageQueue, StorageError, TaskHubInfo,
};
use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The four storage primitives a task hub runs on.
#[derive(Clone)]
pub struct StorageBackend {
    pub queue: Arc<dyn MessageQueue>,
    pub blobs: Arc<dyn BlobStore>,
    pub leases: Arc<dyn LeaseStore>,
    pub history: Arc<dyn HistoryStore>,
}

impl StorageBackend {
    /// Single-process backend for tests and development hosts.
    pub fn in_memory() -> Self {
        use crate::storage::memory::{
            InMemoryBlobStore, InMemoryHistoryStore, InMemoryLeaseStore, InMemoryMessageQueue,
        };
        Self {
            queue: Arc::new(InMemoryMessageQueue::new()),
            blobs: Arc::new(InMemoryBlobStore::new()),
            leases: Arc::new(InMemoryLeaseStore::new()),
            history: Arc::new(InMemoryHistoryStore::new()),
        }
    }

    /// Postgres/pgmq backend sharing one connection pool.
    pub fn postgres(pool: sqlx::PgPool, task_hub: &str) -> Self {
        use crate::storage::postgres::{
            PgmqMessageQueue, PostgresBlobStore, PostgresHistoryStore, PostgresLeaseStore,
        };
        Self {
            queue: Arc::new(PgmqMessageQueue::new(pool.clone())),
            blobs: Arc::new(PostgresBlobStore::new(pool.clone())),
            leases: Arc::new(PostgresLeaseStore::new(pool.clone(), task_hub)),
            history: Arc::new(PostgresHistoryStore::new(pool, task_hub)),
        }
    }
}

/// Durable task orchestration service for one task hub.
pub struct OrchestrationService {
    config: Arc<TaskHubConfig>,
    storage: StorageBackend,
    codec: Arc<LargeMessageCodec>,
    control_queues: Vec<Arc<ControlQueue>>,
    work_item_queue: Arc<WorkItemQueue>,
    session_manager: Arc<SessionManager>,
    partition_manager: Arc<PartitionManager>,
    storage_semaphore: Arc<Semaphore>,
    stats: Arc<HubStats>,
    shutdown: CancellationToken,
}

impl OrchestrationService {
    pub fn new(config: TaskHubConfig, storage: StorageBackend) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();
        let stats = Arc::new(HubStats::default());

        let codec = Arc::new(LargeMessageCodec::new(
            storage.blobs.clone(),
            large_message_container_name(&config.task_hub_name),
            config.large_message_threshold_bytes,
        ));

        let control_queues: Vec<Arc<ControlQueue>> = (0..config.partition_count)
            .map(|index| {
                Arc::new(ControlQueue::new(
                    storage.queue.clone(),
                    codec.clone(),
                    control_queue_name(&config.task_hub_name, index),
                    config.control_queue_visibility_timeout,
                    config.control_queue_batch_size,
                ))
            })
            .collect();

        let work_item_queue = Arc::new(WorkItemQueue::new(
            storage.queue.clone(),
            codec.clone(),
            work_item_queue_name(&config.task_hub_name),
            config.work_item_queue_visibility_timeout,
        ));

        let session_manager = Arc::new(SessionManager::new(
            config.clone(),
            storage.history.clone(),
            storage.queue.clone(),
            codec.clone(),
            stats.clone(),
            shutdown.clone(),
        ));

        let partition_manager = Arc::new(PartitionManager::new(
            storage.leases.clone(),
            config.clone(),
            Arc::new(session_manager.clone()),
            shutdown.clone(),
        ));

        let storage_semaphore = Arc::new(Semaphore::new(config.max_storage_operation_concurrency));

        Ok(Self {
            config,
            storage,
            codec,
            control_queues,
            work_item_queue,
            session_manager,
            partition_manager,
            storage_semaphore,
            stats,
            shutdown,
        })
    }

    pub fn config(&self) -> &TaskHubConfig {
        &self.config
    }

    pub fn stats(&self) -> HubStatsSnapshot {
        self.stats.snapshot()
    }

    /// Token linked into every long-running wait of this service.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Partitions currently leased by this worker.
    pub async fn owned_partitions(&self) -> Vec<String> {
        self.partition_manager.owned_partitions().await
    }

    // -----------------------------------------------------------------------
    // Task hub management
    // -----------------------------------------------------------------------

    /// Idempotently provision queues, containers, leases, and the history
    /// store for this hub. Fails fast when the stored partition count
    /// disagrees with the configuration.
    pub async fn create_if_not_exists(&self) -> Result<()> {
        let hub = &self.config.task_hub_name;

        self.storage.history.ensure_store().await?;

        for index in 0..self.config.partition_count {
            self.storage
                .queue
                .create_queue_if_not_exists(&control_queue_name(hub, index))
                .await?;
        }
        self.storage
            .queue
            .create_queue_if_not_exists(&work_item_queue_name(hub))
            .await?;
        self.storage
            .blobs
            .create_container_if_not_exists(self.codec.container())
            .await?;

        let hub_info = TaskHubInfo {
            task_hub_name: hub.clone(),
            partition_count: self.config.partition_count,
            created_at: Utc::now(),
        };
        self.storage.leases.create_if_not_exists(&hub_info).await?;
        let stored = self
            .storage
            .leases
            .get_or_create_task_hub_info(&hub_info)
            .await?;
        if stored.partition_count != self.config.partition_count {
            return Err(TaskHubError::configuration(format!(
                "task hub {hub} was created with {} partitions, configured for {}; \
                 the partition count is immutable",
                stored.partition_count, self.config.partition_count
            )));
        }

        for index in 0..self.config.partition_count {
            self.storage
                .leases
                .create_lease_if_not_exists(&control_queue_name(hub, index))
                .await?;
        }

        info!(
            task_hub = %hub,
            partition_count = self.config.partition_count,
            "Task hub provisioned"
        );
        Ok(())
    }

    /// Remove every queue, container, lease, and history row of this hub.
    pub async fn delete_task_hub(&self) -> Result<()> {
        let hub = &self.config.task_hub_name;
        for index in 0..self.config.partition_count {
            self.storage
                .queue
                .drop_queue(&control_queue_name(hub, index))
                .await?;
        }
        self.storage
            .queue
            .drop_queue(&work_item_queue_name(hub))
            .await?;
        self.storage
            .blobs
            .drop_container(self.codec.container())
            .await?;
        self.storage.leases.delete_all().await?;
        self.storage.history.drop_store().await?;
        info!(task_hub = %hub, "Task hub deleted");
        Ok(())
    }

    /// Provision the hub and start partition ownership and dispatch.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.config.validate()?;
        self.create_if_not_exists().await?;
        self.partition_manager.initialize().await?;
        self.partition_manager.start().await?;
        info!(
            task_hub = %self.config.task_hub_name,
            worker_id = %self.config.worker_id,
            "Orchestration service started"
        );
        Ok(())
    }

    /// Cancel every wait, stop lease maintenance, and release partitions.
    pub async fn stop(&self) {
        info!(worker_id = %self.config.worker_id, "Stopping orchestration service");
        self.shutdown.cancel();
        self.partition_manager.stop().await;
    }

    // -----------------------------------------------------------------------
    // Orchestration work-item contract
    // -----------------------------------------------------------------------

    /// Block until an orchestration session is ready, filtering out batches
    /// for instances that cannot execute.
    pub async fn lock_next_task_orchestration_work_item(
        &self,
        receive_timeout: Duration,
        ctx: &CancellationToken,
    ) -> Result<Option<TaskOrchestrationWorkItem>> {
        let deadline = tokio::time::Instant::now() + receive_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let work_item = match self.session_manager.get_next_session(remaining, ctx).await {
                Some(work_item) => work_item,
                None => return Ok(None),
            };

            if self.is_executable(&work_item) {
                return Ok(Some(work_item));
            }

            // Non-executable batch: delete the messages and drop the
            // session without any state change.
            warn!(
                instance_id = %work_item.instance_id,
                status = %work_item.runtime_state.status(),
                batch_size = work_item.new_messages.len(),
                "Discarding message batch for non-executable instance"
            );
            HubStats::increment(&self.stats.orchestration_work_items_discarded);
            self.session_manager
                .delete_current_batch(&work_item.instance_id)
                .await?;
            self.session_manager
                .mark_session_dead(&work_item.instance_id)
                .await;
            self.session_manager
                .release_session(&work_item.instance_id)
                .await;
        }
    }

    fn is_executable(&self, work_item: &TaskOrchestrationWorkItem) -> bool {
        let state = &work_item.runtime_state;
        let batch_start_execution = work_item.new_messages.iter().find_map(|m| match &m.event {
            HistoryEvent::ExecutionStarted {
                orchestration_instance,
                ..
            } => Some(orchestration_instance.execution_id.clone()),
            _ => None,
        });

        if state.execution_started().is_none() {
            // Unknown instance: only an ExecutionStarted batch can run.
            return batch_start_execution.is_some();
        }

        if state.status().is_terminal() {
            // A finished generation only executes again when a new
            // generation is being started (restart or continue-as-new).
            return match batch_start_execution {
                Some(new_execution) => new_execution != work_item.execution_id,
                None => false,
            };
        }

        true
    }

    /// Extend the visibility of the work item's inbound batch.
    pub async fn renew_task_orchestration_work_item_lock(
        &self,
        work_item: &mut TaskOrchestrationWorkItem,
    ) -> Result<()> {
        self.session_manager
            .renew_session_batch(&work_item.instance_id)
            .await?;
        work_item.lock_expires_at = lock_expiry(self.config.control_queue_visibility_timeout);
        Ok(())
    }

    /// Three-phase checkpoint of one orchestration work item.
    ///
    /// Phase 1 enqueues every outbound message (duplicates on retry are
    /// acceptable, downstream dedups via history). Phase 2 commits the
    /// history under the session's etag; a conflict abandons the inbound
    /// batch and recovers. Phase 3 deletes the consumed inbound messages.
    pub async fn complete_task_orchestration_work_item(
        &self,
        work_item: &TaskOrchestrationWorkItem,
        new_state: OrchestrationRuntimeState,
        outbound: Vec<TaskMessage>,
        orchestrator_messages: Vec<TaskMessage>,
        timer_messages: Vec<TaskMessage>,
        continued_as_new: Option<TaskMessage>,
    ) -> Result<()> {
        let instance_id = work_item.instance_id.clone();

        // Phase 1 — commit outbound messages, bounded by the storage
        // semaphore.
        let current_queue = self.control_queue_by_name(&work_item.partition_id);
        let mut sends: Vec<BoxFuture<'static, Result<Option<String>>>> = Vec::new();

        for message in orchestrator_messages {
            let queue = self.control_queue_for_instance(message.instance_id());
            sends.push(self.boxed_control_send(queue, message));
        }
        for message in timer_messages {
            sends.push(self.boxed_control_send(current_queue.clone(), message));
        }
        if let Some(message) = continued_as_new {
            sends.push(self.boxed_control_send(current_queue.clone(), message));
        }
        for message in outbound {
            let queue = self.work_item_queue.clone();
            let semaphore = self.storage_semaphore.clone();
            let stats = self.stats.clone();
            sends.push(Box::pin(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| TaskHubError::Canceled)?;
                let enqueued = queue.enqueue(&message).await?;
                HubStats::increment(&stats.messages_sent);
                Ok(enqueued.blob_name)
            }));
        }

        let mut blob_names = Vec::new();
        for result in join_all(sends).await {
            // Any enqueue failure aborts the checkpoint; the inbound batch
            // stays invisible and replays after its timeout.
            blob_names.extend(result?);
        }

        // Phase 2 — commit history with optimistic concurrency.
        let commit_execution_id = new_state
            .orchestration_instance()
            .and_then(|instance| instance.execution_id.clone())
            .or_else(|| work_item.effective_execution_id())
            .ok_or_else(|| {
                TaskHubError::invalid_operation(format!(
                    "work item for {instance_id} has no execution id to commit under"
                ))
            })?;
        let expected_etag =
            if work_item.execution_id.as_deref() == Some(commit_execution_id.as_str()) {
                work_item.etag
            } else {
                // A fresh generation starts from an absent history row.
                None
            };

        let new_etag = match self
            .storage
            .history
            .update_state(
                &new_state,
                &instance_id,
                &commit_execution_id,
                expected_etag,
                &blob_names,
            )
            .await
        {
            Ok(new_etag) => new_etag,
            Err(StorageError::PreconditionFailed { message }) => {
                warn!(
                    instance_id = %instance_id,
                    detail = %message,
                    "History commit lost optimistic concurrency race, abandoning batch"
                );
                HubStats::increment(&self.stats.precondition_conflicts);
                if let Err(error) =
                    self.session_manager.abandon_current_batch(&instance_id).await
                {
                    warn!(instance_id = %instance_id, error = %error, "Abandon after conflict failed");
                }
                self.session_manager.mark_session_dead(&instance_id).await;
                self.session_manager.release_session(&instance_id).await;
                return Ok(());
            }
            Err(error) => {
                error!(
                    instance_id = %instance_id,
                    error = %error,
                    "History commit failed; inbound messages stay locked until timeout"
                );
                return Err(error.into());
            }
        };

        // Phase 3 — delete the consumed inbound batch.
        self.session_manager.delete_current_batch(&instance_id).await?;

        let mut committed_state = new_state;
        committed_state.checkpoint_committed();
        self.session_manager
            .checkpoint_session(
                &instance_id,
                committed_state,
                Some(commit_execution_id),
                new_etag,
            )
            .await;

        HubStats::increment(&self.stats.checkpoints_committed);
        HubStats::increment(&self.stats.orchestration_work_items_completed);
        debug!(instance_id = %instance_id, etag = new_etag, "Checkpoint committed");
        Ok(())
    }

    /// Restore visibility of the work item's inbound batch immediately.
    pub async fn abandon_task_orchestration_work_item(
        &self,
        work_item: &TaskOrchestrationWorkItem,
    ) -> Result<()> {
        HubStats::increment(&self.stats.orchestration_work_items_abandoned);
        self.session_manager
            .abandon_current_batch(&work_item.instance_id)
            .await?;
        Ok(())
    }

    /// Return the session to the manager (pending batch, warm cache, or
    /// drop).
    pub async fn release_task_orchestration_work_item(
        &self,
        work_item: &TaskOrchestrationWorkItem,
    ) -> Result<()> {
        self.session_manager
            .release_session(&work_item.instance_id)
            .await;
        Ok(())
    }

    fn boxed_control_send(
        &self,
        queue: Arc<ControlQueue>,
        message: TaskMessage,
    ) -> BoxFuture<'static, Result<Option<String>>> {
        let semaphore = self.storage_semaphore.clone();
        let stats = self.stats.clone();
        Box::pin(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| TaskHubError::Canceled)?;
            let enqueued = queue.enqueue(&message).await?;
            HubStats::increment(&stats.messages_sent);
            Ok(enqueued.blob_name)
        })
    }

    // -----------------------------------------------------------------------
    // Activity work-item contract
    // -----------------------------------------------------------------------

    /// Block until an activity invocation is available.
    pub async fn lock_next_task_activity_work_item(
        &self,
        receive_timeout: Duration,
        ctx: &CancellationToken,
    ) -> Result<Option<TaskActivityWorkItem>> {
        let deadline = tokio::time::Instant::now() + receive_timeout;
        let mut backoff = self.config.poll_backoff_min;
        loop {
            if ctx.is_cancelled() || self.shutdown.is_cancelled() {
                return Ok(None);
            }

            if let Some(message) = self.work_item_queue.dequeue_one().await? {
                if !matches!(message.task_message.event, HistoryEvent::TaskScheduled { .. }) {
                    warn!(
                        msg_id = message.msg_id,
                        event_type = message.task_message.event.event_type_name(),
                        "Non-activity message on the work-item queue, deleting"
                    );
                    self.work_item_queue.delete(&message).await?;
                    continue;
                }
                return Ok(Some(TaskActivityWorkItem::new(
                    message,
                    lock_expiry(self.config.work_item_queue_visibility_timeout),
                )));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff.min(remaining)) => {}
                _ = ctx.cancelled() => return Ok(None),
                _ = self.shutdown.cancelled() => return Ok(None),
            }
            backoff = (backoff * 2).min(self.config.poll_backoff_max);
        }
    }

    /// Extend the queue lock of an in-flight activity.
    pub async fn renew_task_activity_work_item_lock(
        &self,
        work_item: &mut TaskActivityWorkItem,
    ) -> Result<()> {
        self.work_item_queue.renew(&work_item.message).await?;
        work_item.lock_expires_at = lock_expiry(self.config.work_item_queue_visibility_timeout);
        Ok(())
    }

    /// Post the activity's response to the instance's control queue, then
    /// delete the work item. A crash in between duplicates the response,
    /// which replay dedups by event id.
    pub async fn complete_task_activity_work_item(
        &self,
        work_item: &TaskActivityWorkItem,
        response: TaskMessage,
    ) -> Result<()> {
        let queue = self.control_queue_for_instance(response.instance_id());
        queue.enqueue(&response).await?;
        HubStats::increment(&self.stats.messages_sent);
        self.work_item_queue.delete(&work_item.message).await?;
        HubStats::increment(&self.stats.activity_work_items_completed);
        Ok(())
    }

    /// Restore the work item's visibility immediately.
    pub async fn abandon_task_activity_work_item(
        &self,
        work_item: &TaskActivityWorkItem,
    ) -> Result<()> {
        self.work_item_queue.abandon(&work_item.message).await?;
        HubStats::increment(&self.stats.activity_work_items_abandoned);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Client contract
    // -----------------------------------------------------------------------

    /// Create a new orchestration instance.
    ///
    /// `dedupe_statuses` lists existing statuses that block re-creation;
    /// `None` blocks on every non-terminal status.
    pub async fn create_task_orchestration(
        &self,
        creation_message: TaskMessage,
        dedupe_statuses: Option<&[OrchestrationStatus]>,
    ) -> Result<()> {
        if !matches!(creation_message.event, HistoryEvent::ExecutionStarted { .. }) {
            return Err(TaskHubError::invalid_operation(
                "creation message must carry an execution_started event",
            ));
        }
        let instance = creation_message.orchestration_instance.clone();

        let existing = self
            .storage
            .history
            .get_state(&instance.instance_id, false)
            .await?;
        if let Some(state) = existing.first() {
            let blocked = match dedupe_statuses {
                Some(statuses) => statuses.contains(&state.status),
                None => !state.status.is_terminal(),
            };
            if blocked {
                return Err(TaskHubError::InstanceAlreadyExists {
                    instance_id: instance.instance_id.clone(),
                });
            }
        }

        self.storage
            .history
            .set_new_execution(&instance, &creation_message.event)
            .await?;

        let queue = self.control_queue_for_instance(&instance.instance_id);
        queue.enqueue(&creation_message).await?;
        HubStats::increment(&self.stats.messages_sent);
        HubStats::increment(&self.stats.instances_created);
        info!(
            instance_id = %instance.instance_id,
            execution_id = ?instance.execution_id,
            queue = queue.name(),
            "Orchestration created"
        );
        Ok(())
    }

    /// Route one message to its instance's control queue.
    pub async fn send_task_orchestration_message(&self, message: TaskMessage) -> Result<()> {
        let queue = self.control_queue_for_instance(message.instance_id());
        queue.enqueue(&message).await?;
        HubStats::increment(&self.stats.messages_sent);
        Ok(())
    }

    /// Route a batch of messages in parallel, bounded by the storage
    /// semaphore.
    pub async fn send_task_orchestration_message_batch(
        &self,
        messages: Vec<TaskMessage>,
    ) -> Result<()> {
        let sends: Vec<_> = messages
            .into_iter()
            .map(|message| {
                let queue = self.control_queue_for_instance(message.instance_id());
                self.boxed_control_send(queue, message)
            })
            .collect();
        for result in join_all(sends).await {
            result?;
        }
        Ok(())
    }

    /// Post a termination event; the next work item moves the instance to
    /// `Terminated`.
    pub async fn force_terminate_task_orchestration(
        &self,
        instance_id: &str,
        reason: &str,
    ) -> Result<()> {
        let message = TaskMessage::new(
            HistoryEvent::ExecutionTerminated {
                event_id: EXTERNAL_EVENT_ID,
                timestamp: Utc::now(),
                reason: Some(reason.to_string()),
            },
            OrchestrationInstance::new(instance_id),
        );
        self.send_task_orchestration_message(message).await
    }

    /// Raise an external event into a running instance.
    pub async fn raise_event(
        &self,
        instance_id: &str,
        event_name: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<()> {
        let message = TaskMessage::new(
            HistoryEvent::EventRaised {
                event_id: EXTERNAL_EVENT_ID,
                timestamp: Utc::now(),
                name: event_name.to_string(),
                input: payload,
            },
            OrchestrationInstance::new(instance_id),
        );
        self.send_task_orchestration_message(message).await
    }

    /// Neutralize failure events and revive the instance and any
    /// descendants the store reports.
    pub async fn rewind_task_orchestration(&self, instance_id: &str, reason: &str) -> Result<()> {
        let descendants = self.storage.history.rewind_history(instance_id).await?;

        let mut revival_targets = vec![instance_id.to_string()];
        revival_targets.extend(descendants);
        for target in revival_targets {
            let message = TaskMessage::new(
                HistoryEvent::GenericEvent {
                    event_id: EXTERNAL_EVENT_ID,
                    timestamp: Utc::now(),
                    data: Some(serde_json::json!({ "rewind_reason": reason })),
                },
                OrchestrationInstance::new(target),
            );
            self.send_task_orchestration_message(message).await?;
        }
        info!(instance_id, reason, "Orchestration rewound");
        Ok(())
    }

    /// Current generation's summary, or every generation's.
    pub async fn get_orchestration_state(
        &self,
        instance_id: &str,
        all_executions: bool,
    ) -> Result<Vec<OrchestrationState>> {
        Ok(self
            .storage
            .history
            .get_state(instance_id, all_executions)
            .await?)
    }

    /// Summaries matching a filter.
    pub async fn get_orchestration_state_with_filter(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<OrchestrationState>> {
        Ok(self.storage.history.query_state(filter).await?)
    }

    /// Committed history of one generation as a JSON string.
    pub async fn get_orchestration_history(
        &self,
        instance_id: &str,
        execution_id: &str,
    ) -> Result<String> {
        let record = self
            .storage
            .history
            .get_history(instance_id, Some(execution_id))
            .await?
            .ok_or_else(|| TaskHubError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        Ok(serde_json::to_string(&record.events)?)
    }

    /// Remove an instance's rows and off-loaded blobs.
    pub async fn purge_instance_history(&self, instance_id: &str) -> Result<u64> {
        let result = self
            .storage
            .history
            .purge_instance_history(instance_id)
            .await?;
        for blob_name in &result.blob_names {
            let _ = self.codec.delete_blob(blob_name).await;
        }
        self.codec.purge_instance_blobs(instance_id).await?;
        debug!(
            instance_id,
            purged = result.instances_purged,
            "Instance history purged"
        );
        Ok(result.instances_purged)
    }

    /// Purge every instance matching a filter.
    pub async fn purge_history_by_filter(&self, filter: &InstanceFilter) -> Result<u64> {
        let matching = self.storage.history.query_state(filter).await?;
        let mut purged = 0u64;
        for state in matching {
            purged += self
                .purge_instance_history(&state.orchestration_instance.instance_id)
                .await?;
        }
        Ok(purged)
    }

    /// Poll until the instance (or a specific generation) reaches a
    /// terminal status.
    pub async fn wait_for_orchestration(
        &self,
        instance_id: &str,
        execution_id: Option<&str>,
        timeout: Duration,
        ctx: &CancellationToken,
    ) -> Result<OrchestrationState> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let states = self.get_orchestration_state(instance_id, false).await?;
            if let Some(state) = states.into_iter().next() {
                let generation_matches = execution_id
                    .map(|id| state.orchestration_instance.execution_id.as_deref() == Some(id))
                    .unwrap_or(true);
                if generation_matches && state.status.is_terminal() {
                    return Ok(state);
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(TaskHubError::Timeout {
                    operation: format!("wait_for_orchestration({instance_id})"),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(
                    Duration::from_millis(COMPLETION_POLL_INTERVAL_MS).min(remaining)
                ) => {}
                _ = ctx.cancelled() => return Err(TaskHubError::Canceled),
                _ = self.shutdown.cancelled() => return Err(TaskHubError::Canceled),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Routing helpers
    // -----------------------------------------------------------------------

    fn control_queue_for_instance(&self, instance_id: &str) -> Arc<ControlQueue> {
        let index = partition_index(instance_id, self.config.partition_count) as usize;
        self.control_queues[index].clone()
    }

    fn control_queue_by_name(&self, partition_id: &str) -> Arc<ControlQueue> {
        self.control_queues
            .iter()
            .find(|queue| queue.name() == partition_id)
            .cloned()
            .unwrap_or_else(|| self.control_queues[0].clone())
    }
}
