//! # Orchestration Session Manager
//!
//! ## Architecture: Per-Instance Serialization of Partition Streams
//!
//! Turns the message streams of owned partitions into per-instance
//! *sessions*. At most one session exists per instance id in the process;
//! while it exists, every message for that instance serializes through it.
//!
//! Each acquired partition gets a dequeue loop that pulls message batches,
//! fingerprints them against in-flight deliveries, groups them by instance,
//! fetches history for instances without a live session, and marks sessions
//! ready for dispatch. `get_next_session` hands ready sessions to the host
//! one at a time; messages arriving for a leased-out session buffer into a
//! pending next batch. With extended sessions enabled, an idle session's
//! runtime state stays cached so the next batch skips the history fetch.

use crate::config::TaskHubConfig;
use crate::error::{Result, TaskHubError};
use crate::history::OrchestrationRuntimeState;
use crate::leasing::{LeaseLossReason, PartitionObserver};
use crate::messaging::{ControlQueue, LargeMessageCodec, MessageData};
use crate::orchestration::stats::HubStats;
use crate::orchestration::work_items::{lock_expiry, TaskOrchestrationWorkItem};
use crate::storage::{HistoryStore, Lease, MessageQueue};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    /// Has a message batch and attached state; waiting for a dispatcher.
    Ready,
    /// Handed to the host; new messages buffer into the pending batch.
    LeasedOut,
    /// Extended session kept warm with cached state, no messages.
    Idle,
}

struct Session {
    partition_id: String,
    execution_id: Option<String>,
    etag: Option<i64>,
    runtime_state: OrchestrationRuntimeState,
    current_batch: Vec<MessageData>,
    pending_next: Vec<MessageData>,
    status: SessionStatus,
    /// Partition lost or cache invalidated; drop on release.
    dead: bool,
}

struct PartitionHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    partitions: HashMap<String, PartitionHandle>,
    sessions: HashMap<String, Session>,
    ready: VecDeque<String>,
    in_flight: HashSet<(String, i64)>,
}

/// Per-partition message pumps plus the per-instance session table.
pub struct SessionManager {
    config: Arc<TaskHubConfig>,
    history_store: Arc<dyn HistoryStore>,
    queue: Arc<dyn MessageQueue>,
    codec: Arc<LargeMessageCodec>,
    stats: Arc<HubStats>,
    inner: Mutex<Inner>,
    ready_notify: Notify,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        config: Arc<TaskHubConfig>,
        history_store: Arc<dyn HistoryStore>,
        queue: Arc<dyn MessageQueue>,
        codec: Arc<LargeMessageCodec>,
        stats: Arc<HubStats>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            history_store,
            queue,
            codec,
            stats,
            inner: Mutex::new(Inner::default()),
            ready_notify: Notify::new(),
            shutdown,
        }
    }

    fn make_control_queue(&self, partition_id: &str) -> ControlQueue {
        ControlQueue::new(
            self.queue.clone(),
            self.codec.clone(),
            partition_id.to_string(),
            self.config.control_queue_visibility_timeout,
            self.config.control_queue_batch_size,
        )
    }

    /// Number of live sessions (any status).
    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    /// Partitions with a running dequeue loop.
    pub async fn registered_partitions(&self) -> Vec<String> {
        let mut partitions: Vec<String> =
            self.inner.lock().await.partitions.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Block until a session is ready, the timeout lapses, or the context
    /// cancels. Returns the leased-out work item.
    pub async fn get_next_session(
        self: &Arc<Self>,
        receive_timeout: Duration,
        ctx: &CancellationToken,
    ) -> Option<TaskOrchestrationWorkItem> {
        let deadline = tokio::time::Instant::now() + receive_timeout;
        loop {
            let mut notified = pin!(self.ready_notify.notified());
            notified.as_mut().enable();

            if let Some(work_item) = self.try_take_ready().await {
                return Some(work_item);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return None,
                _ = ctx.cancelled() => return None,
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    async fn try_take_ready(&self) -> Option<TaskOrchestrationWorkItem> {
        let mut inner = self.inner.lock().await;
        while let Some(instance_id) = inner.ready.pop_front() {
            let session = match inner.sessions.get_mut(&instance_id) {
                Some(session) if session.status == SessionStatus::Ready => session,
                // Stale queue entry; the session moved on or is gone.
                _ => continue,
            };

            session.status = SessionStatus::LeasedOut;
            let work_item = TaskOrchestrationWorkItem {
                instance_id: instance_id.clone(),
                execution_id: session.execution_id.clone(),
                partition_id: session.partition_id.clone(),
                new_messages: session
                    .current_batch
                    .iter()
                    .map(|m| m.task_message.clone())
                    .collect(),
                runtime_state: session.runtime_state.clone(),
                etag: session.etag,
                lock_expires_at: lock_expiry(self.config.control_queue_visibility_timeout),
            };
            debug!(
                instance_id = %instance_id,
                partition_id = %work_item.partition_id,
                batch_size = work_item.new_messages.len(),
                "Session leased out"
            );
            return Some(work_item);
        }
        None
    }

    /// Extend the visibility of every message in the session's batch.
    pub async fn renew_session_batch(&self, instance_id: &str) -> Result<()> {
        let (queue_name, batch) = {
            let inner = self.inner.lock().await;
            let session = inner
                .sessions
                .get(instance_id)
                .ok_or_else(|| TaskHubError::invalid_operation(format!(
                    "no live session for instance {instance_id}"
                )))?;
            (session.partition_id.clone(), session.current_batch.clone())
        };

        let control_queue = self.make_control_queue(&queue_name);
        for message in &batch {
            control_queue.renew(message).await?;
        }
        Ok(())
    }

    /// Phase 3 of the checkpoint: delete the consumed batch in parallel.
    ///
    /// The batch leaves the session either way; a message whose delete
    /// failed stays invisible until its timeout and replays as a no-op.
    pub async fn delete_current_batch(&self, instance_id: &str) -> Result<usize> {
        let (partition_id, batch) = match self.take_current_batch(instance_id).await {
            Some(taken) => taken,
            None => return Ok(0),
        };

        let control_queue = Arc::new(self.make_control_queue(&partition_id));
        let deletes = batch.iter().map(|message| {
            let control_queue = control_queue.clone();
            async move { control_queue.delete(message).await }
        });
        let results = join_all(deletes).await;

        let mut deleted = 0usize;
        for result in results {
            match result {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(instance_id, error = %error, "Batch message delete failed");
                }
            }
        }
        Ok(deleted)
    }

    /// Restore visibility of the session's batch immediately.
    pub async fn abandon_current_batch(&self, instance_id: &str) -> Result<usize> {
        let (partition_id, batch) = match self.take_current_batch(instance_id).await {
            Some(taken) => taken,
            None => return Ok(0),
        };

        let control_queue = self.make_control_queue(&partition_id);
        let mut abandoned = 0usize;
        for message in &batch {
            match control_queue.abandon(message).await {
                Ok(_) => abandoned += 1,
                Err(error) => {
                    warn!(instance_id, error = %error, "Batch message abandon failed");
                }
            }
        }
        Ok(abandoned)
    }

    /// Remove the current batch from the session, releasing fingerprints.
    async fn take_current_batch(&self, instance_id: &str) -> Option<(String, Vec<MessageData>)> {
        let mut guard = self.inner.lock().await;
        let Inner {
            sessions,
            in_flight,
            ..
        } = &mut *guard;

        let session = sessions.get_mut(instance_id)?;
        let batch = std::mem::take(&mut session.current_batch);
        let partition_id = session.partition_id.clone();
        for message in &batch {
            in_flight.remove(&message.fingerprint());
        }
        if batch.is_empty() {
            None
        } else {
            Some((partition_id, batch))
        }
    }

    /// Advance the cached session after a committed checkpoint.
    pub async fn checkpoint_session(
        &self,
        instance_id: &str,
        runtime_state: OrchestrationRuntimeState,
        execution_id: Option<String>,
        etag: i64,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get_mut(instance_id) {
            session.runtime_state = runtime_state;
            session.execution_id = execution_id;
            session.etag = Some(etag);
        }
    }

    /// Invalidate a session so its release drops it instead of caching.
    ///
    /// Used on optimistic-concurrency conflicts (the cached state is stale)
    /// and on non-executable batches.
    pub async fn mark_session_dead(&self, instance_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get_mut(instance_id) {
            session.dead = true;
        }
    }

    /// Return a leased-out session: requeue its pending batch, park it warm
    /// (extended sessions), or drop it.
    pub async fn release_session(&self, instance_id: &str) {
        let mut to_abandon: Vec<(String, Vec<MessageData>)> = Vec::new();
        {
            let mut guard = self.inner.lock().await;
            let Inner {
                sessions,
                ready,
                in_flight,
                partitions,
            } = &mut *guard;

            enum ReleaseAction {
                Drop,
                Rearm,
                Park,
                Close,
            }

            let action = {
                let session = match sessions.get_mut(instance_id) {
                    Some(session) => session,
                    None => return,
                };

                let partition_owned = partitions.contains_key(&session.partition_id);
                let drop_session =
                    session.dead || !partition_owned || self.shutdown.is_cancelled();

                // Messages the host never consumed redeliver after their
                // visibility timeout; release their fingerprints now.
                let leftover = std::mem::take(&mut session.current_batch);
                for message in &leftover {
                    in_flight.remove(&message.fingerprint());
                }

                if drop_session {
                    ReleaseAction::Drop
                } else if !session.pending_next.is_empty() {
                    session.current_batch = std::mem::take(&mut session.pending_next);
                    session.status = SessionStatus::Ready;
                    ReleaseAction::Rearm
                } else if self.config.extended_sessions_enabled {
                    session.status = SessionStatus::Idle;
                    ReleaseAction::Park
                } else {
                    ReleaseAction::Close
                }
            };

            match action {
                ReleaseAction::Drop => {
                    let mut session = sessions.remove(instance_id).expect("session exists");
                    let pending = std::mem::take(&mut session.pending_next);
                    for message in &pending {
                        in_flight.remove(&message.fingerprint());
                    }
                    if !pending.is_empty() {
                        to_abandon.push((session.partition_id, pending));
                    }
                    debug!(instance_id, "Session dropped on release");
                }
                ReleaseAction::Rearm => {
                    ready.push_back(instance_id.to_string());
                    debug!(instance_id, "Session re-armed with pending batch");
                }
                ReleaseAction::Park => {
                    debug!(instance_id, "Session parked as extended session");
                }
                ReleaseAction::Close => {
                    sessions.remove(instance_id);
                    debug!(instance_id, "Session closed");
                }
            }
        }
        self.ready_notify.notify_waiters();

        for (partition_id, messages) in to_abandon {
            let control_queue = self.make_control_queue(&partition_id);
            for message in &messages {
                if let Err(error) = control_queue.abandon(message).await {
                    warn!(instance_id, error = %error, "Pending message abandon failed");
                }
            }
        }
    }

    /// Ingest one dequeued batch: dedup in-flight deliveries, group per
    /// instance, route into sessions, fetch history for new instances.
    async fn accept_messages(self: &Arc<Self>, partition_id: &str, batch: Vec<MessageData>) {
        let mut to_fetch: Vec<(String, Vec<MessageData>)> = Vec::new();
        {
            let mut guard = self.inner.lock().await;
            let Inner {
                sessions,
                ready,
                in_flight,
                ..
            } = &mut *guard;

            let mut grouped: HashMap<String, Vec<MessageData>> = HashMap::new();
            for message in batch {
                let fingerprint = message.fingerprint();
                if in_flight.contains(&fingerprint) {
                    debug!(
                        instance_id = message.instance_id(),
                        msg_id = message.msg_id,
                        "Skipping in-flight duplicate delivery"
                    );
                    continue;
                }
                in_flight.insert(fingerprint);
                HubStats::increment(&self.stats.messages_received);
                grouped
                    .entry(message.instance_id().to_string())
                    .or_default()
                    .push(message);
            }

            for (instance_id, messages) in grouped {
                match sessions.get_mut(&instance_id) {
                    Some(session) => match session.status {
                        SessionStatus::LeasedOut => {
                            session.pending_next.extend(messages);
                        }
                        SessionStatus::Ready => {
                            session.current_batch.extend(messages);
                        }
                        SessionStatus::Idle => {
                            session.current_batch.extend(messages);
                            session.status = SessionStatus::Ready;
                            ready.push_back(instance_id);
                        }
                    },
                    None => to_fetch.push((instance_id, messages)),
                }
            }
        }
        self.ready_notify.notify_waiters();

        for (instance_id, messages) in to_fetch {
            self.open_session(partition_id, instance_id, messages).await;
        }
    }

    /// Create a session for its first batch, loading committed history.
    async fn open_session(
        self: &Arc<Self>,
        partition_id: &str,
        instance_id: String,
        messages: Vec<MessageData>,
    ) {
        let record = match self.history_store.get_history(&instance_id, None).await {
            Ok(record) => record,
            Err(error) => {
                error!(
                    instance_id = %instance_id,
                    error = %error,
                    "History fetch failed, abandoning batch"
                );
                let control_queue = self.make_control_queue(partition_id);
                let mut inner = self.inner.lock().await;
                for message in &messages {
                    inner.in_flight.remove(&message.fingerprint());
                }
                drop(inner);
                for message in &messages {
                    let _ = control_queue.abandon(message).await;
                }
                return;
            }
        };

        let (execution_id, etag, runtime_state) = match record {
            Some(record) => (
                Some(record.execution_id),
                Some(record.etag),
                OrchestrationRuntimeState::from_history(record.events),
            ),
            None => (None, None, OrchestrationRuntimeState::default()),
        };

        let mut guard = self.inner.lock().await;
        let Inner {
            sessions, ready, ..
        } = &mut *guard;
        match sessions.entry(instance_id.clone()) {
            // The partition loop is the only session creator for its
            // instances, but stay defensive about re-entry.
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                occupied.get_mut().pending_next.extend(messages);
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                HubStats::increment(&self.stats.sessions_created);
                vacant.insert(Session {
                    partition_id: partition_id.to_string(),
                    execution_id,
                    etag,
                    runtime_state,
                    current_batch: messages,
                    pending_next: Vec::new(),
                    status: SessionStatus::Ready,
                    dead: false,
                });
                ready.push_back(instance_id.clone());
                debug!(instance_id = %instance_id, partition_id, "Session opened");
            }
        }
        drop(guard);
        self.ready_notify.notify_waiters();
    }

    /// Dequeue loop for one owned partition.
    async fn run_partition_loop(
        self: Arc<Self>,
        partition_id: String,
        cancel: CancellationToken,
    ) {
        let control_queue = self.make_control_queue(&partition_id);
        let mut backoff = self.config.poll_backoff_min;

        debug!(partition_id = %partition_id, "Partition dequeue loop started");
        loop {
            if cancel.is_cancelled() || self.shutdown.is_cancelled() {
                break;
            }

            match control_queue.dequeue_batch().await {
                Ok(batch) if batch.is_empty() => {
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => break,
                        _ = self.shutdown.cancelled() => break,
                    }
                    backoff = (backoff * 2).min(self.config.poll_backoff_max);
                }
                Ok(batch) => {
                    backoff = self.config.poll_backoff_min;
                    self.accept_messages(&partition_id, batch).await;
                }
                Err(error) => {
                    error!(partition_id = %partition_id, error = %error, "Control queue dequeue failed");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => break,
                        _ = self.shutdown.cancelled() => break,
                    }
                    backoff = (backoff * 2).min(self.config.poll_backoff_max);
                }
            }
        }
        debug!(partition_id = %partition_id, "Partition dequeue loop stopped");
    }
}

#[async_trait]
impl PartitionObserver for Arc<SessionManager> {
    async fn partition_acquired(&self, lease: &Lease) -> Result<()> {
        let partition_id = lease.partition_id.clone();
        let cancel = CancellationToken::new();

        let manager = Arc::clone(self);
        let loop_cancel = cancel.clone();
        let loop_partition = partition_id.clone();
        let task = tokio::spawn(async move {
            manager.run_partition_loop(loop_partition, loop_cancel).await;
        });

        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner
            .partitions
            .insert(partition_id.clone(), PartitionHandle { cancel, task })
        {
            previous.cancel.cancel();
        }
        info!(partition_id = %partition_id, "Partition registered for dispatch");
        Ok(())
    }

    async fn partition_released(&self, lease: &Lease, reason: LeaseLossReason) -> Result<()> {
        let partition_id = lease.partition_id.clone();

        // Stop the pump before touching sessions; awaiting the task outside
        // the lock avoids deadlocking with accept_messages.
        let handle = self.inner.lock().await.partitions.remove(&partition_id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }

        let mut to_abandon: Vec<MessageData> = Vec::new();
        {
            let mut guard = self.inner.lock().await;
            let Inner {
                sessions,
                in_flight,
                ..
            } = &mut *guard;

            let bound: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.partition_id == partition_id)
                .map(|(id, _)| id.clone())
                .collect();

            for instance_id in bound {
                let session = sessions.get_mut(&instance_id).expect("session exists");
                if session.status == SessionStatus::LeasedOut {
                    // The host still holds it; its release will drop it.
                    session.dead = true;
                    continue;
                }
                let mut session = sessions.remove(&instance_id).expect("session exists");
                let mut messages = std::mem::take(&mut session.current_batch);
                messages.extend(std::mem::take(&mut session.pending_next));
                for message in &messages {
                    in_flight.remove(&message.fingerprint());
                }
                to_abandon.extend(messages);
            }
        }

        let control_queue = self.make_control_queue(&partition_id);
        for message in &to_abandon {
            if let Err(error) = control_queue.abandon(message).await {
                warn!(partition_id = %partition_id, error = %error, "Abandon on partition release failed");
            }
        }

        info!(
            partition_id = %partition_id,
            reason = %reason,
            abandoned = to_abandon.len(),
            "Partition released"
        );
        Ok(())
    }
}
