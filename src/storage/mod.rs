//! # Storage Backends
//!
//! Abstract storage primitives the service is built on: a visibility-timeout
//! message queue, a blob store, an optimistic lease store, and an
//! optimistic-concurrency history store. Two implementations ship with the
//! crate: a single-process in-memory backend (tests, development hosts) and
//! a Postgres backend speaking the pgmq SQL surface.
//!
//! Transient I/O failures are retried close to the storage seam via
//! [`RetryPolicy`]; optimistic conflicts and permanent failures surface to
//! the caller unchanged.

pub mod memory;
pub mod postgres;

use crate::history::{HistoryEvent, InstanceFilter, OrchestrationInstance, OrchestrationRuntimeState, OrchestrationState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Errors raised by storage backends.
#[derive(Error, Debug)]
pub enum StorageError {
    /// An optimistic concurrency check failed; the caller must re-read.
    #[error("precondition failed: {message}")]
    PreconditionFailed { message: String },

    /// The addressed resource does not exist.
    #[error("not found: {resource}")]
    NotFound { resource: String },

    /// A retryable I/O failure (network, throttling, pool exhaustion).
    #[error("transient storage error during {operation}: {message}")]
    Transient { operation: String, message: String },

    /// A non-retryable backend failure.
    #[error("storage error during {operation}: {message}")]
    Permanent { operation: String, message: String },
}

impl StorageError {
    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// True when retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Bounded exponential backoff for transient storage failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Run `operation`, retrying transient failures with exponential backoff.
    ///
    /// Non-transient errors and the final transient failure propagate as-is.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt + 1 < self.max_attempts => {
                    let backoff = self
                        .base_delay
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(self.max_delay);
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Transient storage failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// One message pulled from a [`MessageQueue`].
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Backend-assigned message id; doubles as the deletion receipt.
    pub msg_id: i64,
    /// Raw message body.
    pub body: String,
    /// How many times this message has been delivered.
    pub dequeue_count: u32,
    /// When the message was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

/// Visibility-timeout message queue primitive.
///
/// Messages received become invisible for the requested timeout; a message
/// neither deleted nor renewed before the timeout reappears with an
/// incremented `dequeue_count`.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn create_queue_if_not_exists(&self, queue_name: &str) -> Result<(), StorageError>;

    async fn drop_queue(&self, queue_name: &str) -> Result<(), StorageError>;

    /// Enqueue a message, optionally invisible for an initial delay.
    async fn send(
        &self,
        queue_name: &str,
        body: &str,
        delay: Option<Duration>,
    ) -> Result<i64, StorageError>;

    /// Pull up to `max_messages`, making each invisible for `visibility_timeout`.
    async fn receive_batch(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, StorageError>;

    /// Reset a message's visibility horizon. Zero restores it immediately.
    ///
    /// Returns false when the message no longer exists.
    async fn set_visibility(
        &self,
        queue_name: &str,
        msg_id: i64,
        visibility_timeout: Duration,
    ) -> Result<bool, StorageError>;

    /// Permanently remove a message. Returns false when already gone.
    async fn delete(&self, queue_name: &str, msg_id: i64) -> Result<bool, StorageError>;

    /// Total messages in the queue, visible or not.
    async fn queue_depth(&self, queue_name: &str) -> Result<u64, StorageError>;
}

/// Content-addressed blob storage primitive.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn create_container_if_not_exists(&self, container: &str) -> Result<(), StorageError>;

    async fn drop_container(&self, container: &str) -> Result<(), StorageError>;

    /// Write a blob with overwrite semantics.
    async fn put(&self, container: &str, blob_name: &str, bytes: &[u8]) -> Result<(), StorageError>;

    async fn get(&self, container: &str, blob_name: &str) -> Result<Vec<u8>, StorageError>;

    /// Returns false when the blob was already gone.
    async fn delete(&self, container: &str, blob_name: &str) -> Result<bool, StorageError>;

    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Sentinel describing a task hub, stored alongside the leases.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TaskHubInfo {
    pub task_hub_name: String,
    pub partition_count: u32,
    pub created_at: DateTime<Utc>,
}

/// An expiring claim of exclusive partition ownership.
#[derive(Debug, Clone)]
pub struct Lease {
    pub partition_id: String,
    pub owner: Option<String>,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub epoch: i64,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// True when `worker_id` holds an unexpired claim.
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        !self.is_expired() && self.owner.as_deref() == Some(worker_id)
    }

    /// True when the lease can be acquired without a steal.
    pub fn is_available(&self) -> bool {
        self.owner.is_none() || self.is_expired()
    }
}

/// Result of a lease acquisition or steal attempt.
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    Acquired(Lease),
    /// The lease is validly held by another worker.
    AlreadyOwned { owner: Option<String> },
}

/// Result of a lease renewal attempt.
#[derive(Debug, Clone)]
pub enum RenewOutcome {
    Renewed(Lease),
    /// The lease token no longer matches; ownership has moved on.
    Lost,
}

/// Result of a lease release attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    Lost,
}

/// Persistent, optimistic lease ownership of control partitions.
///
/// All write operations are optimistic: a lost race reports
/// [`AcquireOutcome::AlreadyOwned`] / [`RenewOutcome::Lost`] instead of
/// escalating an error.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Idempotently create the store and write the hub sentinel iff absent.
    async fn create_if_not_exists(&self, hub_info: &TaskHubInfo) -> Result<(), StorageError>;

    /// Read-through create of the hub sentinel; on conflict the stored
    /// value wins.
    async fn get_or_create_task_hub_info(
        &self,
        default_info: &TaskHubInfo,
    ) -> Result<TaskHubInfo, StorageError>;

    /// Idempotently create an unowned lease row for a partition.
    async fn create_lease_if_not_exists(&self, partition_id: &str) -> Result<(), StorageError>;

    /// Claim an unowned or expired lease.
    async fn acquire(
        &self,
        partition_id: &str,
        worker_id: &str,
        lease_interval: Duration,
    ) -> Result<AcquireOutcome, StorageError>;

    /// Extend a held lease; fails with [`RenewOutcome::Lost`] when the
    /// token no longer matches.
    async fn renew(
        &self,
        lease: &Lease,
        lease_interval: Duration,
    ) -> Result<RenewOutcome, StorageError>;

    /// Forcibly take a validly-held lease from its current owner. The token
    /// check makes the takeover optimistic; the previous owner learns of
    /// the loss on its next renewal.
    async fn steal(
        &self,
        lease: &Lease,
        worker_id: &str,
        lease_interval: Duration,
    ) -> Result<AcquireOutcome, StorageError>;

    /// Relinquish a held lease.
    async fn release(&self, lease: &Lease) -> Result<ReleaseOutcome, StorageError>;

    async fn list_leases(&self) -> Result<Vec<Lease>, StorageError>;

    /// Remove the sentinel and every lease row. Used by hub deletion.
    async fn delete_all(&self) -> Result<(), StorageError>;
}

/// Committed history of one orchestration generation.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub execution_id: String,
    pub events: Vec<HistoryEvent>,
    pub etag: i64,
}

/// Result of purging instance history.
#[derive(Debug, Clone, Default)]
pub struct PurgeResult {
    /// Generations removed.
    pub instances_purged: u64,
    /// Blob names referenced by the purged rows; the caller owns deleting
    /// them from the blob store.
    pub blob_names: Vec<String>,
}

impl PurgeResult {
    pub fn merge(&mut self, other: PurgeResult) {
        self.instances_purged += other.instances_purged;
        self.blob_names.extend(other.blob_names);
    }
}

/// Durable, optimistic-concurrency store of orchestration histories and
/// instance summaries.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Idempotently provision the store (tables, containers).
    async fn ensure_store(&self) -> Result<(), StorageError>;

    /// Remove everything the store holds for this hub.
    async fn drop_store(&self) -> Result<(), StorageError>;

    /// Fetch a generation's history; `None` execution id selects the
    /// current generation.
    async fn get_history(
        &self,
        instance_id: &str,
        execution_id: Option<&str>,
    ) -> Result<Option<HistoryRecord>, StorageError>;

    /// Append `state.new_events()` and update the summary row, guarded by
    /// the expected etag.
    ///
    /// The append and the summary write are atomic: on any failure no
    /// partial suffix is visible. An etag mismatch fails with
    /// [`StorageError::PreconditionFailed`] without writing. Returns the
    /// new etag.
    async fn update_state(
        &self,
        state: &OrchestrationRuntimeState,
        instance_id: &str,
        execution_id: &str,
        expected_etag: Option<i64>,
        history_event_blob_names: &[String],
    ) -> Result<i64, StorageError>;

    /// Allocate or advance the instance summary for a new generation,
    /// initially `Pending`.
    ///
    /// `started` must be an `ExecutionStarted` event carrying the new
    /// execution id.
    async fn set_new_execution(
        &self,
        instance: &OrchestrationInstance,
        started: &HistoryEvent,
    ) -> Result<(), StorageError>;

    /// Summaries for an instance: the current generation, or all of them.
    async fn get_state(
        &self,
        instance_id: &str,
        all_executions: bool,
    ) -> Result<Vec<OrchestrationState>, StorageError>;

    /// Summaries matching a filter.
    async fn query_state(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<OrchestrationState>, StorageError>;

    /// Neutralize failure events so replay yields a live state; resets the
    /// summary to `Pending`. Returns descendant instance ids that need a
    /// revival message.
    async fn rewind_history(&self, instance_id: &str) -> Result<Vec<String>, StorageError>;

    /// Remove all rows for an instance.
    async fn purge_instance_history(&self, instance_id: &str) -> Result<PurgeResult, StorageError>;

    /// Remove all rows for instances matching a filter.
    async fn purge_by_filter(&self, filter: &InstanceFilter) -> Result<PurgeResult, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_policy_retries_transient_errors() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };

        let result = policy
            .run("test_op", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(StorageError::transient("test_op", "flaky"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_policy_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };

        let result: Result<(), StorageError> = policy
            .run("test_op", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(StorageError::transient("test_op", "still flaky")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_policy_does_not_retry_permanent_errors() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result: Result<(), StorageError> = policy
            .run("test_op", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(StorageError::permanent("test_op", "broken")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lease_ownership_checks() {
        let lease = Lease {
            partition_id: "hub-control-00".to_string(),
            owner: Some("worker-a".to_string()),
            token: "t1".to_string(),
            expires_at: Utc::now() + chrono::Duration::seconds(30),
            epoch: 1,
        };
        assert!(lease.is_owned_by("worker-a"));
        assert!(!lease.is_owned_by("worker-b"));
        assert!(!lease.is_available());

        let expired = Lease {
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            ..lease
        };
        assert!(!expired.is_owned_by("worker-a"));
        assert!(expired.is_available());
    }
}
