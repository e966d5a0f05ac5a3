//! # Postgres Storage Backend
//!
//! Production implementations of the storage traits on PostgreSQL. The
//! queue primitive speaks the pgmq SQL surface (SQS-like visibility-timeout
//! queues inside Postgres); leases, histories, instance summaries, and
//! large-message blobs live in plain tables with optimistic-concurrency
//! columns.
//!
//! Logical queue and container names carry `-` separators; pgmq queue names
//! are SQL identifiers, so names are sanitized to `[a-z0-9_]` before they
//! reach the database.

use super::{
    AcquireOutcome, BlobStore, HistoryRecord, HistoryStore, Lease, LeaseStore, MessageQueue,
    PurgeResult, ReceivedMessage, ReleaseOutcome, RenewOutcome, StorageError, TaskHubInfo,
};
use crate::history::{
    neutralize_failures, HistoryEvent, InstanceFilter, OrchestrationInstance,
    OrchestrationRuntimeState, OrchestrationState, OrchestrationStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl From<sqlx::Error> for StorageError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StorageError::transient("postgres", error.to_string())
            }
            sqlx::Error::RowNotFound => StorageError::not_found(error.to_string()),
            _ => StorageError::permanent("postgres", error.to_string()),
        }
    }
}

/// Map a logical name (`hub-control-00`) to a pgmq-safe identifier.
fn sanitize_name(logical: &str) -> String {
    logical
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Idempotently create the lease, history, and blob tables.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StorageError> {
    debug!("📦 POSTGRES: Ensuring task hub schema");

    let statements = [
        r#"CREATE TABLE IF NOT EXISTS taskhub_hub_info (
            task_hub TEXT PRIMARY KEY,
            partition_count INT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS taskhub_leases (
            task_hub TEXT NOT NULL,
            partition_id TEXT NOT NULL,
            owner_id TEXT,
            token TEXT NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL,
            epoch BIGINT NOT NULL DEFAULT 0,
            PRIMARY KEY (task_hub, partition_id)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS taskhub_instances (
            task_hub TEXT NOT NULL,
            instance_id TEXT NOT NULL,
            current_execution_id TEXT NOT NULL,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            last_updated_at TIMESTAMPTZ NOT NULL,
            completed_at TIMESTAMPTZ,
            input JSONB,
            output JSONB,
            custom_status JSONB,
            PRIMARY KEY (task_hub, instance_id)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS taskhub_executions (
            task_hub TEXT NOT NULL,
            instance_id TEXT NOT NULL,
            execution_id TEXT NOT NULL,
            etag BIGINT NOT NULL,
            event_count BIGINT NOT NULL,
            blob_names JSONB NOT NULL DEFAULT '[]'::jsonb,
            PRIMARY KEY (task_hub, instance_id, execution_id)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS taskhub_history (
            task_hub TEXT NOT NULL,
            instance_id TEXT NOT NULL,
            execution_id TEXT NOT NULL,
            sequence BIGINT NOT NULL,
            event JSONB NOT NULL,
            PRIMARY KEY (task_hub, instance_id, execution_id, sequence)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS taskhub_blobs (
            container TEXT NOT NULL,
            blob_name TEXT NOT NULL,
            data BYTEA NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (container, blob_name)
        )"#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    info!("✅ POSTGRES: Task hub schema ready");
    Ok(())
}

// ---------------------------------------------------------------------------
// Message queue over pgmq
// ---------------------------------------------------------------------------

/// pgmq-backed visibility-timeout queue.
#[derive(Debug, Clone)]
pub struct PgmqMessageQueue {
    pool: PgPool,
}

impl PgmqMessageQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageQueue for PgmqMessageQueue {
    async fn create_queue_if_not_exists(&self, queue_name: &str) -> Result<(), StorageError> {
        let physical = sanitize_name(queue_name);
        debug!(queue = %queue_name, physical = %physical, "📦 PGMQ: Creating queue");

        sqlx::query("SELECT pgmq_create($1)")
            .bind(&physical)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn drop_queue(&self, queue_name: &str) -> Result<(), StorageError> {
        let physical = sanitize_name(queue_name);
        debug!(queue = %queue_name, "🗑️ PGMQ: Dropping queue");

        sqlx::query("SELECT pgmq_drop($1)")
            .bind(&physical)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn send(
        &self,
        queue_name: &str,
        body: &str,
        delay: Option<Duration>,
    ) -> Result<i64, StorageError> {
        let physical = sanitize_name(queue_name);
        let delay_seconds = delay.map(|d| d.as_secs() as i32).unwrap_or(0);
        let message: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| StorageError::permanent("pgmq_send", format!("body is not JSON: {e}")))?;

        let row = sqlx::query("SELECT pgmq_send($1, $2, $3) as msg_id")
            .bind(&physical)
            .bind(&message)
            .bind(delay_seconds)
            .fetch_one(&self.pool)
            .await?;

        let msg_id: i64 = row.get("msg_id");
        debug!(queue = %queue_name, msg_id, delay_seconds, "📤 PGMQ: Message sent");
        Ok(msg_id)
    }

    async fn receive_batch(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, StorageError> {
        let physical = sanitize_name(queue_name);
        let rows = sqlx::query(
            "SELECT msg_id, read_ct, enqueued_at, message
             FROM pgmq_read($1, $2, $3)",
        )
        .bind(&physical)
        .bind(visibility_timeout.as_secs() as i32)
        .bind(max_messages as i32)
        .fetch_all(&self.pool)
        .await?;

        let mut received = Vec::with_capacity(rows.len());
        for row in rows {
            let message: serde_json::Value = row.get("message");
            received.push(ReceivedMessage {
                msg_id: row.get("msg_id"),
                body: message.to_string(),
                dequeue_count: row.get::<i32, _>("read_ct").max(0) as u32,
                enqueued_at: row.get::<DateTime<Utc>, _>("enqueued_at"),
            });
        }
        Ok(received)
    }

    async fn set_visibility(
        &self,
        queue_name: &str,
        msg_id: i64,
        visibility_timeout: Duration,
    ) -> Result<bool, StorageError> {
        let physical = sanitize_name(queue_name);
        let rows = sqlx::query("SELECT msg_id FROM pgmq_set_vt($1, $2, $3)")
            .bind(&physical)
            .bind(msg_id)
            .bind(visibility_timeout.as_secs() as i32)
            .fetch_all(&self.pool)
            .await?;
        Ok(!rows.is_empty())
    }

    async fn delete(&self, queue_name: &str, msg_id: i64) -> Result<bool, StorageError> {
        let physical = sanitize_name(queue_name);
        let row = sqlx::query("SELECT pgmq_delete($1, $2) as deleted")
            .bind(&physical)
            .bind(msg_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("deleted"))
    }

    async fn queue_depth(&self, queue_name: &str) -> Result<u64, StorageError> {
        let physical = sanitize_name(queue_name);
        let row = sqlx::query("SELECT queue_length FROM pgmq_metrics($1)")
            .bind(&physical)
            .fetch_one(&self.pool)
            .await?;
        let depth: i64 = row.get("queue_length");
        Ok(depth.max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Blob store
// ---------------------------------------------------------------------------

/// Large-message blob storage in a bytea table.
#[derive(Debug, Clone)]
pub struct PostgresBlobStore {
    pool: PgPool,
}

impl PostgresBlobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BlobStore for PostgresBlobStore {
    async fn create_container_if_not_exists(&self, _container: &str) -> Result<(), StorageError> {
        // Containers are name prefixes in one table; nothing to provision.
        Ok(())
    }

    async fn drop_container(&self, container: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM taskhub_blobs WHERE container = $1")
            .bind(container)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put(&self, container: &str, blob_name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO taskhub_blobs (container, blob_name, data)
             VALUES ($1, $2, $3)
             ON CONFLICT (container, blob_name) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(container)
        .bind(blob_name)
        .bind(bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, container: &str, blob_name: &str) -> Result<Vec<u8>, StorageError> {
        let row = sqlx::query(
            "SELECT data FROM taskhub_blobs WHERE container = $1 AND blob_name = $2",
        )
        .bind(container)
        .bind(blob_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.get("data"))
            .ok_or_else(|| StorageError::not_found(format!("blob {container}/{blob_name}")))
    }

    async fn delete(&self, container: &str, blob_name: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "DELETE FROM taskhub_blobs WHERE container = $1 AND blob_name = $2",
        )
        .bind(container)
        .bind(blob_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(
            "SELECT blob_name FROM taskhub_blobs
             WHERE container = $1 AND blob_name LIKE $2 || '%'
             ORDER BY blob_name",
        )
        .bind(container)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("blob_name")).collect())
    }
}

// ---------------------------------------------------------------------------
// Lease store
// ---------------------------------------------------------------------------

/// Optimistic lease rows, one per partition, plus the hub sentinel.
#[derive(Debug, Clone)]
pub struct PostgresLeaseStore {
    pool: PgPool,
    task_hub: String,
}

impl PostgresLeaseStore {
    pub fn new(pool: PgPool, task_hub: impl Into<String>) -> Self {
        Self {
            pool,
            task_hub: task_hub.into(),
        }
    }

    fn lease_from_row(row: &sqlx::postgres::PgRow) -> Lease {
        Lease {
            partition_id: row.get("partition_id"),
            owner: row.get("owner_id"),
            token: row.get("token"),
            expires_at: row.get("expires_at"),
            epoch: row.get("epoch"),
        }
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn create_if_not_exists(&self, hub_info: &TaskHubInfo) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO taskhub_hub_info (task_hub, partition_count, created_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (task_hub) DO NOTHING",
        )
        .bind(&self.task_hub)
        .bind(hub_info.partition_count as i32)
        .bind(hub_info.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_or_create_task_hub_info(
        &self,
        default_info: &TaskHubInfo,
    ) -> Result<TaskHubInfo, StorageError> {
        self.create_if_not_exists(default_info).await?;

        let row = sqlx::query(
            "SELECT partition_count, created_at FROM taskhub_hub_info WHERE task_hub = $1",
        )
        .bind(&self.task_hub)
        .fetch_one(&self.pool)
        .await?;

        Ok(TaskHubInfo {
            task_hub_name: self.task_hub.clone(),
            partition_count: row.get::<i32, _>("partition_count").max(0) as u32,
            created_at: row.get("created_at"),
        })
    }

    async fn create_lease_if_not_exists(&self, partition_id: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO taskhub_leases (task_hub, partition_id, owner_id, token, expires_at, epoch)
             VALUES ($1, $2, NULL, $3, now(), 0)
             ON CONFLICT (task_hub, partition_id) DO NOTHING",
        )
        .bind(&self.task_hub)
        .bind(partition_id)
        .bind(Uuid::new_v4().to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn acquire(
        &self,
        partition_id: &str,
        worker_id: &str,
        lease_interval: Duration,
    ) -> Result<AcquireOutcome, StorageError> {
        let row = sqlx::query(
            "UPDATE taskhub_leases
             SET owner_id = $3,
                 token = $4,
                 expires_at = now() + make_interval(secs => $5),
                 epoch = epoch + 1
             WHERE task_hub = $1 AND partition_id = $2
               AND (owner_id IS NULL OR expires_at <= now() OR owner_id = $3)
             RETURNING partition_id, owner_id, token, expires_at, epoch",
        )
        .bind(&self.task_hub)
        .bind(partition_id)
        .bind(worker_id)
        .bind(Uuid::new_v4().to_string())
        .bind(lease_interval.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(AcquireOutcome::Acquired(Self::lease_from_row(&row)));
        }

        let current = sqlx::query(
            "SELECT owner_id FROM taskhub_leases WHERE task_hub = $1 AND partition_id = $2",
        )
        .bind(&self.task_hub)
        .bind(partition_id)
        .fetch_optional(&self.pool)
        .await?;

        match current {
            Some(row) => Ok(AcquireOutcome::AlreadyOwned {
                owner: row.get("owner_id"),
            }),
            None => Err(StorageError::not_found(format!("lease {partition_id}"))),
        }
    }

    async fn renew(
        &self,
        lease: &Lease,
        lease_interval: Duration,
    ) -> Result<RenewOutcome, StorageError> {
        let row = sqlx::query(
            "UPDATE taskhub_leases
             SET expires_at = now() + make_interval(secs => $4)
             WHERE task_hub = $1 AND partition_id = $2 AND token = $3
             RETURNING partition_id, owner_id, token, expires_at, epoch",
        )
        .bind(&self.task_hub)
        .bind(&lease.partition_id)
        .bind(&lease.token)
        .bind(lease_interval.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => RenewOutcome::Renewed(Self::lease_from_row(&row)),
            None => RenewOutcome::Lost,
        })
    }

    async fn steal(
        &self,
        lease: &Lease,
        worker_id: &str,
        lease_interval: Duration,
    ) -> Result<AcquireOutcome, StorageError> {
        let row = sqlx::query(
            "UPDATE taskhub_leases
             SET owner_id = $4,
                 token = $5,
                 expires_at = now() + make_interval(secs => $6),
                 epoch = epoch + 1
             WHERE task_hub = $1 AND partition_id = $2 AND token = $3
             RETURNING partition_id, owner_id, token, expires_at, epoch",
        )
        .bind(&self.task_hub)
        .bind(&lease.partition_id)
        .bind(&lease.token)
        .bind(worker_id)
        .bind(Uuid::new_v4().to_string())
        .bind(lease_interval.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            warn!(
                partition_id = %lease.partition_id,
                from = ?lease.owner,
                to = worker_id,
                "Lease stolen for rebalancing"
            );
            return Ok(AcquireOutcome::Acquired(Self::lease_from_row(&row)));
        }

        let current = sqlx::query(
            "SELECT owner_id FROM taskhub_leases WHERE task_hub = $1 AND partition_id = $2",
        )
        .bind(&self.task_hub)
        .bind(&lease.partition_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(AcquireOutcome::AlreadyOwned {
            owner: current.and_then(|row| row.get("owner_id")),
        })
    }

    async fn release(&self, lease: &Lease) -> Result<ReleaseOutcome, StorageError> {
        let result = sqlx::query(
            "UPDATE taskhub_leases
             SET owner_id = NULL,
                 token = $4,
                 expires_at = now(),
                 epoch = epoch + 1
             WHERE task_hub = $1 AND partition_id = $2 AND token = $3",
        )
        .bind(&self.task_hub)
        .bind(&lease.partition_id)
        .bind(&lease.token)
        .bind(Uuid::new_v4().to_string())
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() > 0 {
            ReleaseOutcome::Released
        } else {
            ReleaseOutcome::Lost
        })
    }

    async fn list_leases(&self) -> Result<Vec<Lease>, StorageError> {
        let rows = sqlx::query(
            "SELECT partition_id, owner_id, token, expires_at, epoch
             FROM taskhub_leases WHERE task_hub = $1
             ORDER BY partition_id",
        )
        .bind(&self.task_hub)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::lease_from_row).collect())
    }

    async fn delete_all(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM taskhub_leases WHERE task_hub = $1")
            .bind(&self.task_hub)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM taskhub_hub_info WHERE task_hub = $1")
            .bind(&self.task_hub)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// History store
// ---------------------------------------------------------------------------

/// Optimistic-concurrency history and instance-summary tables.
#[derive(Debug, Clone)]
pub struct PostgresHistoryStore {
    pool: PgPool,
    task_hub: String,
}

impl PostgresHistoryStore {
    pub fn new(pool: PgPool, task_hub: impl Into<String>) -> Self {
        Self {
            pool,
            task_hub: task_hub.into(),
        }
    }

    fn state_from_row(row: &sqlx::postgres::PgRow) -> OrchestrationState {
        let status_text: String = row.get("status");
        OrchestrationState {
            orchestration_instance: OrchestrationInstance::with_execution(
                row.get::<String, _>("instance_id"),
                row.get::<String, _>("current_execution_id"),
            ),
            name: row.get("name"),
            version: row.get("version"),
            status: OrchestrationStatus::parse(&status_text)
                .unwrap_or(OrchestrationStatus::Pending),
            created_at: row.get("created_at"),
            last_updated_at: row.get("last_updated_at"),
            completed_at: row.get("completed_at"),
            input: row.get("input"),
            output: row.get("output"),
            custom_status: row.get("custom_status"),
        }
    }

    async fn current_execution_id(
        &self,
        instance_id: &str,
    ) -> Result<Option<String>, StorageError> {
        let row = sqlx::query(
            "SELECT current_execution_id FROM taskhub_instances
             WHERE task_hub = $1 AND instance_id = $2",
        )
        .bind(&self.task_hub)
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("current_execution_id")))
    }
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    async fn ensure_store(&self) -> Result<(), StorageError> {
        ensure_schema(&self.pool).await
    }

    async fn drop_store(&self) -> Result<(), StorageError> {
        for table in ["taskhub_history", "taskhub_executions", "taskhub_instances"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE task_hub = $1"))
                .bind(&self.task_hub)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn get_history(
        &self,
        instance_id: &str,
        execution_id: Option<&str>,
    ) -> Result<Option<HistoryRecord>, StorageError> {
        let execution_id = match execution_id {
            Some(id) => id.to_string(),
            None => match self.current_execution_id(instance_id).await? {
                Some(id) => id,
                None => return Ok(None),
            },
        };

        let execution = sqlx::query(
            "SELECT etag FROM taskhub_executions
             WHERE task_hub = $1 AND instance_id = $2 AND execution_id = $3",
        )
        .bind(&self.task_hub)
        .bind(instance_id)
        .bind(&execution_id)
        .fetch_optional(&self.pool)
        .await?;

        let etag: i64 = match execution {
            Some(row) => row.get("etag"),
            None => return Ok(None),
        };

        let rows = sqlx::query(
            "SELECT event FROM taskhub_history
             WHERE task_hub = $1 AND instance_id = $2 AND execution_id = $3
             ORDER BY sequence",
        )
        .bind(&self.task_hub)
        .bind(instance_id)
        .bind(&execution_id)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let value: serde_json::Value = row.get("event");
            let event: HistoryEvent = serde_json::from_value(value).map_err(|e| {
                StorageError::permanent("get_history", format!("corrupt history event: {e}"))
            })?;
            events.push(event);
        }

        Ok(Some(HistoryRecord {
            execution_id,
            events,
            etag,
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
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT etag, event_count FROM taskhub_executions
             WHERE task_hub = $1 AND instance_id = $2 AND execution_id = $3
             FOR UPDATE",
        )
        .bind(&self.task_hub)
        .bind(instance_id)
        .bind(execution_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (current_etag, event_count) = match &row {
            Some(row) => (Some(row.get::<i64, _>("etag")), row.get::<i64, _>("event_count")),
            None => (None, 0),
        };

        if current_etag != expected_etag {
            // Dropping the transaction rolls everything back; nothing is
            // partially committed.
            return Err(StorageError::precondition_failed(format!(
                "instance {instance_id} execution {execution_id}: expected etag {expected_etag:?}, stored {current_etag:?}"
            )));
        }

        for (offset, event) in runtime_state.new_events().iter().enumerate() {
            let value = serde_json::to_value(event).map_err(|e| {
                StorageError::permanent("update_state", format!("unserializable event: {e}"))
            })?;
            sqlx::query(
                "INSERT INTO taskhub_history (task_hub, instance_id, execution_id, sequence, event)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&self.task_hub)
            .bind(instance_id)
            .bind(execution_id)
            .bind(event_count + offset as i64)
            .bind(&value)
            .execute(&mut *tx)
            .await?;
        }

        let new_etag = current_etag.unwrap_or(0) + 1;
        let blob_names = serde_json::to_value(history_event_blob_names)
            .unwrap_or_else(|_| serde_json::Value::Array(Vec::new()));
        sqlx::query(
            "INSERT INTO taskhub_executions (task_hub, instance_id, execution_id, etag, event_count, blob_names)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (task_hub, instance_id, execution_id) DO UPDATE
             SET etag = EXCLUDED.etag,
                 event_count = EXCLUDED.event_count,
                 blob_names = taskhub_executions.blob_names || EXCLUDED.blob_names",
        )
        .bind(&self.task_hub)
        .bind(instance_id)
        .bind(execution_id)
        .bind(new_etag)
        .bind(event_count + runtime_state.new_events().len() as i64)
        .bind(&blob_names)
        .execute(&mut *tx)
        .await?;

        // Summary row last so readers never observe a summary ahead of its
        // history.
        if let Some(summary) = runtime_state.to_orchestration_state() {
            sqlx::query(
                "INSERT INTO taskhub_instances
                   (task_hub, instance_id, current_execution_id, name, version, status,
                    created_at, last_updated_at, completed_at, input, output, custom_status)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                 ON CONFLICT (task_hub, instance_id) DO UPDATE
                 SET current_execution_id = EXCLUDED.current_execution_id,
                     name = EXCLUDED.name,
                     version = EXCLUDED.version,
                     status = EXCLUDED.status,
                     last_updated_at = EXCLUDED.last_updated_at,
                     completed_at = EXCLUDED.completed_at,
                     output = EXCLUDED.output,
                     custom_status = EXCLUDED.custom_status",
            )
            .bind(&self.task_hub)
            .bind(instance_id)
            .bind(execution_id)
            .bind(&summary.name)
            .bind(&summary.version)
            .bind(summary.status.to_string())
            .bind(summary.created_at)
            .bind(summary.last_updated_at)
            .bind(summary.completed_at)
            .bind(&summary.input)
            .bind(&summary.output)
            .bind(&summary.custom_status)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
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
            } => (name, version, input, *timestamp),
            other => {
                return Err(StorageError::permanent(
                    "set_new_execution",
                    format!("expected execution_started event, got {}", other.event_type_name()),
                ))
            }
        };
        let execution_id = instance
            .execution_id
            .as_deref()
            .ok_or_else(|| StorageError::permanent("set_new_execution", "missing execution id"))?;

        sqlx::query(
            "INSERT INTO taskhub_instances
               (task_hub, instance_id, current_execution_id, name, version, status,
                created_at, last_updated_at, input)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $8)
             ON CONFLICT (task_hub, instance_id) DO UPDATE
             SET current_execution_id = EXCLUDED.current_execution_id,
                 name = EXCLUDED.name,
                 version = EXCLUDED.version,
                 status = EXCLUDED.status,
                 created_at = EXCLUDED.created_at,
                 last_updated_at = EXCLUDED.last_updated_at,
                 completed_at = NULL,
                 input = EXCLUDED.input,
                 output = NULL,
                 custom_status = NULL",
        )
        .bind(&self.task_hub)
        .bind(&instance.instance_id)
        .bind(execution_id)
        .bind(name)
        .bind(version)
        .bind(OrchestrationStatus::Pending.to_string())
        .bind(timestamp)
        .bind(input)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_state(
        &self,
        instance_id: &str,
        all_executions: bool,
    ) -> Result<Vec<OrchestrationState>, StorageError> {
        // Summaries are kept per instance with the current execution;
        // historical generations are reconstructed from their histories.
        let row = sqlx::query(
            "SELECT instance_id, current_execution_id, name, version, status,
                    created_at, last_updated_at, completed_at, input, output, custom_status
             FROM taskhub_instances
             WHERE task_hub = $1 AND instance_id = $2",
        )
        .bind(&self.task_hub)
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        let current = match row {
            Some(row) => Self::state_from_row(&row),
            None => return Ok(Vec::new()),
        };

        if !all_executions {
            return Ok(vec![current]);
        }

        let rows = sqlx::query(
            "SELECT execution_id FROM taskhub_executions
             WHERE task_hub = $1 AND instance_id = $2",
        )
        .bind(&self.task_hub)
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        let mut states = Vec::new();
        for row in rows {
            let execution_id: String = row.get("execution_id");
            if Some(execution_id.as_str())
                == current.orchestration_instance.execution_id.as_deref()
            {
                continue;
            }
            if let Some(record) = self.get_history(instance_id, Some(&execution_id)).await? {
                let state = OrchestrationRuntimeState::from_history(record.events);
                if let Some(mut summary) = state.to_orchestration_state() {
                    summary.orchestration_instance.execution_id = Some(execution_id);
                    states.push(summary);
                }
            }
        }
        states.push(current);
        states.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(states)
    }

    async fn query_state(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<OrchestrationState>, StorageError> {
        let rows = sqlx::query(
            "SELECT instance_id, current_execution_id, name, version, status,
                    created_at, last_updated_at, completed_at, input, output, custom_status
             FROM taskhub_instances
             WHERE task_hub = $1
             ORDER BY instance_id",
        )
        .bind(&self.task_hub)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(Self::state_from_row)
            .filter(|state| filter.matches(state))
            .collect())
    }

    async fn rewind_history(&self, instance_id: &str) -> Result<Vec<String>, StorageError> {
        let execution_id = self
            .current_execution_id(instance_id)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("instance {instance_id}")))?;

        let record = self
            .get_history(instance_id, Some(&execution_id))
            .await?
            .ok_or_else(|| StorageError::not_found(format!("history {instance_id}")))?;

        let mut events = record.events;
        let rewritten = neutralize_failures(&mut events);

        let mut tx = self.pool.begin().await?;
        if rewritten > 0 {
            for (sequence, event) in events.iter().enumerate() {
                let value = serde_json::to_value(event).map_err(|e| {
                    StorageError::permanent("rewind_history", format!("unserializable event: {e}"))
                })?;
                sqlx::query(
                    "UPDATE taskhub_history SET event = $5
                     WHERE task_hub = $1 AND instance_id = $2 AND execution_id = $3 AND sequence = $4",
                )
                .bind(&self.task_hub)
                .bind(instance_id)
                .bind(&execution_id)
                .bind(sequence as i64)
                .bind(&value)
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query(
                "UPDATE taskhub_executions SET etag = etag + 1
                 WHERE task_hub = $1 AND instance_id = $2 AND execution_id = $3",
            )
            .bind(&self.task_hub)
            .bind(instance_id)
            .bind(&execution_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE taskhub_instances
             SET status = $3, completed_at = NULL, output = NULL, last_updated_at = now()
             WHERE task_hub = $1 AND instance_id = $2",
        )
        .bind(&self.task_hub)
        .bind(instance_id)
        .bind(OrchestrationStatus::Pending.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        // No sub-orchestration events exist in this core, so there are no
        // descendants to revive.
        Ok(Vec::new())
    }

    async fn purge_instance_history(&self, instance_id: &str) -> Result<PurgeResult, StorageError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "DELETE FROM taskhub_executions
             WHERE task_hub = $1 AND instance_id = $2
             RETURNING blob_names",
        )
        .bind(&self.task_hub)
        .bind(instance_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut result = PurgeResult::default();
        for row in &rows {
            result.instances_purged += 1;
            let blob_names: serde_json::Value = row.get("blob_names");
            if let Ok(names) = serde_json::from_value::<Vec<String>>(blob_names) {
                result.blob_names.extend(names);
            }
        }

        sqlx::query(
            "DELETE FROM taskhub_history WHERE task_hub = $1 AND instance_id = $2",
        )
        .bind(&self.task_hub)
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM taskhub_instances WHERE task_hub = $1 AND instance_id = $2",
        )
        .bind(&self.task_hub)
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result)
    }

    async fn purge_by_filter(&self, filter: &InstanceFilter) -> Result<PurgeResult, StorageError> {
        let matching = self.query_state(filter).await?;
        let mut result = PurgeResult::default();
        for state in matching {
            result.merge(
                self.purge_instance_history(&state.orchestration_instance.instance_id)
                    .await?,
            );
        }
        Ok(result)
    }
}
