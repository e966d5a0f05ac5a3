//! # Task Hub Configuration
//!
//! Recognized options for the orchestration service, their defaults, and
//! environment-based loading. Interval ratios and partition bounds are
//! validated up front; a bad configuration is a fatal startup error.

use crate::constants::{MAX_CONTROL_QUEUE_BATCH_SIZE, MAX_PARTITION_COUNT, MIN_PARTITION_COUNT};
use crate::error::{Result, TaskHubError};
use std::time::Duration;
use uuid::Uuid;

/// Configuration for a task hub worker process.
#[derive(Debug, Clone)]
pub struct TaskHubConfig {
    /// Task hub name; namespaces every queue, container, and table row.
    pub task_hub_name: String,
    /// Backend credentials for the Postgres storage implementation.
    pub database_url: String,
    /// Unique worker identity, used as the lease holder.
    pub worker_id: String,
    /// Number of control partitions; immutable per hub after creation.
    pub partition_count: u32,
    /// Messages pulled per control-queue dequeue.
    pub control_queue_batch_size: usize,
    /// Concurrent orchestration work items surfaced to the host.
    pub max_concurrent_orchestration_work_items: usize,
    /// Concurrent activity work items surfaced to the host.
    pub max_concurrent_activity_work_items: usize,
    /// Keep orchestration sessions warm across work-item boundaries.
    pub extended_sessions_enabled: bool,
    /// Global bound on outstanding storage operations.
    pub max_storage_operation_concurrency: usize,
    /// Absolute lease TTL.
    pub lease_interval: Duration,
    /// Per-lease heartbeat cadence.
    pub lease_renew_interval: Duration,
    /// Lease scan/steal cadence.
    pub lease_acquire_interval: Duration,
    /// Visibility timeout for control-queue messages.
    pub control_queue_visibility_timeout: Duration,
    /// Visibility timeout for activity work items.
    pub work_item_queue_visibility_timeout: Duration,
    /// Serialized messages above this many bytes are off-loaded to blobs.
    pub large_message_threshold_bytes: usize,
    /// Initial backoff when a queue poll comes back empty.
    pub poll_backoff_min: Duration,
    /// Backoff ceiling for idle queue polls.
    pub poll_backoff_max: Duration,
}

impl Default for TaskHubConfig {
    fn default() -> Self {
        Self {
            task_hub_name: "default".to_string(),
            database_url: "postgresql://localhost/taskhub_development".to_string(),
            worker_id: default_worker_id(),
            partition_count: 4,
            control_queue_batch_size: 32,
            max_concurrent_orchestration_work_items: 100,
            max_concurrent_activity_work_items: 10,
            extended_sessions_enabled: true,
            max_storage_operation_concurrency: 64,
            lease_interval: Duration::from_secs(30),
            lease_renew_interval: Duration::from_secs(10),
            lease_acquire_interval: Duration::from_secs(10),
            control_queue_visibility_timeout: Duration::from_secs(300), // 5 minutes
            work_item_queue_visibility_timeout: Duration::from_secs(300),
            large_message_threshold_bytes: 60 * 1024,
            poll_backoff_min: Duration::from_millis(500),
            poll_backoff_max: Duration::from_secs(5),
        }
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{host}-{}", Uuid::new_v4())
}

impl TaskHubConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("TASKHUB_NAME") {
            config.task_hub_name = name;
        }

        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Ok(worker_id) = std::env::var("TASKHUB_WORKER_ID") {
            config.worker_id = worker_id;
        }

        if let Ok(partitions) = std::env::var("TASKHUB_PARTITION_COUNT") {
            config.partition_count = partitions.parse().map_err(|e| {
                TaskHubError::configuration(format!("Invalid partition_count: {e}"))
            })?;
        }

        if let Ok(batch) = std::env::var("TASKHUB_CONTROL_BATCH_SIZE") {
            config.control_queue_batch_size = batch.parse().map_err(|e| {
                TaskHubError::configuration(format!("Invalid control_queue_batch_size: {e}"))
            })?;
        }

        if let Ok(extended) = std::env::var("TASKHUB_EXTENDED_SESSIONS") {
            config.extended_sessions_enabled = extended.parse().map_err(|e| {
                TaskHubError::configuration(format!("Invalid extended_sessions_enabled: {e}"))
            })?;
        }

        if let Ok(secs) = std::env::var("TASKHUB_LEASE_INTERVAL_SECS") {
            let secs: u64 = secs.parse().map_err(|e| {
                TaskHubError::configuration(format!("Invalid lease_interval: {e}"))
            })?;
            config.lease_interval = Duration::from_secs(secs);
        }

        if let Ok(bytes) = std::env::var("TASKHUB_LARGE_MESSAGE_THRESHOLD") {
            config.large_message_threshold_bytes = bytes.parse().map_err(|e| {
                TaskHubError::configuration(format!("Invalid large_message_threshold_bytes: {e}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate operational bounds. Called by `from_env` and at service start.
    pub fn validate(&self) -> Result<()> {
        if self.task_hub_name.is_empty() {
            return Err(TaskHubError::configuration("task_hub_name must not be empty"));
        }

        if self.partition_count < MIN_PARTITION_COUNT || self.partition_count > MAX_PARTITION_COUNT
        {
            return Err(TaskHubError::configuration(format!(
                "partition_count {} outside [{MIN_PARTITION_COUNT},{MAX_PARTITION_COUNT}]",
                self.partition_count
            )));
        }

        if self.control_queue_batch_size == 0
            || self.control_queue_batch_size > MAX_CONTROL_QUEUE_BATCH_SIZE
        {
            return Err(TaskHubError::configuration(format!(
                "control_queue_batch_size {} outside [1,{MAX_CONTROL_QUEUE_BATCH_SIZE}]",
                self.control_queue_batch_size
            )));
        }

        // The lease TTL must comfortably outlive missed heartbeats.
        if self.lease_interval < self.lease_renew_interval * 3 {
            return Err(TaskHubError::configuration(format!(
                "lease_interval {:?} must be at least 3x lease_renew_interval {:?}",
                self.lease_interval, self.lease_renew_interval
            )));
        }

        if self.max_storage_operation_concurrency == 0 {
            return Err(TaskHubError::configuration(
                "max_storage_operation_concurrency must be positive",
            ));
        }

        if self.large_message_threshold_bytes == 0 {
            return Err(TaskHubError::configuration(
                "large_message_threshold_bytes must be positive",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = TaskHubConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.partition_count, 4);
        assert_eq!(config.control_queue_batch_size, 32);
        assert!(config.extended_sessions_enabled);
    }

    #[test]
    fn partition_count_bounds_are_enforced() {
        let mut config = TaskHubConfig::default();
        config.partition_count = 0;
        assert!(config.validate().is_err());
        config.partition_count = 17;
        assert!(config.validate().is_err());
        config.partition_count = 16;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn lease_ratio_is_enforced() {
        let mut config = TaskHubConfig::default();
        config.lease_interval = Duration::from_secs(20);
        config.lease_renew_interval = Duration::from_secs(10);
        assert!(config.validate().is_err());
    }
}
