//! # taskhub-core
//!
//! Core of a durable task orchestration service backed by a queue/blob
//! store. Orchestrations (deterministic coordinating code) and activities
//! (side-effecting work units) make exactly-once logical progress despite
//! worker crashes, duplicate deliveries, and concurrent workers.
//!
//! The moving parts:
//!
//! - [`leasing::PartitionManager`] — distributed lease ownership of a fixed
//!   set of control partitions, with balancing and stealing.
//! - [`sessions::SessionManager`] — per-instance serialization of partition
//!   message streams, with an extended-session cache for hot instances.
//! - [`OrchestrationService::complete_task_orchestration_work_item`] — the
//!   three-phase checkpoint (enqueue outbound → commit history under an
//!   etag → delete inbound) yielding at-least-once delivery with
//!   idempotent replay.
//! - [`messaging::LargeMessageCodec`] — transparent blob off-loading for
//!   payloads above the queue byte budget.
//!
//! Storage is abstracted behind the traits in [`storage`]; an in-memory
//! backend ships for tests and development, and a Postgres/pgmq backend
//! for production.

pub mod config;
pub mod constants;
pub mod error;
pub mod history;
pub mod leasing;
pub mod logging;
pub mod messaging;
pub mod orchestration;
pub mod partition;
pub mod sessions;
pub mod storage;

pub use config::TaskHubConfig;
pub use error::{Result, TaskHubError};
pub use orchestration::{OrchestrationService, StorageBackend};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_loads_successfully() {
        let config = TaskHubConfig::default();
        assert_eq!(config.partition_count, 4);
        assert_eq!(config.control_queue_batch_size, 32);
    }
}
