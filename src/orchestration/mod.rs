//! # Orchestration Service
//!
//! The work-item/client facade and the checkpointed completion path.

pub mod service;
pub mod stats;
pub mod work_items;

pub use service::{OrchestrationService, StorageBackend};
pub use stats::{HubStats, HubStatsSnapshot};
pub use work_items::{TaskActivityWorkItem, TaskOrchestrationWorkItem};
