//! # Hub Statistics
//!
//! Monotonic, eventually-consistent counters for service observability.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters maintained by the service and session manager.
#[derive(Debug, Default)]
pub struct HubStats {
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub sessions_created: AtomicU64,
    pub orchestration_work_items_completed: AtomicU64,
    pub orchestration_work_items_abandoned: AtomicU64,
    pub orchestration_work_items_discarded: AtomicU64,
    pub activity_work_items_completed: AtomicU64,
    pub activity_work_items_abandoned: AtomicU64,
    pub checkpoints_committed: AtomicU64,
    pub precondition_conflicts: AtomicU64,
    pub instances_created: AtomicU64,
}

/// Snapshot of [`HubStats`] for reporting.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HubStatsSnapshot {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub sessions_created: u64,
    pub orchestration_work_items_completed: u64,
    pub orchestration_work_items_abandoned: u64,
    pub orchestration_work_items_discarded: u64,
    pub activity_work_items_completed: u64,
    pub activity_work_items_abandoned: u64,
    pub checkpoints_committed: u64,
    pub precondition_conflicts: u64,
    pub instances_created: u64,
}

impl HubStats {
    pub fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HubStatsSnapshot {
        HubStatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            orchestration_work_items_completed: self
                .orchestration_work_items_completed
                .load(Ordering::Relaxed),
            orchestration_work_items_abandoned: self
                .orchestration_work_items_abandoned
                .load(Ordering::Relaxed),
            orchestration_work_items_discarded: self
                .orchestration_work_items_discarded
                .load(Ordering::Relaxed),
            activity_work_items_completed: self
                .activity_work_items_completed
                .load(Ordering::Relaxed),
            activity_work_items_abandoned: self
                .activity_work_items_abandoned
                .load(Ordering::Relaxed),
            checkpoints_committed: self.checkpoints_committed.load(Ordering::Relaxed),
            precondition_conflicts: self.precondition_conflicts.load(Ordering::Relaxed),
            instances_created: self.instances_created.load(Ordering::Relaxed),
        }
    }
}
