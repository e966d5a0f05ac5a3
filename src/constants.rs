//! # System Constants and Naming Conventions
//!
//! Central constants that define the persisted layout of a task hub:
//! queue names, container names, and operational boundaries shared by
//! every component.

/// Consumer group recorded in per-partition lease blobs.
pub const DEFAULT_CONSUMER_GROUP: &str = "default";

/// Inclusive lower bound for the configured partition count.
pub const MIN_PARTITION_COUNT: u32 = 1;

/// Inclusive upper bound for the configured partition count.
pub const MAX_PARTITION_COUNT: u32 = 16;

/// Upper bound for a single control-queue dequeue batch.
pub const MAX_CONTROL_QUEUE_BATCH_SIZE: usize = 32;

/// Messages delivered more than this many times are treated as poison
/// and removed from their queue.
pub const MAX_MESSAGE_DEQUEUE_COUNT: u32 = 16;

/// Suffix appended to off-loaded large-message blob names.
pub const LARGE_MESSAGE_BLOB_SUFFIX: &str = ".json.gz";

/// Poll cadence for completion waits against the instance store.
pub const COMPLETION_POLL_INTERVAL_MS: u64 = 2_000;

/// Name of the control queue for a given partition index.
///
/// Control queues are numbered `<hub>-control-00` through `<hub>-control-NN`
/// with the index zero-padded to two digits.
pub fn control_queue_name(task_hub: &str, partition_index: u32) -> String {
    format!("{task_hub}-control-{partition_index:02}")
}

/// Name of the hub-wide activity work-item queue.
pub fn work_item_queue_name(task_hub: &str) -> String {
    format!("{task_hub}-workitems")
}

/// Name of the lease container holding one entry per partition plus the
/// task-hub sentinel.
pub fn lease_container_name(task_hub: &str) -> String {
    format!("{task_hub}-leases")
}

/// Name of the blob container holding off-loaded large messages.
pub fn large_message_container_name(task_hub: &str) -> String {
    format!("{task_hub}-largemessages")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_queue_names_are_zero_padded() {
        assert_eq!(control_queue_name("hub", 0), "hub-control-00");
        assert_eq!(control_queue_name("hub", 7), "hub-control-07");
        assert_eq!(control_queue_name("hub", 15), "hub-control-15");
    }

    #[test]
    fn hub_scoped_names_embed_the_hub() {
        assert_eq!(work_item_queue_name("orders"), "orders-workitems");
        assert_eq!(lease_container_name("orders"), "orders-leases");
        assert_eq!(large_message_container_name("orders"), "orders-largemessages");
    }
}
