//! # Instance-to-Partition Routing
//!
//! Every orchestration instance maps to exactly one control partition via an
//! FNV-1a hash of its instance id modulo the hub's partition count. The
//! mapping is stable for the life of a hub but NOT sticky across partition
//! count changes, which is why the partition count is immutable once the hub
//! sentinel has been written.

use crate::constants::control_queue_name;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a hash over the UTF-8 bytes of `value`.
fn fnv1a(value: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in value.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Control partition index owning the given instance.
pub fn partition_index(instance_id: &str, partition_count: u32) -> u32 {
    fnv1a(instance_id) % partition_count.max(1)
}

/// Control queue name owning the given instance.
pub fn partition_queue_for_instance(
    task_hub: &str,
    instance_id: &str,
    partition_count: u32,
) -> String {
    control_queue_name(task_hub, partition_index(instance_id, partition_count))
}
