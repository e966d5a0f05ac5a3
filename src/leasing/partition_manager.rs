//! # Partition Manager
//!
//! ## Architecture: Distributed Partition Ownership via Leases
//!
//! Drives this worker's ownership of a balanced subset of control
//! partitions. Two cooperating background loops keep ownership converging:
//!
//! - **Acquire loop**: every `lease_acquire_interval`, computes the balanced
//!   target `ceil(total / active_workers)` and claims unowned or expired
//!   leases up to it. When no free lease remains, it steals at most one
//!   lease per scan from the most-loaded peer.
//! - **Renew loop**: every `lease_renew_interval`, heartbeats each held
//!   lease; a lost lease is surfaced to the observer and dropped locally.
//!
//! Observer notifications are awaited in-line, so `partition_acquired` is
//! strictly ordered before any message dispatch from that partition and
//! `partition_released` fires before the partition's queue client is
//! dropped.

use crate::config::TaskHubConfig;
use crate::error::Result;
use crate::storage::{AcquireOutcome, Lease, LeaseStore, RenewOutcome, ReleaseOutcome};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a previously-held partition was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseLossReason {
    /// Orderly release during worker shutdown.
    Shutdown,
    /// The lease expired or was taken by another worker.
    LeaseLost,
}

impl std::fmt::Display for LeaseLossReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shutdown => write!(f, "shutdown"),
            Self::LeaseLost => write!(f, "lease_lost"),
        }
    }
}

/// Two-method sink notified of partition ownership changes.
///
/// Implementations must not block for long; they run on the acquire and
/// renew loops.
#[async_trait]
pub trait PartitionObserver: Send + Sync {
    async fn partition_acquired(&self, lease: &Lease) -> Result<()>;

    async fn partition_released(&self, lease: &Lease, reason: LeaseLossReason) -> Result<()>;
}

/// Lease-driven ownership of control partitions for one worker.
pub struct PartitionManager {
    lease_store: Arc<dyn LeaseStore>,
    config: Arc<TaskHubConfig>,
    observer: Arc<dyn PartitionObserver>,
    owned: Mutex<HashMap<String, Lease>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PartitionManager {
    pub fn new(
        lease_store: Arc<dyn LeaseStore>,
        config: Arc<TaskHubConfig>,
        observer: Arc<dyn PartitionObserver>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            lease_store,
            config,
            observer,
            owned: Mutex::new(HashMap::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Load the current lease table without changing anything.
    pub async fn initialize(&self) -> Result<()> {
        let leases = self.lease_store.list_leases().await?;
        debug!(
            worker_id = %self.config.worker_id,
            lease_count = leases.len(),
            "Partition manager initialized"
        );
        Ok(())
    }

    /// Launch the acquire and renew loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            acquire_interval_secs = self.config.lease_acquire_interval.as_secs(),
            renew_interval_secs = self.config.lease_renew_interval.as_secs(),
            "Starting partition manager"
        );

        let mut tasks = self.tasks.lock().await;

        let manager = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            manager.acquire_loop().await;
        }));

        let manager = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            manager.renew_loop().await;
        }));

        Ok(())
    }

    /// Stop both loops and release every held lease in parallel.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let handles = std::mem::take(&mut *self.tasks.lock().await);
        for handle in handles {
            let _ = handle.await;
        }

        let owned: Vec<Lease> = self.owned.lock().await.drain().map(|(_, l)| l).collect();
        if owned.is_empty() {
            return;
        }

        info!(
            worker_id = %self.config.worker_id,
            lease_count = owned.len(),
            "Releasing held partition leases"
        );

        let releases = owned.into_iter().map(|lease| {
            let store = self.lease_store.clone();
            let observer = self.observer.clone();
            async move {
                match store.release(&lease).await {
                    Ok(ReleaseOutcome::Released) => {
                        debug!(partition_id = %lease.partition_id, "Lease released");
                    }
                    Ok(ReleaseOutcome::Lost) => {
                        warn!(partition_id = %lease.partition_id, "Lease was already lost at release");
                    }
                    Err(error) => {
                        warn!(partition_id = %lease.partition_id, error = %error, "Lease release failed");
                    }
                }
                if let Err(error) = observer
                    .partition_released(&lease, LeaseLossReason::Shutdown)
                    .await
                {
                    warn!(partition_id = %lease.partition_id, error = %error, "Release observer failed");
                }
            }
        });
        join_all(releases).await;
    }

    /// Partitions currently held by this worker.
    pub async fn owned_partitions(&self) -> Vec<String> {
        let mut partitions: Vec<String> = self.owned.lock().await.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    async fn acquire_loop(&self) {
        loop {
            if let Err(error) = self.acquire_pass().await {
                warn!(worker_id = %self.config.worker_id, error = %error, "Lease acquire pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.lease_acquire_interval) => {}
                _ = self.shutdown.cancelled() => {
                    debug!("Acquire loop stopping");
                    return;
                }
            }
        }
    }

    async fn renew_loop(&self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.lease_renew_interval) => {}
                _ = self.shutdown.cancelled() => {
                    debug!("Renew loop stopping");
                    return;
                }
            }
            self.renew_pass().await;
        }
    }

    /// One balancing scan: claim free leases up to the target, then steal
    /// at most one lease from the most-loaded peer.
    pub(crate) async fn acquire_pass(&self) -> Result<()> {
        let leases = self.lease_store.list_leases().await?;
        if leases.is_empty() {
            return Ok(());
        }

        let worker_id = self.config.worker_id.as_str();
        let mut peer_counts: HashMap<String, usize> = HashMap::new();
        for lease in &leases {
            if let Some(owner) = &lease.owner {
                if !lease.is_expired() {
                    *peer_counts.entry(owner.clone()).or_default() += 1;
                }
            }
        }

        let mut active_workers = peer_counts.len();
        if !peer_counts.contains_key(worker_id) {
            active_workers += 1;
        }
        let target = leases.len().div_ceil(active_workers);

        let mut owned = self.owned.lock().await;

        for lease in leases.iter().filter(|l| l.is_available()) {
            if owned.len() >= target {
                break;
            }
            if owned.contains_key(&lease.partition_id) {
                continue;
            }
            match self
                .lease_store
                .acquire(&lease.partition_id, worker_id, self.config.lease_interval)
                .await
            {
                Ok(AcquireOutcome::Acquired(acquired)) => {
                    info!(
                        worker_id,
                        partition_id = %acquired.partition_id,
                        epoch = acquired.epoch,
                        "Partition lease acquired"
                    );
                    if let Err(error) = self.observer.partition_acquired(&acquired).await {
                        warn!(partition_id = %acquired.partition_id, error = %error, "Acquire observer failed");
                    }
                    owned.insert(acquired.partition_id.clone(), acquired);
                }
                Ok(AcquireOutcome::AlreadyOwned { owner }) => {
                    debug!(partition_id = %lease.partition_id, owner = ?owner, "Lost acquire race");
                }
                Err(error) => {
                    warn!(partition_id = %lease.partition_id, error = %error, "Lease acquire failed");
                }
            }
        }

        if owned.len() < target {
            self.try_steal_one(&leases, &peer_counts, target, &mut owned)
                .await;
        }

        Ok(())
    }

    /// Steal a single lease from the peer holding the most, when that peer
    /// sits above the balanced target.
    async fn try_steal_one(
        &self,
        leases: &[Lease],
        peer_counts: &HashMap<String, usize>,
        target: usize,
        owned: &mut HashMap<String, Lease>,
    ) {
        let worker_id = self.config.worker_id.as_str();
        let most_loaded = peer_counts
            .iter()
            .filter(|(owner, _)| owner.as_str() != worker_id)
            .max_by_key(|(_, count)| **count);

        let (victim, victim_count) = match most_loaded {
            Some((owner, count)) if *count > target => (owner.clone(), *count),
            _ => return,
        };

        let candidate = leases
            .iter()
            .find(|l| l.owner.as_deref() == Some(victim.as_str()) && !l.is_expired());
        let candidate = match candidate {
            Some(lease) => lease,
            None => return,
        };

        debug!(
            worker_id,
            victim = %victim,
            victim_count,
            target,
            partition_id = %candidate.partition_id,
            "Attempting lease steal for balance"
        );

        match self
            .lease_store
            .steal(candidate, worker_id, self.config.lease_interval)
            .await
        {
            Ok(AcquireOutcome::Acquired(stolen)) => {
                info!(
                    worker_id,
                    partition_id = %stolen.partition_id,
                    from = %victim,
                    "Partition lease stolen"
                );
                if let Err(error) = self.observer.partition_acquired(&stolen).await {
                    warn!(partition_id = %stolen.partition_id, error = %error, "Acquire observer failed");
                }
                owned.insert(stolen.partition_id.clone(), stolen);
            }
            Ok(AcquireOutcome::AlreadyOwned { owner }) => {
                debug!(partition_id = %candidate.partition_id, owner = ?owner, "Lost steal race");
            }
            Err(error) => {
                warn!(partition_id = %candidate.partition_id, error = %error, "Lease steal failed");
            }
        }
    }

    pub(crate) async fn renew_pass(&self) {
        let mut owned = self.owned.lock().await;
        let held: Vec<Lease> = owned.values().cloned().collect();

        for lease in held {
            match self
                .lease_store
                .renew(&lease, self.config.lease_interval)
                .await
            {
                Ok(RenewOutcome::Renewed(renewed)) => {
                    owned.insert(renewed.partition_id.clone(), renewed);
                }
                Ok(RenewOutcome::Lost) => {
                    warn!(
                        worker_id = %self.config.worker_id,
                        partition_id = %lease.partition_id,
                        "Partition lease lost"
                    );
                    owned.remove(&lease.partition_id);
                    if let Err(error) = self
                        .observer
                        .partition_released(&lease, LeaseLossReason::LeaseLost)
                        .await
                    {
                        warn!(partition_id = %lease.partition_id, error = %error, "Release observer failed");
                    }
                }
                Err(error) if error.is_transient() => {
                    warn!(
                        partition_id = %lease.partition_id,
                        error = %error,
                        "Transient renew failure, retrying next heartbeat"
                    );
                }
                Err(error) => {
                    error!(
                        partition_id = %lease.partition_id,
                        error = %error,
                        "Lease renew failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryLeaseStore;
    use crate::storage::LeaseStore as _;
    use std::time::Duration;

    struct RecordingObserver {
        acquired: Mutex<Vec<String>>,
        released: Mutex<Vec<(String, LeaseLossReason)>>,
    }

    impl RecordingObserver {
        fn new() -> Self {
            Self {
                acquired: Mutex::new(Vec::new()),
                released: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PartitionObserver for RecordingObserver {
        async fn partition_acquired(&self, lease: &Lease) -> Result<()> {
            self.acquired.lock().await.push(lease.partition_id.clone());
            Ok(())
        }

        async fn partition_released(
            &self,
            lease: &Lease,
            reason: LeaseLossReason,
        ) -> Result<()> {
            self.released
                .lock()
                .await
                .push((lease.partition_id.clone(), reason));
            Ok(())
        }
    }

    fn test_config(worker_id: &str) -> Arc<TaskHubConfig> {
        Arc::new(TaskHubConfig {
            worker_id: worker_id.to_string(),
            lease_interval: Duration::from_secs(30),
            lease_renew_interval: Duration::from_secs(10),
            lease_acquire_interval: Duration::from_millis(20),
            ..TaskHubConfig::default()
        })
    }

    async fn store_with_partitions(count: u32) -> Arc<InMemoryLeaseStore> {
        let store = Arc::new(InMemoryLeaseStore::new());
        for index in 0..count {
            store
                .create_lease_if_not_exists(&crate::constants::control_queue_name("hub", index))
                .await
                .unwrap();
        }
        store
    }

    fn manager(
        store: Arc<InMemoryLeaseStore>,
        config: Arc<TaskHubConfig>,
        observer: Arc<RecordingObserver>,
    ) -> Arc<PartitionManager> {
        Arc::new(PartitionManager::new(
            store,
            config,
            observer,
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn lone_worker_acquires_every_partition() {
        let store = store_with_partitions(4).await;
        let observer = Arc::new(RecordingObserver::new());
        let manager = manager(store, test_config("worker-a"), observer.clone());

        manager.acquire_pass().await.unwrap();

        assert_eq!(manager.owned_partitions().await.len(), 4);
        assert_eq!(observer.acquired.lock().await.len(), 4);
    }

    #[tokio::test]
    async fn second_worker_steals_toward_balance() {
        let store = store_with_partitions(16).await;
        let observer_a = Arc::new(RecordingObserver::new());
        let manager_a = manager(store.clone(), test_config("worker-a"), observer_a);
        manager_a.acquire_pass().await.unwrap();
        assert_eq!(manager_a.owned_partitions().await.len(), 16);

        let observer_b = Arc::new(RecordingObserver::new());
        let manager_b = manager(store.clone(), test_config("worker-b"), observer_b.clone());

        // One steal per scan: eight scans reach the 8/8 balance.
        for _ in 0..8 {
            manager_b.acquire_pass().await.unwrap();
        }
        assert_eq!(manager_b.owned_partitions().await.len(), 8);

        // Further scans stay balanced; no lease held by a peer at target
        // is stolen.
        manager_b.acquire_pass().await.unwrap();
        assert_eq!(manager_b.owned_partitions().await.len(), 8);

        // Worker A discovers the thefts on renewal.
        manager_a.renew_pass().await;
        assert_eq!(manager_a.owned_partitions().await.len(), 8);
    }

    #[tokio::test]
    async fn renew_loss_notifies_observer() {
        let store = store_with_partitions(1).await;
        let observer = Arc::new(RecordingObserver::new());
        let manager_a = manager(store.clone(), test_config("worker-a"), observer.clone());
        manager_a.acquire_pass().await.unwrap();

        // Another worker steals the only lease out from under A.
        let lease = store.list_leases().await.unwrap().remove(0);
        let stolen = store
            .steal(&lease, "worker-b", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(matches!(stolen, AcquireOutcome::Acquired(_)));

        manager_a.renew_pass().await;
        assert!(manager_a.owned_partitions().await.is_empty());
        let released = observer.released.lock().await;
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].1, LeaseLossReason::LeaseLost);
    }

    #[tokio::test]
    async fn stop_releases_all_leases() {
        let store = store_with_partitions(4).await;
        let observer = Arc::new(RecordingObserver::new());
        let manager = manager(store.clone(), test_config("worker-a"), observer.clone());

        manager.start().await.unwrap();
        // Give the acquire loop a moment to claim everything.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.owned_partitions().await.len(), 4);

        manager.stop().await;
        assert!(manager.owned_partitions().await.is_empty());
        let released = observer.released.lock().await;
        assert_eq!(released.len(), 4);
        assert!(released
            .iter()
            .all(|(_, reason)| *reason == LeaseLossReason::Shutdown));

        let leases = store.list_leases().await.unwrap();
        assert!(leases.iter().all(Lease::is_available));
    }
}
