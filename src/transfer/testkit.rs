//! In-process cluster for exercising the transfer protocol without sockets.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::protocol::TransferRequest;
use super::source::TransferSource;
use super::task::StateTransferTask;
use super::transport::BucketTransport;
use super::types::TransferUnit;
use crate::cluster::coordinator::ClusterCoordinator;
use crate::cluster::distribution::DistributionMap;
use crate::cluster::types::{BucketId, BucketStatistics, LockResult, NodeId, TransferOutcome};
use crate::config::StateTransferConfig;
use crate::error::TransferError;
use crate::storage::CacheStore;
use crate::storage::memory::BucketStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Timeout,
    /// The owner serves the request but the answer never arrives.
    LostResponse,
    Suspect,
    Fatal,
}

type ServeHook = Arc<dyn Fn(&TransferRequest) + Send + Sync>;

/// Routes transfer calls between in-process [`TransferSource`]s.
#[derive(Default)]
pub struct LocalCluster {
    sources: DashMap<NodeId, Arc<TransferSource>>,
    stores: DashMap<NodeId, Arc<BucketStore>>,
    faults: DashMap<NodeId, VecDeque<Fault>>,
    dead: DashSet<NodeId>,
    requests: Mutex<Vec<(NodeId, TransferRequest)>>,
    acks: Mutex<Vec<(NodeId, Vec<BucketId>)>>,
    suspicions: AtomicU32,
    before_serve: Mutex<Option<ServeHook>>,
}

impl LocalCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &NodeId, store: Arc<BucketStore>, source: Arc<TransferSource>) {
        self.stores.insert(node.clone(), store);
        self.sources.insert(node.clone(), source);
    }

    pub fn store(&self, node: &NodeId) -> Option<Arc<BucketStore>> {
        self.stores.get(node).map(|s| Arc::clone(&s))
    }

    /// Queues faults for the next transfer calls to `owner`, in order.
    pub fn inject(&self, owner: &NodeId, faults: &[Fault]) {
        self.faults
            .entry(owner.clone())
            .or_default()
            .extend(faults.iter().copied());
    }

    pub fn kill(&self, node: &NodeId) {
        self.dead.insert(node.clone());
    }

    pub fn on_serve(&self, hook: impl Fn(&TransferRequest) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.before_serve.lock() {
            *slot = Some(Arc::new(hook));
        }
    }

    pub fn requests(&self) -> Vec<(NodeId, TransferRequest)> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn acks(&self) -> Vec<(NodeId, Vec<BucketId>)> {
        self.acks.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn suspicions(&self) -> u32 {
        self.suspicions.load(Ordering::SeqCst)
    }

    fn source(&self, node: &NodeId) -> Result<Arc<TransferSource>, TransferError> {
        if self.dead.contains(node) {
            self.suspicions.fetch_add(1, Ordering::SeqCst);
            return Err(TransferError::PeerSuspected { peer: node.clone() });
        }
        self.sources
            .get(node)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| TransferError::PeerSuspected { peer: node.clone() })
    }

    fn next_fault(&self, node: &NodeId) -> Option<Fault> {
        self.faults.get_mut(node).and_then(|mut queue| queue.pop_front())
    }
}

/// [`BucketTransport`] of one node of a [`LocalCluster`].
pub struct LocalTransport {
    local: NodeId,
    cluster: Arc<LocalCluster>,
}

impl LocalTransport {
    pub fn new(local: NodeId, cluster: Arc<LocalCluster>) -> Self {
        Self { local, cluster }
    }
}

#[async_trait]
impl BucketTransport for LocalTransport {
    async fn transfer_bucket(
        &self,
        owner: &NodeId,
        request: TransferRequest,
    ) -> Result<TransferUnit, TransferError> {
        let source = self.cluster.source(owner)?;
        if let Ok(mut log) = self.cluster.requests.lock() {
            log.push((owner.clone(), request.clone()));
        }

        match self.cluster.next_fault(owner) {
            Some(Fault::Timeout) => return Err(TransferError::Timeout { peer: owner.clone() }),
            Some(Fault::Suspect) => {
                self.cluster.suspicions.fetch_add(1, Ordering::SeqCst);
                return Err(TransferError::PeerSuspected { peer: owner.clone() });
            }
            Some(Fault::Fatal) => return Err(TransferError::fatal("injected failure")),
            Some(Fault::LostResponse) => {
                source.transfer_bucket(request).await;
                return Err(TransferError::Timeout { peer: owner.clone() });
            }
            None => {}
        }

        let hook = self.cluster.before_serve.lock().ok().and_then(|h| h.clone());
        if let Some(hook) = hook {
            hook(&request);
        }
        Ok(source.transfer_bucket(request).await)
    }

    async fn ack_transfer_completed(
        &self,
        owner: &NodeId,
        buckets: &[BucketId],
    ) -> Result<(), TransferError> {
        let source = self.cluster.source(owner)?;
        if let Ok(mut acks) = self.cluster.acks.lock() {
            acks.push((owner.clone(), buckets.to_vec()));
        }
        source.ack_transfer_completed(&self.local, buckets).await;
        Ok(())
    }

    async fn signal_end_of_transfer(&self, peer: &NodeId) -> Result<(), TransferError> {
        let source = self.cluster.source(peer)?;
        source.end_of_transfer(&self.local).await;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    Lock(Vec<BucketId>),
    Release(Vec<BucketId>),
    Announce(Vec<BucketId>),
    Transferred(NodeId, Vec<BucketId>),
    Presence(bool),
    End(TransferOutcome),
}

/// [`ClusterCoordinator`] backed directly by a shared [`DistributionMap`].
pub struct TestCoordinator {
    local: NodeId,
    map: Arc<DistributionMap>,
    cluster: Arc<LocalCluster>,
    events: Mutex<Vec<CoordinatorEvent>>,
    failing_locks: AtomicU32,
    views_installed: AtomicU32,
}

impl TestCoordinator {
    pub fn new(local: NodeId, map: Arc<DistributionMap>, cluster: Arc<LocalCluster>) -> Self {
        Self {
            local,
            map,
            cluster,
            events: Mutex::new(Vec::new()),
            failing_locks: AtomicU32::new(0),
            views_installed: AtomicU32::new(0),
        }
    }

    /// The next `count` lock calls fail.
    pub fn fail_locks(&self, count: u32) {
        self.failing_locks.store(count, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<CoordinatorEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn views_installed(&self) -> u32 {
        self.views_installed.load(Ordering::SeqCst)
    }

    fn record(&self, event: CoordinatorEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[async_trait]
impl ClusterCoordinator for TestCoordinator {
    async fn determine_cluster_status(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn announce_presence(&self, in_state_transfer: bool) -> anyhow::Result<()> {
        self.record(CoordinatorEvent::Presence(in_state_transfer));
        Ok(())
    }

    async fn lock_buckets(&self, buckets: &[BucketId]) -> Result<LockResult, TransferError> {
        let failing = self.failing_locks.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_locks.store(failing - 1, Ordering::SeqCst);
            return Err(TransferError::Timeout {
                peer: NodeId::from("coordinator"),
            });
        }
        let result = self.map.lock_buckets(&self.local, buckets);
        self.record(CoordinatorEvent::Lock(result.lock_acquired.clone()));
        Ok(result)
    }

    async fn release_buckets(&self, buckets: &[BucketId]) -> anyhow::Result<()> {
        self.map.release_buckets(&self.local, buckets);
        self.record(CoordinatorEvent::Release(buckets.to_vec()));
        Ok(())
    }

    async fn announce_state_transfer(&self, buckets: &[BucketId]) -> anyhow::Result<()> {
        self.map.announce_state_transfer(&self.local, buckets);
        self.record(CoordinatorEvent::Announce(buckets.to_vec()));
        Ok(())
    }

    async fn bucket_statistics(&self, bucket: BucketId, owner: &NodeId) -> Option<BucketStatistics> {
        self.cluster
            .store(owner)
            .map(|store| store.bucket_statistics(bucket))
    }

    async fn buckets_transferred(&self, owner: &NodeId, buckets: &[BucketId]) -> anyhow::Result<()> {
        self.map.mark_transferred(&self.local, owner, buckets);
        self.record(CoordinatorEvent::Transferred(owner.clone(), buckets.to_vec()));
        Ok(())
    }

    async fn end_state_transfer(&self, outcome: &TransferOutcome) {
        self.record(CoordinatorEvent::End(outcome.clone()));
    }

    fn view_installation_complete(&self) {
        self.views_installed.fetch_add(1, Ordering::SeqCst);
    }
}

/// One node of a [`LocalCluster`] with both protocol halves wired up.
pub struct TestNode {
    pub id: NodeId,
    pub store: Arc<BucketStore>,
    pub source: Arc<TransferSource>,
    pub coordinator: Arc<TestCoordinator>,
    pub driver: Arc<StateTransferTask>,
}

impl TestNode {
    pub fn spawn(
        name: &str,
        cluster: &Arc<LocalCluster>,
        map: &Arc<DistributionMap>,
        config: StateTransferConfig,
        capacity_bytes: Option<u64>,
    ) -> Self {
        let id = NodeId::from(name);
        let store = Arc::new(BucketStore::with_capacity(map.bucket_count(), capacity_bytes));
        let source = TransferSource::new(
            id.clone(),
            store.clone(),
            map.clone(),
            &config,
            false,
        );
        let coordinator = Arc::new(TestCoordinator::new(id.clone(), map.clone(), cluster.clone()));
        let transport = Arc::new(LocalTransport::new(id.clone(), cluster.clone()));
        let driver = StateTransferTask::new(
            id.clone(),
            config,
            coordinator.clone(),
            transport,
            store.clone(),
        );
        cluster.register(&id, store.clone(), source.clone());

        Self {
            id,
            store,
            source,
            coordinator,
            driver,
        }
    }
}

/// Waits for the driver's next finished run.
pub async fn wait_for_outcome(driver: &StateTransferTask) -> TransferOutcome {
    let mut outcomes = driver.subscribe_outcomes();
    let outcome = tokio::time::timeout(
        Duration::from_secs(120),
        outcomes.wait_for(|outcome| outcome.is_some()),
    )
    .await
    .expect("state transfer did not finish")
    .expect("driver dropped");
    Option::clone(&outcome).expect("outcome present")
}
