use super::client::post_with_retry;
use super::distribution::DistributionMap;
use super::protocol::{DistributionUpdate, ENDPOINT_ADMIN_DISTRIBUTION};
use super::types::{BucketId, LockResult, NodeId, TransferOutcome};

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Coordinator-side bookkeeping: the authoritative bucket table, the lock
/// service on top of it, and the set of nodes the table is published to.
pub struct CoordinatorService {
    distribution: Arc<DistributionMap>,
    members: Vec<NodeId>,
    in_transfer: DashMap<NodeId, bool>,
    reports: DashMap<NodeId, TransferOutcome>,
    http_client: reqwest::Client,
}

impl CoordinatorService {
    pub fn new(distribution: Arc<DistributionMap>, members: Vec<NodeId>) -> Arc<Self> {
        Arc::new(Self {
            distribution,
            members,
            in_transfer: DashMap::new(),
            reports: DashMap::new(),
            http_client: reqwest::Client::new(),
        })
    }

    pub fn distribution(&self) -> &Arc<DistributionMap> {
        &self.distribution
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn snapshot(&self) -> DistributionUpdate {
        DistributionUpdate {
            version: self.distribution.version(),
            assignments: self.distribution.assignments(),
        }
    }

    pub fn lock(&self, requester: &NodeId, buckets: &[BucketId]) -> LockResult {
        let result = self.distribution.lock_buckets(requester, buckets);
        tracing::info!(
            "Lock request from {}: acquired {:?}, owner changed {:?}",
            requester,
            result.lock_acquired,
            result.owner_changed
        );
        result
    }

    pub fn release(&self, requester: &NodeId, buckets: &[BucketId]) {
        self.distribution.release_buckets(requester, buckets);
        tracing::debug!("Released {:?} for {}", buckets, requester);
    }

    pub fn announce(&self, requester: &NodeId, buckets: &[BucketId]) {
        self.distribution
            .announce_state_transfer(requester, buckets);
    }

    pub fn transferred(&self, requester: &NodeId, owner: &NodeId, buckets: &[BucketId]) {
        self.distribution
            .mark_transferred(requester, owner, buckets);
        tracing::info!("Buckets {:?} now owned by {} (was {})", buckets, requester, owner);
    }

    pub fn set_presence(&self, node: NodeId, in_state_transfer: bool) {
        self.in_transfer.insert(node, in_state_transfer);
    }

    pub fn nodes_in_transfer(&self) -> Vec<NodeId> {
        self.in_transfer
            .iter()
            .filter(|entry| *entry.value())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn record_report(&self, node: NodeId, outcome: TransferOutcome) {
        tracing::info!("State transfer on {} ended: {}", node, outcome);
        self.reports.insert(node, outcome);
    }

    pub fn last_report(&self, node: &NodeId) -> Option<TransferOutcome> {
        self.reports.get(node).map(|entry| entry.value().clone())
    }

    /// Plans `buckets` onto `to` and returns what actually has to move.
    pub fn move_buckets(&self, buckets: &[BucketId], to: &NodeId) -> Vec<BucketId> {
        let planned = self.distribution.plan_move(buckets, to);
        tracing::info!("Planned move of {} buckets to {}", planned.len(), to);
        planned
    }

    /// Pushes the current table to every member, this node included.
    pub async fn publish(&self) {
        let update = self.snapshot();
        for member in &self.members {
            let url = format!("http://{}{}", member, ENDPOINT_ADMIN_DISTRIBUTION);
            match post_with_retry(
                &self.http_client,
                url,
                &update,
                Duration::from_millis(1500),
                3,
            )
            .await
            {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!("Published map version {} to {}", update.version, member);
                }
                Ok(resp) => {
                    tracing::warn!("Publishing map to {} failed {}", member, resp.status());
                }
                Err(e) => {
                    tracing::warn!("Publishing map to {} failed: {}", member, e);
                }
            }
        }
    }
}
