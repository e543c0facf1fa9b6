//! Seams between the transfer driver and the membership / distribution layers.
//!
//! The driver never talks to the cluster directly; everything it needs from
//! membership goes through [`ClusterCoordinator`], and everything it needs from
//! the bucket table goes through [`OwnershipOracle`]. Both are implemented by
//! in-process types for tests and by HTTP clients in the node binary.

use super::types::{BucketId, BucketStatistics, LockResult, NodeId, TransferOutcome};
use crate::error::TransferError;

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ClusterCoordinator: Send + Sync {
    /// Refreshes the local view of the bucket table and node statistics.
    async fn determine_cluster_status(&self) -> Result<()>;

    /// Tells the cluster whether this node is currently pulling state.
    async fn announce_presence(&self, in_state_transfer: bool) -> Result<()>;

    /// Asks the coordinator to lock `buckets` for this node. Buckets that were
    /// reassigned elsewhere in the meantime come back in `owner_changed`.
    async fn lock_buckets(&self, buckets: &[BucketId]) -> Result<LockResult, TransferError>;

    async fn release_buckets(&self, buckets: &[BucketId]) -> Result<()>;

    async fn announce_state_transfer(&self, buckets: &[BucketId]) -> Result<()>;

    /// Statistics `owner` last reported for `bucket`, if any.
    async fn bucket_statistics(&self, bucket: BucketId, owner: &NodeId) -> Option<BucketStatistics>;

    /// Records that `buckets` now live on this node instead of `owner`.
    async fn buckets_transferred(&self, owner: &NodeId, buckets: &[BucketId]) -> Result<()>;

    async fn end_state_transfer(&self, outcome: &TransferOutcome);

    /// Marks the pending view installation as complete.
    fn view_installation_complete(&self);
}

pub trait OwnershipOracle: Send + Sync {
    fn select_node(&self, key: &str) -> Option<NodeId>;

    fn verify_temporary_ownership(&self, bucket: BucketId, node: &NodeId) -> bool;
}
