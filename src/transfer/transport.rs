use async_trait::async_trait;

use super::protocol::TransferRequest;
use super::types::TransferUnit;
use crate::cluster::types::{BucketId, NodeId};
use crate::error::TransferError;

/// Calls the transfer driver makes on the node that currently owns a bucket.
#[async_trait]
pub trait BucketTransport: Send + Sync {
    async fn transfer_bucket(
        &self,
        owner: &NodeId,
        request: TransferRequest,
    ) -> Result<TransferUnit, TransferError>;

    /// Tells `owner` that `buckets` were applied and its copy can go.
    async fn ack_transfer_completed(
        &self,
        owner: &NodeId,
        buckets: &[BucketId],
    ) -> Result<(), TransferError>;

    /// Lets `peer` drop whatever it kept for serving this node.
    async fn signal_end_of_transfer(&self, peer: &NodeId) -> Result<(), TransferError>;
}
