use serde::{Deserialize, Serialize};

use super::types::TransferUnit;
use crate::cluster::types::{BucketId, NodeId, TransferType};

// Endpoints
pub const ENDPOINT_TRANSFER_BUCKET: &str = "/internal/state_transfer/bucket";
pub const ENDPOINT_ACK_TRANSFER: &str = "/internal/state_transfer/ack";
pub const ENDPOINT_END_TRANSFER: &str = "/internal/state_transfer/end";
pub const ENDPOINT_BUCKET_STATS: &str = "/internal/state_transfer/stats";
pub const ENDPOINT_ADMIN_STATE_TRANSFER: &str = "/admin/state_transfer";

/// Content type of a serialized [`TransferUnit`] response body.
pub const TRANSFER_UNIT_CONTENT_TYPE: &str = "application/octet-stream";

/// Pull request for the next unit of `bucket_ids` from the current owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub requester: NodeId,
    pub bucket_ids: Vec<BucketId>,
    pub sparsed: bool,
    /// Grows by one per unit the requester has applied.
    pub expected_transfer_id: u64,
    #[serde(default)]
    pub transfer_type: TransferType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckTransferRequest {
    pub requester: NodeId,
    pub buckets: Vec<BucketId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndTransferRequest {
    pub requester: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransferResponse {
    pub update_id: u64,
}

pub fn encode_unit(unit: &TransferUnit) -> bincode::Result<Vec<u8>> {
    bincode::serialize(unit)
}

pub fn decode_unit(bytes: &[u8]) -> bincode::Result<TransferUnit> {
    bincode::deserialize(bytes)
}
