//! Coordinator Network Protocol
//!
//! Endpoints and DTOs for the bucket lock service, the published distribution
//! table and the membership notifications a transferring node sends.
//! All bodies are JSON.

use super::types::{BucketAssignment, BucketId, NodeId, TransferOutcome};
use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// Lock a set of buckets for the requesting node (served by the coordinator).
pub const ENDPOINT_LOCK_BUCKETS: &str = "/internal/buckets/lock";
/// Release previously locked buckets.
pub const ENDPOINT_RELEASE_BUCKETS: &str = "/internal/buckets/release";
/// Announce that the requester started pulling the given buckets.
pub const ENDPOINT_ANNOUNCE_TRANSFER: &str = "/internal/buckets/announce";
/// Finalize ownership of buckets the requester finished pulling.
pub const ENDPOINT_BUCKETS_TRANSFERRED: &str = "/internal/buckets/transferred";
/// Current distribution table.
pub const ENDPOINT_BUCKET_MAP: &str = "/internal/buckets/map";
pub const ENDPOINT_PRESENCE: &str = "/internal/presence";
/// Result of a finished transfer run.
pub const ENDPOINT_TRANSFER_REPORT: &str = "/internal/state_transfer/report";
/// Operator entry point: move buckets to a node and publish the new table.
pub const ENDPOINT_ADMIN_MOVE: &str = "/admin/buckets/move";
/// Installs a published table on a node and starts pulling what it was given.
pub const ENDPOINT_ADMIN_DISTRIBUTION: &str = "/admin/distribution";

// --- Data Transfer Objects ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockBucketsRequest {
    pub requester: NodeId,
    pub buckets: Vec<BucketId>,
}

/// Shared body of release and announce requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketsRequest {
    pub requester: NodeId,
    pub buckets: Vec<BucketId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketsTransferredRequest {
    pub requester: NodeId,
    pub owner: NodeId,
    pub buckets: Vec<BucketId>,
}

/// Full distribution table as published by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionUpdate {
    pub version: u64,
    pub assignments: Vec<BucketAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRequest {
    pub node: NodeId,
    pub in_state_transfer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReport {
    pub node: NodeId,
    pub outcome: TransferOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveBucketsRequest {
    pub bucket_ids: Vec<BucketId>,
    pub to: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveBucketsResponse {
    /// Buckets that were not already on the target node.
    pub planned: Vec<BucketId>,
    pub version: u64,
}

/// Plain acknowledgment.
#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
}
