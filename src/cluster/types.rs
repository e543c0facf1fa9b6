use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

pub type BucketId = u32;

/// Identity of a cache node. The node binary uses its HTTP address so that an
/// id is directly routable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<SocketAddr> for NodeId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BucketStatus {
    #[default]
    Functional,
    /// Assigned to a new owner that has not pulled its data yet.
    NeedTransfer,
    /// Locked by the new owner; the previous owner is frozen.
    UnderStateTransfer,
}

/// One row of the bucket distribution table.
///
/// `permanent_owner` holds the data today. During a rebalance `temp_owner`
/// names the node that is going to pull it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketAssignment {
    pub bucket_id: BucketId,
    pub permanent_owner: Option<NodeId>,
    pub temp_owner: Option<NodeId>,
    pub status: BucketStatus,
}

impl BucketAssignment {
    pub fn owned_by(bucket_id: BucketId, owner: NodeId) -> Self {
        Self {
            bucket_id,
            permanent_owner: Some(owner.clone()),
            temp_owner: Some(owner),
            status: BucketStatus::Functional,
        }
    }

    /// True when `node` is the temporary owner and someone else still holds the data.
    pub fn needs_transfer_to(&self, node: &NodeId) -> bool {
        self.temp_owner.as_ref() == Some(node)
            && self.permanent_owner.is_some()
            && self.permanent_owner.as_ref() != Some(node)
    }

    pub fn is_assigned_to(&self, node: &NodeId) -> bool {
        self.temp_owner.as_ref() == Some(node)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BucketStatistics {
    pub count: u64,
    pub data_size: u64,
    pub topic_message_count: u64,
}

/// Answer of the lock service for one lock request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LockResult {
    /// Buckets the requester no longer has any claim on.
    pub owner_changed: Vec<BucketId>,
    pub lock_acquired: Vec<BucketId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum TransferType {
    /// The source drops the bucket once the destination has it.
    #[default]
    Move,
    /// The source keeps its copy; no operation logging.
    Replicate,
}

/// Result a transfer run reports to the membership layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { local_count: u64 },
    Cancelled,
    Failed(String),
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { local_count } => write!(f, "completed ({} local items)", local_count),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}
