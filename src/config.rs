//! Node and state-transfer configuration.
//!
//! Every field has a default so a node can start with no configuration file at
//! all. When a file is given it is JSON, and only the fields it names override
//! the defaults.

use crate::cluster::types::TransferType;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

pub const DEFAULT_BUCKET_COUNT: u32 = 1000;

/// Tuning knobs for both sides of a bucket transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateTransferConfig {
    /// Maximum bytes a corresponder packs into one chunk.
    pub chunk_threshold: u64,
    /// Buckets whose data size is below this are classified as sparsed.
    pub sparse_threshold: u64,
    /// Transfer a whole sparsed pack in one request instead of bucket by bucket.
    pub allow_bulk_in_sparsed: bool,
    /// Receive-side budget; 0 disables throttling.
    pub bytes_per_second: u64,
    /// Attempts per chunk request before a timeout is surfaced.
    pub bucket_transfer_retries: u32,
    /// Attempts at locking a bucket set with the coordinator.
    pub lock_attempts: u32,
    /// Pause before a bucket whose lock or transfer failed is picked up again.
    pub lock_retry_backoff_ms: u64,
    /// How long to wait for membership to name a new owner after suspicion.
    pub owner_change_timeout_ms: u64,
    /// Consecutive suspicions of an unchanged owner before the bucket is abandoned.
    pub max_resync_attempts: u32,
    /// Compact the local store after this many received bytes.
    pub gc_threshold_bytes: Option<u64>,
    /// A synchronization replica deletes keys it failed to apply.
    pub is_sync_replica: bool,
    pub transfer_type: TransferType,
    pub rpc_timeout_ms: u64,
    /// Logged operations below this count mean the bucket is quiescent.
    pub stop_logging_threshold: usize,
}

impl Default for StateTransferConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: 20 * KB,
            sparse_threshold: 20 * KB,
            allow_bulk_in_sparsed: true,
            bytes_per_second: 5 * MB,
            bucket_transfer_retries: 3,
            lock_attempts: 3,
            lock_retry_backoff_ms: 200,
            owner_change_timeout_ms: 30_000,
            max_resync_attempts: 5,
            gc_threshold_bytes: None,
            is_sync_replica: false,
            transfer_type: TransferType::Move,
            rpc_timeout_ms: 5_000,
            stop_logging_threshold: 50,
        }
    }
}

impl StateTransferConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn lock_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_retry_backoff_ms)
    }

    pub fn owner_change_timeout(&self) -> Duration {
        Duration::from_millis(self.owner_change_timeout_ms)
    }
}

/// Everything the node binary needs to come up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the HTTP server binds; also this node's identity in the cluster.
    pub bind: SocketAddr,
    /// Node that owns the bucket table and hands out bucket locks.
    pub coordinator: Option<SocketAddr>,
    /// Other cache nodes, used by the coordinator to publish distribution changes.
    pub peers: Vec<SocketAddr>,
    pub bucket_count: u32,
    /// Memory cap for the local store; inserts beyond it report eviction pressure.
    pub capacity_bytes: Option<u64>,
    /// Mirror nodes always move data, even when replication was requested.
    pub started_as_mirror: bool,
    pub state_transfer: StateTransferConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 6000)),
            coordinator: None,
            peers: Vec::new(),
            bucket_count: DEFAULT_BUCKET_COUNT,
            capacity_bytes: None,
            started_as_mirror: false,
            state_transfer: StateTransferConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// The coordinator defaults to this node when none is configured.
    pub fn coordinator_addr(&self) -> SocketAddr {
        self.coordinator.unwrap_or(self.bind)
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator_addr() == self.bind
    }
}
