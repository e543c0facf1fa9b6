//! Error types shared by the state-transfer protocol and the local store.
//!
//! The driver's retry policy matches on [`TransferError`] variants: timeouts are
//! retried a bounded number of times, suspicion triggers owner resync, and
//! anything fatal ends the current transfer run.

use crate::cluster::types::{BucketId, NodeId};

/// Failure of a single remote call made while moving bucket data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// The peer did not answer within the RPC timeout.
    #[error("request to {peer} timed out")]
    Timeout { peer: NodeId },

    /// The failure detector (or the transport) considers the peer gone.
    #[error("peer {peer} is suspected")]
    PeerSuspected { peer: NodeId },

    /// Anything else: decoding failures, unexpected statuses, internal errors.
    #[error("state transfer failed: {0}")]
    Fatal(String),
}

impl TransferError {
    pub fn fatal(err: impl std::fmt::Display) -> Self {
        Self::Fatal(err.to_string())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_suspected(&self) -> bool {
        matches!(self, Self::PeerSuspected { .. })
    }

    /// Classifies a failed HTTP call to `peer`.
    pub fn from_request(peer: &NodeId, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout { peer: peer.clone() };
        }
        if err.is_connect() || is_connection_lost(&err) {
            return Self::PeerSuspected { peer: peer.clone() };
        }
        Self::fatal(err)
    }

    /// Classifies a non-success HTTP status returned by `peer`.
    pub fn from_status(peer: &NodeId, status: reqwest::StatusCode) -> Self {
        match status {
            reqwest::StatusCode::REQUEST_TIMEOUT | reqwest::StatusCode::GATEWAY_TIMEOUT => {
                Self::Timeout { peer: peer.clone() }
            }
            status => Self::Fatal(format!("{} answered {}", peer, status)),
        }
    }
}

fn is_connection_lost(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>()
            && matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            )
        {
            return true;
        }
        source = inner.source();
    }
    false
}

/// Rejections raised by the bucket store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Writes are blocked while a bucket's final logged operations are handed over.
    #[error("bucket {0} is frozen for state transfer")]
    BucketFrozen(BucketId),
}
