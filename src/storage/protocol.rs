//! Client Cache Protocol
//!
//! Endpoints and DTOs for the client-facing cache operations served by every node.

use crate::cluster::types::NodeId;
use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// Public endpoint for client write requests.
pub const ENDPOINT_PUT: &str = "/put";
/// Public endpoint for client read requests.
pub const ENDPOINT_GET: &str = "/get";
/// Public endpoint for publishing a message on a topic.
pub const ENDPOINT_PUBLISH: &str = "/publish";
/// Local keys visible to queries.
pub const ENDPOINT_QUERY: &str = "/query";

// --- Data Transfer Objects ---

#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
    /// Absolute expiry in milliseconds since the epoch.
    #[serde(default)]
    pub expires_at_ms: Option<u64>,
}

/// Acknowledgment for writes. When the node does not own the key, `owner`
/// tells the client where to go instead.
#[derive(Debug, Serialize, Deserialize)]
pub struct PutResponse {
    pub success: bool,
    pub owner: Option<NodeId>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetResponse {
    pub value: Option<String>,
    pub version: Option<u64>,
    pub owner: Option<NodeId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    pub message_id: String,
    pub payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub keys: Vec<String>,
}
