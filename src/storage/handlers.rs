use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use std::sync::Arc;

use super::CacheStore;
use super::memory::BucketStore;
use super::protocol::{GetResponse, PublishRequest, PutRequest, PutResponse, QueryResponse};
use super::types::{CacheEntry, InsertResult, TopicMessage};
use crate::cluster::coordinator::OwnershipOracle;
use crate::cluster::types::NodeId;
use crate::error::StoreError;

/// What the client-facing handlers need: the local store and a way to tell
/// whether a key belongs here.
pub struct StorageContext {
    pub store: Arc<BucketStore>,
    pub oracle: Arc<dyn OwnershipOracle>,
    pub local: NodeId,
}

impl StorageContext {
    fn foreign_owner(&self, key: &str) -> Option<NodeId> {
        self.oracle
            .select_node(key)
            .filter(|owner| owner != &self.local)
    }
}

pub async fn handle_put(
    Extension(ctx): Extension<Arc<StorageContext>>,
    Json(req): Json<PutRequest>,
) -> (StatusCode, Json<PutResponse>) {
    if let Some(owner) = ctx.foreign_owner(&req.key) {
        return (
            StatusCode::MISDIRECTED_REQUEST,
            Json(PutResponse {
                success: false,
                owner: Some(owner),
                error: None,
            }),
        );
    }

    let mut entry = CacheEntry::new(req.value.into_bytes());
    entry.expires_at_ms = req.expires_at_ms;

    match ctx.store.insert(&req.key, entry, false) {
        Ok(InsertResult::NeedsEviction) => (
            StatusCode::INSUFFICIENT_STORAGE,
            Json(PutResponse {
                success: false,
                owner: None,
                error: Some("store is full".to_string()),
            }),
        ),
        Ok(_) => (
            StatusCode::OK,
            Json(PutResponse {
                success: true,
                owner: None,
                error: None,
            }),
        ),
        Err(e @ StoreError::BucketFrozen(_)) => {
            tracing::debug!("PUT {} rejected: {}", req.key, e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(PutResponse {
                    success: false,
                    owner: None,
                    error: Some(e.to_string()),
                }),
            )
        }
        Err(e) => {
            tracing::error!("Failed to put: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PutResponse {
                    success: false,
                    owner: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_get(
    Extension(ctx): Extension<Arc<StorageContext>>,
    Path(key): Path<String>,
) -> (StatusCode, Json<GetResponse>) {
    match ctx.store.get(&key) {
        Some(entry) => (
            StatusCode::OK,
            Json(GetResponse {
                value: Some(String::from_utf8_lossy(&entry.value).into_owned()),
                version: Some(entry.version),
                owner: None,
            }),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(GetResponse {
                value: None,
                version: None,
                owner: ctx.foreign_owner(&key),
            }),
        ),
    }
}

pub async fn handle_publish(
    Extension(ctx): Extension<Arc<StorageContext>>,
    Json(req): Json<PublishRequest>,
) -> (StatusCode, Json<PutResponse>) {
    let message = TopicMessage::new(req.message_id, req.payload.into_bytes());

    match ctx.store.store_message(&req.topic, message) {
        Ok(()) => (
            StatusCode::OK,
            Json(PutResponse {
                success: true,
                owner: None,
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!("Publish on {} rejected: {}", req.topic, e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(PutResponse {
                    success: false,
                    owner: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_query(
    Extension(ctx): Extension<Arc<StorageContext>>,
    Path(prefix): Path<String>,
) -> (StatusCode, Json<QueryResponse>) {
    let keys = ctx.store.query_keys(&prefix);
    (StatusCode::OK, Json(QueryResponse { keys }))
}
