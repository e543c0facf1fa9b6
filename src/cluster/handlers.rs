use axum::{Json, extract::Extension, http::StatusCode};
use std::sync::Arc;

use super::protocol::{
    AckResponse, BucketsRequest, BucketsTransferredRequest, DistributionUpdate, LockBucketsRequest,
    MoveBucketsRequest, MoveBucketsResponse, PresenceRequest, TransferReport,
};
use super::service::CoordinatorService;
use super::types::LockResult;

pub async fn handle_lock_buckets(
    Extension(service): Extension<Arc<CoordinatorService>>,
    Json(req): Json<LockBucketsRequest>,
) -> (StatusCode, Json<LockResult>) {
    let result = service.lock(&req.requester, &req.buckets);
    (StatusCode::OK, Json(result))
}

pub async fn handle_release_buckets(
    Extension(service): Extension<Arc<CoordinatorService>>,
    Json(req): Json<BucketsRequest>,
) -> (StatusCode, Json<AckResponse>) {
    service.release(&req.requester, &req.buckets);
    publish_in_background(service);
    (StatusCode::OK, Json(AckResponse { success: true }))
}

pub async fn handle_announce_transfer(
    Extension(service): Extension<Arc<CoordinatorService>>,
    Json(req): Json<BucketsRequest>,
) -> (StatusCode, Json<AckResponse>) {
    service.announce(&req.requester, &req.buckets);
    (StatusCode::OK, Json(AckResponse { success: true }))
}

pub async fn handle_buckets_transferred(
    Extension(service): Extension<Arc<CoordinatorService>>,
    Json(req): Json<BucketsTransferredRequest>,
) -> (StatusCode, Json<AckResponse>) {
    service.transferred(&req.requester, &req.owner, &req.buckets);
    (StatusCode::OK, Json(AckResponse { success: true }))
}

pub async fn handle_bucket_map(
    Extension(service): Extension<Arc<CoordinatorService>>,
) -> (StatusCode, Json<DistributionUpdate>) {
    (StatusCode::OK, Json(service.snapshot()))
}

pub async fn handle_presence(
    Extension(service): Extension<Arc<CoordinatorService>>,
    Json(req): Json<PresenceRequest>,
) -> (StatusCode, Json<AckResponse>) {
    service.set_presence(req.node, req.in_state_transfer);
    (StatusCode::OK, Json(AckResponse { success: true }))
}

pub async fn handle_transfer_report(
    Extension(service): Extension<Arc<CoordinatorService>>,
    Json(req): Json<TransferReport>,
) -> (StatusCode, Json<AckResponse>) {
    service.record_report(req.node, req.outcome);
    (StatusCode::OK, Json(AckResponse { success: true }))
}

pub async fn handle_move_buckets(
    Extension(service): Extension<Arc<CoordinatorService>>,
    Json(req): Json<MoveBucketsRequest>,
) -> (StatusCode, Json<MoveBucketsResponse>) {
    if !service.members().contains(&req.to) {
        tracing::error!("Refusing to move buckets to unknown node {}", req.to);
        return (
            StatusCode::BAD_REQUEST,
            Json(MoveBucketsResponse {
                planned: Vec::new(),
                version: service.distribution().version(),
            }),
        );
    }

    let planned = service.move_buckets(&req.bucket_ids, &req.to);
    let version = service.distribution().version();
    if !planned.is_empty() {
        publish_in_background(service);
    }
    (StatusCode::OK, Json(MoveBucketsResponse { planned, version }))
}

fn publish_in_background(service: Arc<CoordinatorService>) {
    tokio::spawn(async move {
        service.publish().await;
    });
}
