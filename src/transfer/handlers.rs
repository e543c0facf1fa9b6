use axum::{
    Json,
    extract::{Extension, Path},
    http::{StatusCode, header},
};
use std::sync::Arc;

use super::protocol::{
    AckTransferRequest, EndTransferRequest, StateTransferResponse, TRANSFER_UNIT_CONTENT_TYPE,
    TransferRequest, encode_unit,
};
use super::source::TransferSource;
use super::task::StateTransferTask;
use crate::cluster::distribution::DistributionMap;
use crate::cluster::protocol::{AckResponse, DistributionUpdate};
use crate::cluster::types::{BucketAssignment, BucketId, BucketStatistics};

/// Both halves of the transfer protocol as one node runs them.
pub struct TransferContext {
    pub source: Arc<TransferSource>,
    pub driver: Arc<StateTransferTask>,
    pub distribution: Arc<DistributionMap>,
}

type UnitResponse = (StatusCode, [(header::HeaderName, &'static str); 1], Vec<u8>);

pub async fn handle_transfer_bucket(
    Extension(ctx): Extension<Arc<TransferContext>>,
    Json(req): Json<TransferRequest>,
) -> UnitResponse {
    let unit = ctx.source.transfer_bucket(req).await;
    let content_type = [(header::CONTENT_TYPE, TRANSFER_UNIT_CONTENT_TYPE)];

    match encode_unit(&unit) {
        Ok(body) => (StatusCode::OK, content_type, body),
        Err(e) => {
            tracing::error!("Failed to encode transfer unit: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, content_type, Vec::new())
        }
    }
}

pub async fn handle_ack_transfer(
    Extension(ctx): Extension<Arc<TransferContext>>,
    Json(req): Json<AckTransferRequest>,
) -> (StatusCode, Json<AckResponse>) {
    ctx.source
        .ack_transfer_completed(&req.requester, &req.buckets)
        .await;
    (StatusCode::OK, Json(AckResponse { success: true }))
}

pub async fn handle_end_transfer(
    Extension(ctx): Extension<Arc<TransferContext>>,
    Json(req): Json<EndTransferRequest>,
) -> (StatusCode, Json<AckResponse>) {
    ctx.source.end_of_transfer(&req.requester).await;
    (StatusCode::OK, Json(AckResponse { success: true }))
}

pub async fn handle_bucket_stats(
    Extension(ctx): Extension<Arc<TransferContext>>,
    Path(bucket): Path<BucketId>,
) -> (StatusCode, Json<BucketStatistics>) {
    (StatusCode::OK, Json(ctx.source.bucket_statistics(bucket)))
}

/// Starts a transfer for an explicit view, bypassing the coordinator.
pub async fn handle_state_transfer(
    Extension(ctx): Extension<Arc<TransferContext>>,
    Json(assignments): Json<Vec<BucketAssignment>>,
) -> (StatusCode, Json<StateTransferResponse>) {
    let update_id = ctx.driver.do_state_transfer(assignments);
    (StatusCode::ACCEPTED, Json(StateTransferResponse { update_id }))
}

/// New view pushed by the coordinator.
pub async fn handle_distribution(
    Extension(ctx): Extension<Arc<TransferContext>>,
    Json(update): Json<DistributionUpdate>,
) -> (StatusCode, Json<StateTransferResponse>) {
    tracing::debug!("Received bucket map version {}", update.version);
    ctx.distribution.install(update.assignments);
    let update_id = ctx.driver.do_state_transfer(ctx.distribution.assignments());
    (StatusCode::ACCEPTED, Json(StateTransferResponse { update_id }))
}
