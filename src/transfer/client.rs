use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::protocol::*;
use super::transport::BucketTransport;
use super::types::TransferUnit;
use crate::cluster::types::{BucketId, NodeId};
use crate::error::TransferError;

/// [`BucketTransport`] over HTTP. Node ids are the peers' HTTP addresses.
///
/// Each call is a single attempt; the driver owns the retry policy.
pub struct HttpTransport {
    local: NodeId,
    http_client: reqwest::Client,
    rpc_timeout: Duration,
}

impl HttpTransport {
    pub fn new(local: NodeId, rpc_timeout: Duration) -> Self {
        Self {
            local,
            http_client: reqwest::Client::new(),
            rpc_timeout,
        }
    }

    async fn post<T: Serialize>(
        &self,
        peer: &NodeId,
        endpoint: &str,
        payload: &T,
    ) -> Result<reqwest::Response, TransferError> {
        let response = self
            .http_client
            .post(format!("http://{}{}", peer, endpoint))
            .json(payload)
            .timeout(self.rpc_timeout)
            .send()
            .await
            .map_err(|e| TransferError::from_request(peer, e))?;

        if !response.status().is_success() {
            return Err(TransferError::from_status(peer, response.status()));
        }
        Ok(response)
    }
}

#[async_trait]
impl BucketTransport for HttpTransport {
    async fn transfer_bucket(
        &self,
        owner: &NodeId,
        request: TransferRequest,
    ) -> Result<TransferUnit, TransferError> {
        let response = self.post(owner, ENDPOINT_TRANSFER_BUCKET, &request).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| TransferError::from_request(owner, e))?;

        decode_unit(&body).map_err(TransferError::fatal)
    }

    async fn ack_transfer_completed(
        &self,
        owner: &NodeId,
        buckets: &[BucketId],
    ) -> Result<(), TransferError> {
        let payload = AckTransferRequest {
            requester: self.local.clone(),
            buckets: buckets.to_vec(),
        };
        self.post(owner, ENDPOINT_ACK_TRANSFER, &payload).await?;
        Ok(())
    }

    async fn signal_end_of_transfer(&self, peer: &NodeId) -> Result<(), TransferError> {
        let payload = EndTransferRequest {
            requester: self.local.clone(),
        };
        self.post(peer, ENDPOINT_END_TRANSFER, &payload).await?;
        Ok(())
    }
}
