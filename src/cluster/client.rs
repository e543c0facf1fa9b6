use super::coordinator::ClusterCoordinator;
use super::distribution::DistributionMap;
use super::protocol::*;
use super::types::{BucketId, BucketStatistics, LockResult, NodeId, TransferOutcome};
use crate::error::TransferError;
use crate::transfer::protocol::ENDPOINT_BUCKET_STATS;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1500);
const CONTROL_ATTEMPTS: usize = 3;

pub(crate) async fn post_with_retry<T: Serialize>(
    client: &reqwest::Client,
    url: String,
    payload: &T,
    timeout: Duration,
    attempts: usize,
) -> Result<reqwest::Response> {
    let mut delay_ms = 150u64;

    for attempt in 0..attempts {
        let response = client
            .post(url.clone())
            .json(payload)
            .timeout(timeout)
            .send()
            .await;

        match response {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                if attempt + 1 == attempts {
                    return Err(anyhow::anyhow!(e));
                }
                let jitter = rand::random::<u64>() % 50;
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(1200);
            }
        }
    }

    Err(anyhow::anyhow!("Retry attempts exhausted"))
}

/// [`ClusterCoordinator`] that talks to the coordinator node over HTTP and
/// keeps the local distribution replica current.
pub struct HttpCoordinator {
    local: NodeId,
    coordinator: SocketAddr,
    distribution: Arc<DistributionMap>,
    http_client: reqwest::Client,
}

impl HttpCoordinator {
    pub fn new(local: NodeId, coordinator: SocketAddr, distribution: Arc<DistributionMap>) -> Self {
        Self {
            local,
            coordinator,
            distribution,
            http_client: reqwest::Client::new(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("http://{}{}", self.coordinator, endpoint)
    }

    async fn post_control<T: Serialize>(&self, endpoint: &str, payload: &T) -> Result<()> {
        let response = post_with_retry(
            &self.http_client,
            self.url(endpoint),
            payload,
            CONTROL_TIMEOUT,
            CONTROL_ATTEMPTS,
        )
        .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("{} failed {}", endpoint, response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterCoordinator for HttpCoordinator {
    async fn determine_cluster_status(&self) -> Result<()> {
        let response = self
            .http_client
            .get(self.url(ENDPOINT_BUCKET_MAP))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Bucket map fetch failed {}", response.status()));
        }

        let update: DistributionUpdate = response.json().await?;
        tracing::debug!("Installing bucket map version {}", update.version);
        self.distribution.install(update.assignments);
        Ok(())
    }

    async fn announce_presence(&self, in_state_transfer: bool) -> Result<()> {
        let payload = PresenceRequest {
            node: self.local.clone(),
            in_state_transfer,
        };
        self.post_control(ENDPOINT_PRESENCE, &payload).await
    }

    async fn lock_buckets(&self, buckets: &[BucketId]) -> Result<LockResult, TransferError> {
        let coordinator = NodeId::from(self.coordinator);
        let payload = LockBucketsRequest {
            requester: self.local.clone(),
            buckets: buckets.to_vec(),
        };

        let response = self
            .http_client
            .post(self.url(ENDPOINT_LOCK_BUCKETS))
            .json(&payload)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|e| TransferError::from_request(&coordinator, e))?;

        if !response.status().is_success() {
            return Err(TransferError::from_status(&coordinator, response.status()));
        }

        response
            .json::<LockResult>()
            .await
            .map_err(TransferError::fatal)
    }

    async fn release_buckets(&self, buckets: &[BucketId]) -> Result<()> {
        let payload = BucketsRequest {
            requester: self.local.clone(),
            buckets: buckets.to_vec(),
        };
        self.post_control(ENDPOINT_RELEASE_BUCKETS, &payload).await
    }

    async fn announce_state_transfer(&self, buckets: &[BucketId]) -> Result<()> {
        let payload = BucketsRequest {
            requester: self.local.clone(),
            buckets: buckets.to_vec(),
        };
        self.post_control(ENDPOINT_ANNOUNCE_TRANSFER, &payload).await
    }

    async fn bucket_statistics(&self, bucket: BucketId, owner: &NodeId) -> Option<BucketStatistics> {
        let url = format!("http://{}{}/{}", owner, ENDPOINT_BUCKET_STATS, bucket);
        let response = match self
            .http_client
            .get(url)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                tracing::debug!("Stats for bucket {} from {}: {}", bucket, owner, resp.status());
                return None;
            }
            Err(e) => {
                tracing::warn!("Could not fetch stats for bucket {} from {}: {}", bucket, owner, e);
                return None;
            }
        };
        response.json().await.ok()
    }

    async fn buckets_transferred(&self, owner: &NodeId, buckets: &[BucketId]) -> Result<()> {
        self.distribution
            .mark_transferred(&self.local, owner, buckets);
        let payload = BucketsTransferredRequest {
            requester: self.local.clone(),
            owner: owner.clone(),
            buckets: buckets.to_vec(),
        };
        self.post_control(ENDPOINT_BUCKETS_TRANSFERRED, &payload).await
    }

    async fn end_state_transfer(&self, outcome: &TransferOutcome) {
        let payload = TransferReport {
            node: self.local.clone(),
            outcome: outcome.clone(),
        };
        if let Err(e) = self.post_control(ENDPOINT_TRANSFER_REPORT, &payload).await {
            tracing::error!("Failed to report end of state transfer: {}", e);
        }
        if let Err(e) = self.announce_presence(false).await {
            tracing::warn!("Failed to announce presence: {}", e);
        }
    }

    fn view_installation_complete(&self) {
        tracing::debug!("View installed on {}", self.local);
    }
}
