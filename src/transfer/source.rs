use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::corresponder::{Corresponder, CorresponderSettings};
use super::protocol::TransferRequest;
use super::types::TransferUnit;
use crate::cluster::coordinator::OwnershipOracle;
use crate::cluster::types::{BucketId, BucketStatistics, NodeId, TransferType};
use crate::config::StateTransferConfig;
use crate::storage::CacheStore;
use crate::storage::types::FilterKind;

/// Serves bucket data to the nodes pulling from this one, one
/// [`Corresponder`] per requester.
pub struct TransferSource {
    local: NodeId,
    store: Arc<dyn CacheStore>,
    oracle: Arc<dyn OwnershipOracle>,
    settings: CorresponderSettings,
    corresponders: DashMap<NodeId, Arc<Mutex<Corresponder>>>,
}

impl TransferSource {
    pub fn new(
        local: NodeId,
        store: Arc<dyn CacheStore>,
        oracle: Arc<dyn OwnershipOracle>,
        config: &StateTransferConfig,
        started_as_mirror: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            store,
            oracle,
            settings: CorresponderSettings {
                chunk_threshold: config.chunk_threshold,
                stop_logging_threshold: config.stop_logging_threshold,
                started_as_mirror,
            },
            corresponders: DashMap::new(),
        })
    }

    fn corresponder(&self, requester: &NodeId, transfer_type: TransferType) -> Arc<Mutex<Corresponder>> {
        self.corresponders
            .entry(requester.clone())
            .or_insert_with(|| {
                tracing::info!("{} opening corresponder for {}", self.local, requester);
                Arc::new(Mutex::new(Corresponder::new(
                    requester.clone(),
                    Arc::clone(&self.store),
                    Arc::clone(&self.oracle),
                    self.settings,
                    transfer_type,
                )))
            })
            .clone()
    }

    pub async fn transfer_bucket(&self, request: TransferRequest) -> TransferUnit {
        let corresponder = self.corresponder(&request.requester, request.transfer_type);
        let mut corresponder = corresponder.lock().await;
        corresponder.transfer_bucket(
            &request.bucket_ids,
            request.sparsed,
            request.expected_transfer_id,
        )
    }

    /// The requester has applied `buckets`. In move mode the local copy goes away.
    pub async fn ack_transfer_completed(&self, requester: &NodeId, buckets: &[BucketId]) {
        let transfer_type = match self.corresponders.get(requester).map(|c| Arc::clone(&c)) {
            Some(corresponder) => {
                let mut corresponder = corresponder.lock().await;
                corresponder.forget_buckets(buckets);
                corresponder.transfer_type()
            }
            None => TransferType::Move,
        };

        if transfer_type == TransferType::Move {
            for bucket in buckets {
                self.store.empty_bucket(*bucket);
                self.store.remove_log(*bucket);
            }
            self.store.stop_filtering(buckets, FilterKind::Compound);
            tracing::info!(
                "{} acknowledged buckets {:?}; local copies dropped",
                requester,
                buckets
            );
        } else {
            self.store.stop_filtering(buckets, FilterKind::Compound);
        }
    }

    pub async fn end_of_transfer(&self, requester: &NodeId) {
        if let Some((_, corresponder)) = self.corresponders.remove(requester) {
            corresponder.lock().await.dispose();
        }
    }

    pub fn bucket_statistics(&self, bucket: BucketId) -> BucketStatistics {
        self.store.bucket_statistics(bucket)
    }
}
