//! Bucket Storage Module
//!
//! The local cache store as the state-transfer subsystem sees it.
//!
//! ## Core Concepts
//! - **Buckets**: Entries and topic messages are grouped by bucket so a whole bucket can be listed, moved or dropped.
//! - **Operation log**: While a bucket is being handed over, writes to it are recorded (`OperationLogger`) and replayed to the new owner.
//! - **Freeze**: Once the log goes quiet the bucket rejects writes until the new owner acknowledges it.
//! - **Filtering**: Buckets in flight are hidden from local queries on both sides of a transfer.

pub mod handlers;
pub mod memory;
pub mod oplog;
pub mod protocol;
pub mod types;


use crate::cluster::types::{BucketId, BucketStatistics};
use crate::error::StoreError;
use types::{CacheEntry, FilterKind, InsertResult, LogTable, TopicMessage};

/// Storage operations consumed by the transfer driver and the corresponder.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Writes `entry`. With `preserve_version` the entry keeps the version it
    /// carries; otherwise the store assigns the next one.
    fn insert(
        &self,
        key: &str,
        entry: CacheEntry,
        preserve_version: bool,
    ) -> Result<InsertResult, StoreError>;

    fn remove(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Keys of `bucket`, sorted. With `enable_logging` the bucket starts
    /// recording mutations from this point on.
    fn key_list(&self, bucket: BucketId, enable_logging: bool) -> Vec<String>;

    /// Message ids of `bucket`, grouped by topic.
    fn message_list(&self, bucket: BucketId) -> Vec<(String, Vec<String>)>;

    fn get_message(&self, topic: &str, message_id: &str) -> Option<TopicMessage>;

    fn store_message(&self, topic: &str, message: TopicMessage) -> Result<(), StoreError>;

    fn remove_message(&self, topic: &str, message_id: &str) -> Result<(), StoreError>;

    fn log_table(&self, buckets: &[BucketId], stop_threshold: usize) -> Option<LogTable>;

    fn remove_log(&self, bucket: BucketId);

    fn start_filtering(&self, bucket: BucketId, kind: FilterKind);

    fn stop_filtering(&self, buckets: &[BucketId], kind: FilterKind);

    /// Drops all entries and messages of `bucket`.
    fn empty_bucket(&self, bucket: BucketId);

    /// Releases memory held by dropped data.
    fn compact(&self);

    fn bucket_statistics(&self, bucket: BucketId) -> BucketStatistics;

    fn count(&self) -> u64;
}
