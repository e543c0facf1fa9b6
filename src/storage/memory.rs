use super::CacheStore;
use super::oplog::OperationLogger;
use super::types::{CacheEntry, FilterKind, InsertResult, LogTable, MessageOperation, TopicMessage, now_ms};
use crate::cluster::distribution::bucket_for_key;
use crate::cluster::types::{BucketId, BucketStatistics};
use crate::error::StoreError;

use dashmap::{DashMap, DashSet};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

type TopicMessages = BTreeMap<String, BTreeMap<String, TopicMessage>>;

/// In-memory, bucket-partitioned cache store.
///
/// Entries live in `DashMap<bucket, DashMap<key, entry>>`; topic messages are
/// placed in the bucket of their message id.
pub struct BucketStore {
    bucket_count: u32,
    data: DashMap<BucketId, DashMap<String, CacheEntry>>,
    messages: DashMap<BucketId, TopicMessages>,
    oplog: OperationLogger,
    filters: DashSet<(BucketId, FilterKind)>,
    capacity_bytes: Option<u64>,
    used_bytes: AtomicU64,
}

impl BucketStore {
    pub fn new(bucket_count: u32) -> Self {
        Self {
            bucket_count,
            data: DashMap::new(),
            messages: DashMap::new(),
            oplog: OperationLogger::new(),
            filters: DashSet::new(),
            capacity_bytes: None,
            used_bytes: AtomicU64::new(0),
        }
    }

    pub fn with_capacity(bucket_count: u32, capacity_bytes: Option<u64>) -> Self {
        Self {
            capacity_bytes,
            ..Self::new(bucket_count)
        }
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    pub fn bucket_of(&self, key: &str) -> BucketId {
        bucket_for_key(key, self.bucket_count)
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    pub fn is_frozen(&self, bucket: BucketId) -> bool {
        self.oplog.is_frozen(bucket)
    }

    pub fn is_logging(&self, bucket: BucketId) -> bool {
        self.oplog.is_logging(bucket)
    }

    pub fn is_filtered(&self, bucket: BucketId) -> bool {
        self.filters.contains(&(bucket, FilterKind::Query))
            || self.filters.contains(&(bucket, FilterKind::Compound))
    }

    /// Buckets that currently hold at least one entry or message.
    pub fn local_buckets(&self) -> Vec<BucketId> {
        let mut buckets: Vec<BucketId> = self
            .data
            .iter()
            .filter(|partition| !partition.value().is_empty())
            .map(|partition| *partition.key())
            .chain(
                self.messages
                    .iter()
                    .filter(|topics| !topics.value().is_empty())
                    .map(|topics| *topics.key()),
            )
            .collect();
        buckets.sort_unstable();
        buckets.dedup();
        buckets
    }

    /// Live keys starting with `prefix`, skipping buckets hidden by a filter.
    pub fn query_keys(&self, prefix: &str) -> Vec<String> {
        let now = now_ms();
        let mut keys = Vec::new();
        for partition in self.data.iter() {
            if self.is_filtered(*partition.key()) {
                continue;
            }
            for entry in partition.value().iter() {
                if entry.key().starts_with(prefix) && !entry.value().is_expired(now) {
                    keys.push(entry.key().clone());
                }
            }
        }
        keys.sort();
        keys
    }

    fn message_bucket(message_id: &str, bucket_count: u32) -> BucketId {
        bucket_for_key(message_id, bucket_count)
    }

    fn release_bytes(&self, bytes: u64) {
        let _ = self
            .used_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

impl CacheStore for BucketStore {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        let bucket = self.bucket_of(key);
        let partition = self.data.get(&bucket)?;
        let entry = partition.get(key)?;
        if entry.is_expired(now_ms()) {
            return None;
        }
        Some(entry.clone())
    }

    fn insert(
        &self,
        key: &str,
        mut entry: CacheEntry,
        preserve_version: bool,
    ) -> Result<InsertResult, StoreError> {
        let bucket = self.bucket_of(key);
        let mut guard = self.oplog.write_guard(bucket)?;

        let partition = self.data.entry(bucket).or_default();
        let previous = partition
            .get(key)
            .map(|existing| (existing.size_with_key(key), existing.version));

        if !preserve_version {
            entry.version = previous.map(|(_, version)| version + 1).unwrap_or(1);
        }
        let size = entry.size_with_key(key);
        let previous_size = previous.map(|(size, _)| size).unwrap_or(0);

        if let Some(capacity) = self.capacity_bytes {
            let projected = self.used_bytes().saturating_sub(previous_size) + size;
            if projected > capacity {
                tracing::debug!("Insert of {} rejected, store at capacity", key);
                return Ok(InsertResult::NeedsEviction);
            }
        }

        let replaced = partition.insert(key.to_string(), entry).is_some();
        drop(partition);

        self.used_bytes.fetch_add(size, Ordering::SeqCst);
        self.release_bytes(previous_size);
        guard.log_insert(key);

        Ok(if replaced {
            InsertResult::SuccessOverwrite
        } else {
            InsertResult::Success
        })
    }

    fn remove(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let bucket = self.bucket_of(key);
        let mut guard = self.oplog.write_guard(bucket)?;

        let removed = self
            .data
            .get(&bucket)
            .and_then(|partition| partition.remove(key))
            .map(|(_, entry)| entry);

        if let Some(entry) = &removed {
            self.release_bytes(entry.size_with_key(key));
        }
        guard.log_remove(key);
        Ok(removed)
    }

    fn key_list(&self, bucket: BucketId, enable_logging: bool) -> Vec<String> {
        if enable_logging {
            self.oplog.start_logging(bucket);
        }
        let mut keys: Vec<String> = self
            .data
            .get(&bucket)
            .map(|partition| partition.iter().map(|entry| entry.key().clone()).collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn message_list(&self, bucket: BucketId) -> Vec<(String, Vec<String>)> {
        self.messages
            .get(&bucket)
            .map(|topics| {
                topics
                    .iter()
                    .filter(|(_, messages)| !messages.is_empty())
                    .map(|(topic, messages)| (topic.clone(), messages.keys().cloned().collect()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn get_message(&self, topic: &str, message_id: &str) -> Option<TopicMessage> {
        let bucket = Self::message_bucket(message_id, self.bucket_count);
        self.messages
            .get(&bucket)?
            .get(topic)?
            .get(message_id)
            .cloned()
    }

    fn store_message(&self, topic: &str, message: TopicMessage) -> Result<(), StoreError> {
        let bucket = Self::message_bucket(&message.id, self.bucket_count);
        let mut guard = self.oplog.write_guard(bucket)?;

        self.messages
            .entry(bucket)
            .or_default()
            .entry(topic.to_string())
            .or_default()
            .insert(message.id.clone(), message.clone());

        guard.log_message(MessageOperation::Store {
            topic: topic.to_string(),
            message,
        });
        Ok(())
    }

    fn remove_message(&self, topic: &str, message_id: &str) -> Result<(), StoreError> {
        let bucket = Self::message_bucket(message_id, self.bucket_count);
        let mut guard = self.oplog.write_guard(bucket)?;

        if let Some(mut topics) = self.messages.get_mut(&bucket)
            && let Some(messages) = topics.get_mut(topic)
        {
            messages.remove(message_id);
            if messages.is_empty() {
                topics.remove(topic);
            }
        }

        guard.log_message(MessageOperation::Remove {
            topic: topic.to_string(),
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    fn log_table(&self, buckets: &[BucketId], stop_threshold: usize) -> Option<LogTable> {
        self.oplog.drain(buckets, stop_threshold)
    }

    fn remove_log(&self, bucket: BucketId) {
        self.oplog.remove_log(bucket);
    }

    fn start_filtering(&self, bucket: BucketId, kind: FilterKind) {
        self.filters.insert((bucket, kind));
    }

    fn stop_filtering(&self, buckets: &[BucketId], kind: FilterKind) {
        for bucket in buckets {
            self.filters.remove(&(*bucket, kind));
        }
    }

    fn empty_bucket(&self, bucket: BucketId) {
        if let Some((_, partition)) = self.data.remove(&bucket) {
            let freed: u64 = partition
                .iter()
                .map(|entry| entry.value().size_with_key(entry.key()))
                .sum();
            self.release_bytes(freed);
            tracing::debug!("Emptied bucket {} ({} entries)", bucket, partition.len());
        }
        self.messages.remove(&bucket);
    }

    fn compact(&self) {
        self.data.retain(|_, partition| !partition.is_empty());
        for partition in self.data.iter() {
            partition.value().shrink_to_fit();
        }
        self.data.shrink_to_fit();
        self.messages.retain(|_, topics| !topics.is_empty());
        self.messages.shrink_to_fit();
    }

    fn bucket_statistics(&self, bucket: BucketId) -> BucketStatistics {
        let mut stats = BucketStatistics::default();
        if let Some(partition) = self.data.get(&bucket) {
            stats.count = partition.len() as u64;
            stats.data_size = partition
                .iter()
                .map(|entry| entry.value().size_with_key(entry.key()))
                .sum();
        }
        if let Some(topics) = self.messages.get(&bucket) {
            stats.topic_message_count = topics.values().map(|messages| messages.len() as u64).sum();
        }
        stats
    }

    fn count(&self) -> u64 {
        self.data
            .iter()
            .map(|partition| partition.value().len() as u64)
            .sum()
    }
}
