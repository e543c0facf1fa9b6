use super::types::{LogTable, MessageOperation};
use crate::cluster::types::BucketId;
use crate::error::StoreError;

use dashmap::DashMap;
use dashmap::mapref::one::RefMut;

#[derive(Debug, Default)]
struct BucketLog {
    updated: Vec<String>,
    removed: Vec<String>,
    message_ops: Vec<MessageOperation>,
    logging: bool,
    frozen: bool,
}

impl BucketLog {
    fn drain(&mut self) -> LogTable {
        LogTable {
            updated: std::mem::take(&mut self.updated),
            removed: std::mem::take(&mut self.removed),
            message_ops: std::mem::take(&mut self.message_ops),
            logging_stopped: false,
        }
    }
}

/// Per-bucket record of mutations made while a bucket is being handed over.
///
/// A key appears at most once, in `updated` or in `removed`, whichever
/// happened last. Once a drain comes back small the bucket stops logging and
/// is frozen until its log is removed.
#[derive(Debug, Default)]
pub struct OperationLogger {
    logs: DashMap<BucketId, BucketLog>,
}

/// Held across one write to a bucket so the write and its log record cannot
/// be split by a concurrent drain.
pub struct WriteGuard<'a> {
    log: Option<RefMut<'a, BucketId, BucketLog>>,
}

impl WriteGuard<'_> {
    pub fn log_insert(&mut self, key: &str) {
        if let Some(log) = self.log.as_mut()
            && log.logging
        {
            log.removed.retain(|k| k != key);
            if !log.updated.iter().any(|k| k == key) {
                log.updated.push(key.to_string());
            }
        }
    }

    pub fn log_remove(&mut self, key: &str) {
        if let Some(log) = self.log.as_mut()
            && log.logging
        {
            log.updated.retain(|k| k != key);
            if !log.removed.iter().any(|k| k == key) {
                log.removed.push(key.to_string());
            }
        }
    }

    pub fn log_message(&mut self, op: MessageOperation) {
        if let Some(log) = self.log.as_mut()
            && log.logging
        {
            log.message_ops.push(op);
        }
    }
}

impl OperationLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_logging(&self, bucket: BucketId) {
        let mut log = self.logs.entry(bucket).or_default();
        if !log.frozen {
            log.logging = true;
        }
    }

    pub fn is_logging(&self, bucket: BucketId) -> bool {
        self.logs
            .get(&bucket)
            .map(|log| log.logging)
            .unwrap_or(false)
    }

    pub fn is_frozen(&self, bucket: BucketId) -> bool {
        self.logs
            .get(&bucket)
            .map(|log| log.frozen)
            .unwrap_or(false)
    }

    /// Fails with [`StoreError::BucketFrozen`] when the bucket no longer accepts writes.
    pub fn write_guard(&self, bucket: BucketId) -> Result<WriteGuard<'_>, StoreError> {
        let log = self.logs.get_mut(&bucket);
        if let Some(log) = &log
            && log.frozen
        {
            return Err(StoreError::BucketFrozen(bucket));
        }
        Ok(WriteGuard { log })
    }

    /// Takes everything logged for `buckets`. Returns `None` when none of them
    /// has a log at all.
    ///
    /// When the drained total is under `stop_threshold` every bucket is frozen.
    /// The freeze takes whatever was logged since the first pass under the
    /// same bucket lock, so a write either lands in the table or is refused.
    pub fn drain(&self, buckets: &[BucketId], stop_threshold: usize) -> Option<LogTable> {
        let mut table = LogTable::default();
        let mut found = false;

        for bucket in buckets {
            if let Some(mut log) = self.logs.get_mut(bucket) {
                found = true;
                table.absorb(log.drain());
            }
        }

        if !found {
            return None;
        }

        if table.len() < stop_threshold.max(1) {
            for bucket in buckets {
                if let Some(mut log) = self.logs.get_mut(bucket) {
                    table.absorb(log.drain());
                    log.logging = false;
                    log.frozen = true;
                }
            }
            table.logging_stopped = true;
        }

        Some(table)
    }

    /// Discards the log and lifts the freeze.
    pub fn remove_log(&self, bucket: BucketId) {
        self.logs.remove(&bucket);
    }
}
