use crate::cluster::types::{BucketId, NodeId};
use crate::storage::types::{CacheEntry, MessageOperation, TopicMessage};

use serde::{Deserialize, Serialize};

/// Buckets scheduled for transfer from one owner, in the order they were queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketsPack {
    pub owner: NodeId,
    pub bucket_ids: Vec<BucketId>,
}

impl BucketsPack {
    pub fn new(owner: NodeId) -> Self {
        Self {
            owner,
            bucket_ids: Vec::new(),
        }
    }

    pub fn contains(&self, bucket: BucketId) -> bool {
        self.bucket_ids.contains(&bucket)
    }

    /// Appends `bucket` unless it is already queued.
    pub fn add(&mut self, bucket: BucketId) {
        if !self.contains(bucket) {
            self.bucket_ids.push(bucket);
        }
    }

    pub fn remove(&mut self, bucket: BucketId) -> bool {
        let before = self.bucket_ids.len();
        self.bucket_ids.retain(|b| *b != bucket);
        self.bucket_ids.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.bucket_ids.is_empty()
    }
}

/// Next piece of work for the transfer loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferWork {
    Buckets {
        bucket_ids: Vec<BucketId>,
        owner: NodeId,
        sparsed: bool,
    },
    /// Nothing left to pull.
    End,
}

/// A mutation recorded on the source while the bucket was being served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoggedOperation {
    /// `entry` is the value current when the log was drained; `None` if the
    /// key has disappeared since.
    Insert {
        key: String,
        entry: Option<CacheEntry>,
    },
    Remove {
        key: String,
    },
    Message(MessageOperation),
}

pub type EntryBatch = Vec<(String, Option<CacheEntry>)>;
pub type MessageBatch = Vec<(String, Vec<TopicMessage>)>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferPayload {
    Empty,
    /// Bulk cache entries; `None` deletes the key.
    Entries(EntryBatch),
    /// Bulk topic messages grouped by topic.
    Messages(MessageBatch),
    LoggedOperations(Vec<LoggedOperation>),
    /// Everything in a set of sparsed buckets at once.
    Snapshot {
        entries: EntryBatch,
        messages: MessageBatch,
    },
}

impl TransferPayload {
    pub fn item_count(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Entries(entries) => entries.len(),
            Self::Messages(topics) => topics.iter().map(|(_, messages)| messages.len()).sum(),
            Self::LoggedOperations(ops) => ops.len(),
            Self::Snapshot { entries, messages } => {
                entries.len() + messages.iter().map(|(_, m)| m.len()).sum::<usize>()
            }
        }
    }
}

/// One chunk of a bucket transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferUnit {
    pub payload: TransferPayload,
    /// Set only on the last unit of a bucket.
    pub transfer_completed: bool,
    /// Bytes carried, used for throttling.
    pub data_size: u64,
}

impl TransferUnit {
    pub fn new(payload: TransferPayload, transfer_completed: bool, data_size: u64) -> Self {
        Self {
            payload,
            transfer_completed,
            data_size,
        }
    }

    pub fn completed() -> Self {
        Self::new(TransferPayload::Empty, true, 0)
    }
}
