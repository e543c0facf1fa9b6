use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Hint the eviction policy keeps next to an entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EvictionHint {
    /// Last access time in milliseconds.
    Timestamp(u64),
    /// Access counter.
    Counter(u64),
    Priority(u8),
}

impl EvictionHint {
    /// Usage-based hints describe the node that recorded them and are not carried over.
    pub fn is_portable(&self) -> bool {
        matches!(self, Self::Priority(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Vec<u8>,
    pub version: u64,
    pub expires_at_ms: Option<u64>,
    pub eviction_hint: Option<EvictionHint>,
}

impl CacheEntry {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            version: 0,
            expires_at_ms: None,
            eviction_hint: None,
        }
    }

    pub fn with_expiry(mut self, expires_at_ms: u64) -> Self {
        self.expires_at_ms = Some(expires_at_ms);
        self
    }

    pub fn with_hint(mut self, hint: EvictionHint) -> Self {
        self.eviction_hint = Some(hint);
        self
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at_ms.map(|at| at <= now).unwrap_or(false)
    }

    /// Bytes this entry accounts for under `key`.
    pub fn size_with_key(&self, key: &str) -> u64 {
        bincode::serialized_size(self).unwrap_or(self.value.len() as u64) + key.len() as u64
    }

    /// Copy as it should be installed on another node.
    pub fn for_transfer(&self) -> Self {
        let mut entry = self.clone();
        entry.eviction_hint = entry.eviction_hint.filter(EvictionHint::is_portable);
        entry
    }
}

/// A pub/sub message held for a topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicMessage {
    pub id: String,
    pub payload: Vec<u8>,
    pub created_at_ms: u64,
}

impl TopicMessage {
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            created_at_ms: now_ms(),
        }
    }

    pub fn size(&self) -> u64 {
        bincode::serialized_size(self).unwrap_or(self.payload.len() as u64)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InsertResult {
    Success,
    SuccessOverwrite,
    /// The store is at capacity; nothing was written.
    NeedsEviction,
}

impl InsertResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::NeedsEviction)
    }
}

/// Why a bucket is hidden from local queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FilterKind {
    /// Destination side: the bucket is only partially here.
    Query,
    /// Source side: the bucket has been fully handed over.
    Compound,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageOperation {
    Store { topic: String, message: TopicMessage },
    Remove { topic: String, message_id: String },
}

/// Mutations drained from the operation log of one or more buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogTable {
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub message_ops: Vec<MessageOperation>,
    /// Set once the log went quiet and the buckets were frozen.
    pub logging_stopped: bool,
}

impl LogTable {
    pub fn len(&self) -> usize {
        self.updated.len() + self.removed.len() + self.message_ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a later drain. A key keeps only its latest operation.
    pub fn absorb(&mut self, later: LogTable) {
        for key in later.updated {
            self.removed.retain(|k| *k != key);
            if !self.updated.contains(&key) {
                self.updated.push(key);
            }
        }
        for key in later.removed {
            self.updated.retain(|k| *k != key);
            if !self.removed.contains(&key) {
                self.removed.push(key);
            }
        }
        self.message_ops.extend(later.message_ops);
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
