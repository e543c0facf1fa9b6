//! Source side of a bucket transfer.
//!
//! A [`Corresponder`] serves one requesting node. It walks one bucket at a
//! time through bulk keys, bulk topic messages and finally the operation log,
//! and uses the requester's transfer id to tell an acknowledgment (newer id,
//! drop what was served) from a retry (same id, serve it again).

use super::types::{EntryBatch, LoggedOperation, MessageBatch, TransferPayload, TransferUnit};
use crate::cluster::coordinator::OwnershipOracle;
use crate::cluster::types::{BucketId, NodeId, TransferType};
use crate::storage::CacheStore;
use crate::storage::types::{CacheEntry, FilterKind, LogTable, MessageOperation, TopicMessage};

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Drains attempted while building a sparsed snapshot before the log is cut off.
const SNAPSHOT_DRAIN_ROUNDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorresponderPhase {
    Unserved,
    BulkKeys,
    BulkMessages,
    LoggedReplay,
    Completed,
}

impl CorresponderPhase {
    /// Earliest phase at or after `self` that still has something to serve.
    pub fn next(self, keys_pending: bool, messages_pending: bool, move_mode: bool) -> Self {
        use CorresponderPhase::*;
        match self {
            Unserved | BulkKeys if keys_pending => BulkKeys,
            Unserved | BulkKeys | BulkMessages if messages_pending => BulkMessages,
            Unserved | BulkKeys | BulkMessages | LoggedReplay if move_mode => LoggedReplay,
            _ => Completed,
        }
    }
}

/// Settings a corresponder needs from the node configuration.
#[derive(Debug, Clone, Copy)]
pub struct CorresponderSettings {
    pub chunk_threshold: u64,
    pub stop_logging_threshold: usize,
    pub started_as_mirror: bool,
}

#[derive(Debug)]
struct BucketCursor {
    bucket: BucketId,
    phase: CorresponderPhase,
    keys: VecDeque<String>,
    messages: VecDeque<(String, String)>,
    last_transfer_id: u64,
    served_keys: usize,
    served_messages: usize,
    last_unit: Option<TransferUnit>,
}

impl BucketCursor {
    /// Drops what the last unit covered; the requester asked for more, so it has it.
    fn trim_served(&mut self) {
        if self.served_keys > 0 {
            let served = self.served_keys.min(self.keys.len());
            self.keys.drain(..served);
        }
        if self.served_messages > 0 {
            let served = self.served_messages.min(self.messages.len());
            self.messages.drain(..served);
        }
        self.served_keys = 0;
        self.served_messages = 0;
    }
}

pub struct Corresponder {
    requester: NodeId,
    store: Arc<dyn CacheStore>,
    oracle: Arc<dyn OwnershipOracle>,
    settings: CorresponderSettings,
    transfer_type: TransferType,
    transfer_type_changed: bool,
    cursor: Option<BucketCursor>,
    loggable_buckets: Vec<BucketId>,
    compound_filtered: Vec<BucketId>,
}

impl Corresponder {
    pub fn new(
        requester: NodeId,
        store: Arc<dyn CacheStore>,
        oracle: Arc<dyn OwnershipOracle>,
        settings: CorresponderSettings,
        transfer_type: TransferType,
    ) -> Self {
        let (transfer_type, transfer_type_changed) =
            if settings.started_as_mirror && transfer_type == TransferType::Replicate {
                (TransferType::Move, true)
            } else {
                (transfer_type, false)
            };

        Self {
            requester,
            store,
            oracle,
            settings,
            transfer_type,
            transfer_type_changed,
            cursor: None,
            loggable_buckets: Vec::new(),
            compound_filtered: Vec::new(),
        }
    }

    pub fn requester(&self) -> &NodeId {
        &self.requester
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    pub fn transfer_type_changed(&self) -> bool {
        self.transfer_type_changed
    }

    pub fn phase(&self) -> CorresponderPhase {
        self.cursor
            .as_ref()
            .map(|cursor| cursor.phase)
            .unwrap_or(CorresponderPhase::Unserved)
    }

    pub fn current_bucket(&self) -> Option<BucketId> {
        self.cursor.as_ref().map(|cursor| cursor.bucket)
    }

    fn is_move(&self) -> bool {
        self.transfer_type == TransferType::Move
    }

    pub fn transfer_bucket(
        &mut self,
        bucket_ids: &[BucketId],
        sparsed: bool,
        expected_transfer_id: u64,
    ) -> TransferUnit {
        if self.is_move() {
            for bucket in bucket_ids {
                if !self
                    .oracle
                    .verify_temporary_ownership(*bucket, &self.requester)
                {
                    tracing::info!("Bucket {} ownership changed", bucket);
                }
            }
        }

        let Some(&bucket) = bucket_ids.first() else {
            return TransferUnit::completed();
        };

        if sparsed {
            return self.bulk_snapshot(bucket_ids);
        }

        tracing::debug!(
            "State transfer request from {} for bucket {} (transfer id {})",
            self.requester,
            bucket,
            expected_transfer_id
        );

        match self.cursor.as_mut() {
            Some(cursor) if cursor.bucket == bucket => {
                if expected_transfer_id > cursor.last_transfer_id {
                    cursor.last_transfer_id = expected_transfer_id;
                    if cursor.phase == CorresponderPhase::Completed
                        && let Some(unit) = &cursor.last_unit
                    {
                        return unit.clone();
                    }
                    cursor.trim_served();
                    cursor.last_unit = None;
                } else if let Some(unit) = &cursor.last_unit {
                    return unit.clone();
                }
            }
            _ => {
                if let Some(previous) = self.current_bucket() {
                    tracing::debug!(
                        "{} moved from bucket {} to {}",
                        self.requester,
                        previous,
                        bucket
                    );
                }
                self.open_cursor(bucket, expected_transfer_id);
            }
        }

        let unit = self.get_data();
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.last_unit = Some(unit.clone());
        }
        unit
    }

    fn open_cursor(&mut self, bucket: BucketId, expected_transfer_id: u64) {
        let keys = self.store.key_list(bucket, self.is_move());
        let messages = self
            .store
            .message_list(bucket)
            .into_iter()
            .flat_map(|(topic, ids)| ids.into_iter().map(move |id| (topic.clone(), id)))
            .collect();

        if !self.loggable_buckets.contains(&bucket) {
            self.loggable_buckets.push(bucket);
        }

        self.cursor = Some(BucketCursor {
            bucket,
            phase: CorresponderPhase::Unserved,
            keys: keys.into(),
            messages,
            last_transfer_id: expected_transfer_id,
            served_keys: 0,
            served_messages: 0,
            last_unit: None,
        });
    }

    fn get_data(&mut self) -> TransferUnit {
        let move_mode = self.is_move();
        let Some(cursor) = self.cursor.as_mut() else {
            return TransferUnit::completed();
        };
        let bucket = cursor.bucket;

        cursor.phase = cursor
            .phase
            .next(!cursor.keys.is_empty(), !cursor.messages.is_empty(), move_mode);

        match cursor.phase {
            CorresponderPhase::BulkKeys => {
                let (entries, size) = self.collect_entries();
                if self.bulk_exhausted() {
                    self.finish_bulk(TransferPayload::Entries(entries), size)
                } else {
                    TransferUnit::new(TransferPayload::Entries(entries), false, size)
                }
            }
            CorresponderPhase::BulkMessages => {
                let (messages, size) = self.collect_messages();
                if self.bulk_exhausted() {
                    self.finish_bulk(TransferPayload::Messages(messages), size)
                } else {
                    TransferUnit::new(TransferPayload::Messages(messages), false, size)
                }
            }
            CorresponderPhase::LoggedReplay => self.replay_log(Vec::new(), 0),
            CorresponderPhase::Unserved | CorresponderPhase::Completed => {
                self.complete(bucket);
                TransferUnit::completed()
            }
        }
    }

    /// True once the unit being built covers everything left in bulk.
    fn bulk_exhausted(&self) -> bool {
        self.cursor
            .as_ref()
            .map(|cursor| {
                cursor.served_keys >= cursor.keys.len()
                    && cursor.served_messages >= cursor.messages.len()
            })
            .unwrap_or(true)
    }

    fn collect_entries(&mut self) -> (EntryBatch, u64) {
        let threshold = self.settings.chunk_threshold;
        let store = Arc::clone(&self.store);
        let Some(cursor) = self.cursor.as_mut() else {
            return (Vec::new(), 0);
        };

        let mut entries = Vec::new();
        let mut size_to_send = 0u64;
        let mut served = 0usize;

        for key in cursor.keys.iter() {
            match store.get(key) {
                Some(entry) => {
                    let size = entry.size_with_key(key);
                    if !entries.is_empty() && size_to_send + size > threshold {
                        break;
                    }
                    size_to_send += size;
                    entries.push((key.clone(), Some(entry)));
                }
                // Gone since listing; counted so it is trimmed with the rest.
                None => {}
            }
            served += 1;
        }

        cursor.served_keys = served;
        tracing::debug!("Bucket {}: {} keys served ({} bytes)", cursor.bucket, served, size_to_send);
        (entries, size_to_send)
    }

    fn collect_messages(&mut self) -> (MessageBatch, u64) {
        let threshold = self.settings.chunk_threshold;
        let store = Arc::clone(&self.store);
        let Some(cursor) = self.cursor.as_mut() else {
            return (Vec::new(), 0);
        };

        let mut batch: MessageBatch = Vec::new();
        let mut size_to_send = 0u64;
        let mut served = 0usize;

        for (topic, id) in cursor.messages.iter() {
            if let Some(message) = store.get_message(topic, id) {
                let size = message.size();
                if !batch.is_empty() && size_to_send + size > threshold {
                    break;
                }
                size_to_send += size;
                match batch.last_mut() {
                    Some((last_topic, messages)) if last_topic == topic => messages.push(message),
                    _ => batch.push((topic.clone(), vec![message])),
                }
            }
            served += 1;
        }

        cursor.served_messages = served;
        (batch, size_to_send)
    }

    /// Builds the unit that empties the bulk sources. In move mode the log is
    /// drained right away so a quiet bucket completes on this same unit.
    fn finish_bulk(&mut self, payload: TransferPayload, size: u64) -> TransferUnit {
        let Some(bucket) = self.current_bucket() else {
            return TransferUnit::completed();
        };

        if !self.is_move() {
            self.set_phase(CorresponderPhase::Completed);
            self.complete(bucket);
            return TransferUnit::new(payload, true, size);
        }

        match self
            .store
            .log_table(&[bucket], self.settings.stop_logging_threshold)
        {
            Some(table) if !table.is_empty() => {
                let ops = bulk_as_operations(payload);
                self.logged_unit(bucket, ops, size, table)
            }
            Some(table) if !table.logging_stopped => {
                self.set_phase(CorresponderPhase::LoggedReplay);
                TransferUnit::new(payload, false, size)
            }
            _ => {
                self.set_phase(CorresponderPhase::Completed);
                self.complete(bucket);
                TransferUnit::new(payload, true, size)
            }
        }
    }

    fn replay_log(&mut self, ops: Vec<LoggedOperation>, size: u64) -> TransferUnit {
        let Some(bucket) = self.current_bucket() else {
            return TransferUnit::completed();
        };
        tracing::debug!("Sending log data for bucket {}", bucket);

        match self
            .store
            .log_table(&[bucket], self.settings.stop_logging_threshold)
        {
            Some(table) => self.logged_unit(bucket, ops, size, table),
            None => {
                tracing::info!("No logged data found for bucket {}", bucket);
                self.set_phase(CorresponderPhase::Completed);
                self.complete(bucket);
                TransferUnit::new(TransferPayload::LoggedOperations(ops), true, size)
            }
        }
    }

    fn logged_unit(
        &mut self,
        bucket: BucketId,
        mut ops: Vec<LoggedOperation>,
        size: u64,
        table: LogTable,
    ) -> TransferUnit {
        let stopped = table.logging_stopped;
        let (logged, logged_size) = self.materialize(table);
        ops.extend(logged);

        if stopped {
            self.set_phase(CorresponderPhase::Completed);
            self.complete(bucket);
        } else {
            self.set_phase(CorresponderPhase::LoggedReplay);
        }
        TransferUnit::new(
            TransferPayload::LoggedOperations(ops),
            stopped,
            size + logged_size,
        )
    }

    /// Turns drained keys into operations carrying current values.
    fn materialize(&self, table: LogTable) -> (Vec<LoggedOperation>, u64) {
        let mut size = 0u64;
        let mut ops = Vec::with_capacity(table.len());

        for key in table.updated {
            let entry = self.store.get(&key);
            if let Some(entry) = &entry {
                size += entry.size_with_key(&key);
            }
            ops.push(LoggedOperation::Insert { key, entry });
        }
        for key in table.removed {
            size += key.len() as u64;
            ops.push(LoggedOperation::Remove { key });
        }
        for op in table.message_ops {
            if let MessageOperation::Store { message, .. } = &op {
                size += message.size();
            }
            ops.push(LoggedOperation::Message(op));
        }
        (ops, size)
    }

    fn bulk_snapshot(&mut self, buckets: &[BucketId]) -> TransferUnit {
        let move_mode = self.is_move();
        let mut entries: BTreeMap<String, Option<CacheEntry>> = BTreeMap::new();
        let mut messages: BTreeMap<String, BTreeMap<String, TopicMessage>> = BTreeMap::new();

        for bucket in buckets {
            for key in self.store.key_list(*bucket, move_mode) {
                if let Some(entry) = self.store.get(&key) {
                    entries.insert(key, Some(entry));
                }
            }
            for (topic, ids) in self.store.message_list(*bucket) {
                for id in ids {
                    if let Some(message) = self.store.get_message(&topic, &id) {
                        messages
                            .entry(topic.clone())
                            .or_default()
                            .insert(id, message);
                    }
                }
            }
            if move_mode && !self.loggable_buckets.contains(bucket) {
                self.loggable_buckets.push(*bucket);
            }
        }

        if move_mode {
            for round in 0..SNAPSHOT_DRAIN_ROUNDS {
                let threshold = if round + 1 == SNAPSHOT_DRAIN_ROUNDS {
                    usize::MAX
                } else {
                    self.settings.stop_logging_threshold
                };
                let Some(table) = self.store.log_table(buckets, threshold) else {
                    break;
                };
                let stopped = table.logging_stopped;
                self.fold_log(table, &mut entries, &mut messages);
                if stopped {
                    break;
                }
            }
        }

        for bucket in buckets {
            self.complete(*bucket);
        }

        let mut size = 0u64;
        let entries: EntryBatch = entries
            .into_iter()
            .inspect(|(key, entry)| {
                size += entry
                    .as_ref()
                    .map(|e| e.size_with_key(key))
                    .unwrap_or(key.len() as u64);
            })
            .collect();
        let messages: MessageBatch = messages
            .into_iter()
            .filter(|(_, by_id)| !by_id.is_empty())
            .map(|(topic, by_id)| {
                let list: Vec<TopicMessage> = by_id.into_values().collect();
                size += list.iter().map(TopicMessage::size).sum::<u64>();
                (topic, list)
            })
            .collect();

        tracing::info!(
            "Serving {} sparsed buckets to {} ({} entries, {} bytes)",
            buckets.len(),
            self.requester,
            entries.len(),
            size
        );
        TransferUnit::new(TransferPayload::Snapshot { entries, messages }, true, size)
    }

    fn fold_log(
        &self,
        table: LogTable,
        entries: &mut BTreeMap<String, Option<CacheEntry>>,
        messages: &mut BTreeMap<String, BTreeMap<String, TopicMessage>>,
    ) {
        for key in table.updated {
            let current = self.store.get(&key);
            entries.insert(key, current);
        }
        for key in table.removed {
            entries.insert(key, None);
        }
        for op in table.message_ops {
            match op {
                MessageOperation::Store { topic, message } => {
                    messages
                        .entry(topic)
                        .or_default()
                        .insert(message.id.clone(), message);
                }
                MessageOperation::Remove { topic, message_id } => {
                    if let Some(by_id) = messages.get_mut(&topic) {
                        by_id.remove(&message_id);
                    }
                }
            }
        }
    }

    fn set_phase(&mut self, phase: CorresponderPhase) {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.phase = phase;
        }
    }

    /// The bucket is fully handed over; local queries stop seeing it.
    fn complete(&mut self, bucket: BucketId) {
        self.store.start_filtering(bucket, FilterKind::Compound);
        if !self.compound_filtered.contains(&bucket) {
            self.compound_filtered.push(bucket);
        }
    }

    /// The requester confirmed `buckets`; nothing more to clean up for them here.
    pub fn forget_buckets(&mut self, buckets: &[BucketId]) {
        self.loggable_buckets.retain(|b| !buckets.contains(b));
        self.compound_filtered.retain(|b| !buckets.contains(b));
        if let Some(cursor) = &self.cursor
            && buckets.contains(&cursor.bucket)
        {
            self.cursor = None;
        }
    }

    pub fn dispose(&mut self) {
        tracing::info!("{} corresponder disposed", self.requester);
        self.cursor = None;

        if self.is_move() {
            for bucket in &self.loggable_buckets {
                tracing::info!("Removing logs for bucket {}", bucket);
                self.store.remove_log(*bucket);
            }
        }

        if self.transfer_type == TransferType::Replicate || self.transfer_type_changed {
            self.store
                .stop_filtering(&self.compound_filtered, FilterKind::Compound);
        }

        self.loggable_buckets.clear();
        self.compound_filtered.clear();
    }
}

fn bulk_as_operations(payload: TransferPayload) -> Vec<LoggedOperation> {
    match payload {
        TransferPayload::Entries(entries) => entries
            .into_iter()
            .map(|(key, entry)| LoggedOperation::Insert { key, entry })
            .collect(),
        TransferPayload::Messages(topics) => topics
            .into_iter()
            .flat_map(|(topic, messages)| {
                messages.into_iter().map(move |message| {
                    LoggedOperation::Message(MessageOperation::Store {
                        topic: topic.clone(),
                        message,
                    })
                })
            })
            .collect(),
        TransferPayload::LoggedOperations(ops) => ops,
        TransferPayload::Empty | TransferPayload::Snapshot { .. } => Vec::new(),
    }
}
