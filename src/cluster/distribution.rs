use super::coordinator::OwnershipOracle;
use super::types::{BucketAssignment, BucketId, BucketStatus, LockResult, NodeId};

use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Maps a key onto one of `bucket_count` buckets.
pub fn bucket_for_key(key: &str, bucket_count: u32) -> BucketId {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let hash = hasher.finish() as u32;
    hash % bucket_count
}

/// In-memory bucket table: who owns each bucket, who is pulling it, and who
/// holds its transfer lock.
///
/// The coordinator node mutates it through the lock service; every other node
/// keeps a replica installed from the coordinator's published table.
pub struct DistributionMap {
    bucket_count: u32,
    table: DashMap<BucketId, BucketAssignment>,
    locks: DashMap<BucketId, NodeId>,
    version: AtomicU64,
}

impl DistributionMap {
    pub fn new(bucket_count: u32) -> Self {
        Self {
            bucket_count,
            table: DashMap::new(),
            locks: DashMap::new(),
            version: AtomicU64::new(0),
        }
    }

    /// A table where every bucket lives on `owner`.
    pub fn with_single_owner(bucket_count: u32, owner: &NodeId) -> Self {
        let map = Self::new(bucket_count);
        for bucket in 0..bucket_count {
            map.table
                .insert(bucket, BucketAssignment::owned_by(bucket, owner.clone()));
        }
        map
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn bucket_of(&self, key: &str) -> BucketId {
        bucket_for_key(key, self.bucket_count)
    }

    pub fn assignment(&self, bucket: BucketId) -> Option<BucketAssignment> {
        self.table.get(&bucket).map(|entry| entry.value().clone())
    }

    pub fn assignments(&self) -> Vec<BucketAssignment> {
        let mut all: Vec<BucketAssignment> = self
            .table
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(|assignment| assignment.bucket_id);
        all
    }

    /// Rows whose temporary owner is `node`.
    pub fn assignments_for(&self, node: &NodeId) -> Vec<BucketAssignment> {
        self.assignments()
            .into_iter()
            .filter(|assignment| assignment.is_assigned_to(node))
            .collect()
    }

    /// Replaces the whole table with one received from the coordinator.
    pub fn install(&self, assignments: Vec<BucketAssignment>) {
        self.table.clear();
        for assignment in assignments {
            if assignment.bucket_id < self.bucket_count {
                self.table.insert(assignment.bucket_id, assignment);
            }
        }
        self.locks.retain(|bucket, holder| {
            self.table
                .get(bucket)
                .map(|row| row.temp_owner.as_ref() == Some(holder))
                .unwrap_or(false)
        });
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Spreads all buckets over `nodes` round-robin.
    pub fn assign_round_robin(&self, nodes: &[NodeId]) {
        if nodes.is_empty() {
            return;
        }
        let assignments = (0..self.bucket_count)
            .map(|bucket| {
                let owner = nodes[bucket as usize % nodes.len()].clone();
                BucketAssignment::owned_by(bucket, owner)
            })
            .collect();
        self.install(assignments);
    }

    /// Schedules `buckets` to move to `to`. Returns the buckets that actually
    /// need a transfer (the others already live there).
    pub fn plan_move(&self, buckets: &[BucketId], to: &NodeId) -> Vec<BucketId> {
        let mut planned = Vec::new();
        for bucket in buckets {
            if let Some(mut row) = self.table.get_mut(bucket)
                && row.permanent_owner.as_ref() != Some(to)
            {
                row.temp_owner = Some(to.clone());
                row.status = BucketStatus::NeedTransfer;
                planned.push(*bucket);
            }
        }
        if !planned.is_empty() {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        planned
    }

    /// Lock service. A bucket is granted only to its temporary owner and only
    /// if nobody else holds it.
    pub fn lock_buckets(&self, requester: &NodeId, buckets: &[BucketId]) -> LockResult {
        let mut result = LockResult::default();
        for bucket in buckets {
            let Some(mut row) = self.table.get_mut(bucket) else {
                result.owner_changed.push(*bucket);
                continue;
            };
            if row.temp_owner.as_ref() != Some(requester) {
                result.owner_changed.push(*bucket);
                continue;
            }

            let holder = self
                .locks
                .entry(*bucket)
                .or_insert_with(|| requester.clone())
                .clone();
            if &holder == requester {
                row.status = BucketStatus::UnderStateTransfer;
                result.lock_acquired.push(*bucket);
            } else {
                tracing::debug!("Bucket {} already locked by {}", bucket, holder);
            }
        }
        result
    }

    pub fn release_buckets(&self, requester: &NodeId, buckets: &[BucketId]) {
        for bucket in buckets {
            self.locks
                .remove_if(bucket, |_, holder| holder == requester);
            if let Some(mut row) = self.table.get_mut(bucket) {
                row.status = if row.permanent_owner == row.temp_owner {
                    BucketStatus::Functional
                } else {
                    BucketStatus::NeedTransfer
                };
            }
        }
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn announce_state_transfer(&self, requester: &NodeId, buckets: &[BucketId]) {
        for bucket in buckets {
            if let Some(mut row) = self.table.get_mut(bucket)
                && row.temp_owner.as_ref() == Some(requester)
            {
                row.status = BucketStatus::UnderStateTransfer;
            }
        }
    }

    /// Finalizes ownership once `requester` holds all of `owner`'s data for `buckets`.
    pub fn mark_transferred(&self, requester: &NodeId, owner: &NodeId, buckets: &[BucketId]) {
        for bucket in buckets {
            if let Some(mut row) = self.table.get_mut(bucket)
                && row.temp_owner.as_ref() == Some(requester)
                && row.permanent_owner.as_ref() == Some(owner)
            {
                row.permanent_owner = Some(requester.clone());
            }
        }
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn lock_holder(&self, bucket: BucketId) -> Option<NodeId> {
        self.locks.get(&bucket).map(|holder| holder.clone())
    }
}

impl OwnershipOracle for DistributionMap {
    fn select_node(&self, key: &str) -> Option<NodeId> {
        self.assignment(self.bucket_of(key))
            .and_then(|row| row.permanent_owner)
    }

    fn verify_temporary_ownership(&self, bucket: BucketId, node: &NodeId) -> bool {
        self.assignment(bucket)
            .map(|row| row.temp_owner.as_ref() == Some(node))
            .unwrap_or(false)
    }
}
