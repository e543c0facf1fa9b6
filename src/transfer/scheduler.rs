//! Queue of buckets this node still has to pull.
//!
//! [`PackSet`] is the queue itself. It is owned by a single background task;
//! the driver and the update path reach it through [`SchedulerHandle`], so
//! membership updates and the transfer loop never touch the packs at the same
//! time.

use std::collections::HashMap;
use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    oneshot, watch,
};
use tokio::task::JoinHandle;

use super::types::{BucketsPack, TransferWork};
use crate::cluster::types::{BucketAssignment, BucketId, NodeId};
use crate::error::TransferError;

/// A bucket the update path wants queued, already classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedBucket {
    pub bucket_id: BucketId,
    pub owner: NodeId,
    pub sparsed: bool,
}

/// Sparsed and filled packs, one pack per owner in each.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackSet {
    sparsed: Vec<BucketsPack>,
    filled: Vec<BucketsPack>,
}

impl PackSet {
    pub fn sparsed(&self) -> &[BucketsPack] {
        &self.sparsed
    }

    pub fn filled(&self) -> &[BucketsPack] {
        &self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.sparsed.is_empty() && self.filled.is_empty()
    }

    fn all(&self) -> impl Iterator<Item = &BucketsPack> {
        self.sparsed.iter().chain(self.filled.iter())
    }

    pub fn is_queued(&self, bucket: BucketId) -> bool {
        self.all().any(|pack| pack.contains(bucket))
    }

    pub fn owner_of(&self, bucket: BucketId) -> Option<NodeId> {
        self.all()
            .find(|pack| pack.contains(bucket))
            .map(|pack| pack.owner.clone())
    }

    /// Queues `bucket` under its owner. Buckets already queued anywhere are left alone.
    pub fn add(&mut self, bucket: QueuedBucket) {
        if self.is_queued(bucket.bucket_id) {
            return;
        }
        let packs = if bucket.sparsed {
            &mut self.sparsed
        } else {
            &mut self.filled
        };
        match packs.iter_mut().find(|pack| pack.owner == bucket.owner) {
            Some(pack) => pack.add(bucket.bucket_id),
            None => {
                let mut pack = BucketsPack::new(bucket.owner);
                pack.add(bucket.bucket_id);
                packs.push(pack);
            }
        }
    }

    /// Drops buckets that are no longer assigned to `local` or whose owner
    /// moved, and empty packs with them.
    pub fn reconcile(&mut self, assignments: &[BucketAssignment], local: &NodeId) {
        let assigned: HashMap<BucketId, &BucketAssignment> = assignments
            .iter()
            .filter(|row| row.is_assigned_to(local))
            .map(|row| (row.bucket_id, row))
            .collect();

        for pack in self.sparsed.iter_mut().chain(self.filled.iter_mut()) {
            let owner = pack.owner.clone();
            pack.bucket_ids.retain(|bucket| {
                let keep = assigned
                    .get(bucket)
                    .is_some_and(|row| row.permanent_owner.as_ref() == Some(&owner));
                if !keep {
                    tracing::debug!("Bucket {} no longer queued from {}", bucket, owner);
                }
                keep
            });
        }
        self.drop_empty();
    }

    pub fn next_work(&self, allow_bulk_in_sparsed: bool) -> TransferWork {
        if let Some(pack) = self.sparsed.first()
            && let Some(&first) = pack.bucket_ids.first()
        {
            return if allow_bulk_in_sparsed {
                TransferWork::Buckets {
                    bucket_ids: pack.bucket_ids.clone(),
                    owner: pack.owner.clone(),
                    sparsed: true,
                }
            } else {
                TransferWork::Buckets {
                    bucket_ids: vec![first],
                    owner: pack.owner.clone(),
                    sparsed: false,
                }
            };
        }

        if let Some(pack) = self.filled.first()
            && let Some(&first) = pack.bucket_ids.first()
        {
            return TransferWork::Buckets {
                bucket_ids: vec![first],
                owner: pack.owner.clone(),
                sparsed: false,
            };
        }

        TransferWork::End
    }

    pub fn transferred(&mut self, owner: &NodeId, buckets: &[BucketId]) {
        for pack in self.sparsed.iter_mut().chain(self.filled.iter_mut()) {
            if &pack.owner == owner {
                pack.bucket_ids.retain(|b| !buckets.contains(b));
            }
        }
        self.drop_empty();
    }

    pub fn forget(&mut self, buckets: &[BucketId]) {
        for pack in self.sparsed.iter_mut().chain(self.filled.iter_mut()) {
            pack.bucket_ids.retain(|b| !buckets.contains(b));
        }
        self.drop_empty();
    }

    /// Moves `buckets` to the back of their pack, and the pack to the back of
    /// its list, so other work is tried first.
    pub fn defer(&mut self, owner: &NodeId, buckets: &[BucketId]) {
        for packs in [&mut self.sparsed, &mut self.filled] {
            let Some(index) = packs
                .iter()
                .position(|pack| &pack.owner == owner && buckets.iter().any(|b| pack.contains(*b)))
            else {
                continue;
            };
            let mut pack = packs.remove(index);
            for bucket in buckets {
                if pack.remove(*bucket) {
                    pack.add(*bucket);
                }
            }
            packs.push(pack);
        }
    }

    pub fn clear(&mut self) {
        self.sparsed.clear();
        self.filled.clear();
    }

    fn drop_empty(&mut self) {
        self.sparsed.retain(|pack| !pack.is_empty());
        self.filled.retain(|pack| !pack.is_empty());
    }
}

enum SchedulerCommand {
    Update {
        assignments: Vec<BucketAssignment>,
        queued: Vec<QueuedBucket>,
        reply: oneshot::Sender<bool>,
    },
    Next(oneshot::Sender<TransferWork>),
    Transferred {
        owner: NodeId,
        buckets: Vec<BucketId>,
        reply: oneshot::Sender<()>,
    },
    Forget {
        buckets: Vec<BucketId>,
        reply: oneshot::Sender<()>,
    },
    Defer {
        owner: NodeId,
        buckets: Vec<BucketId>,
        reply: oneshot::Sender<()>,
    },
    OwnerOf {
        bucket: BucketId,
        reply: oneshot::Sender<Option<NodeId>>,
    },
    Snapshot(oneshot::Sender<PackSet>),
    Finished(oneshot::Sender<()>),
    Clear(oneshot::Sender<()>),
}

/// Handle to the scheduler task. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: UnboundedSender<SchedulerCommand>,
    generation: watch::Receiver<u64>,
}

fn stopped<T>(_: T) -> TransferError {
    TransferError::fatal("transfer scheduler stopped")
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
    ) -> Result<T, TransferError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).map_err(stopped)?;
        rx.await.map_err(stopped)
    }

    /// Installs a new view. Returns true when the caller should start the
    /// transfer loop; false when one is already running or there is nothing to do.
    pub async fn update(
        &self,
        assignments: Vec<BucketAssignment>,
        queued: Vec<QueuedBucket>,
    ) -> Result<bool, TransferError> {
        self.request(|reply| SchedulerCommand::Update {
            assignments,
            queued,
            reply,
        })
        .await
    }

    pub async fn next(&self) -> Result<TransferWork, TransferError> {
        self.request(SchedulerCommand::Next).await
    }

    pub async fn transferred(&self, owner: NodeId, buckets: Vec<BucketId>) -> Result<(), TransferError> {
        self.request(|reply| SchedulerCommand::Transferred {
            owner,
            buckets,
            reply,
        })
        .await
    }

    pub async fn forget(&self, buckets: Vec<BucketId>) -> Result<(), TransferError> {
        self.request(|reply| SchedulerCommand::Forget { buckets, reply })
            .await
    }

    pub async fn defer(&self, owner: NodeId, buckets: Vec<BucketId>) -> Result<(), TransferError> {
        self.request(|reply| SchedulerCommand::Defer {
            owner,
            buckets,
            reply,
        })
        .await
    }

    pub async fn owner_of(&self, bucket: BucketId) -> Result<Option<NodeId>, TransferError> {
        self.request(|reply| SchedulerCommand::OwnerOf { bucket, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<PackSet, TransferError> {
        self.request(SchedulerCommand::Snapshot).await
    }

    /// The transfer loop exited early; the next update may start a new one.
    pub async fn finished(&self) -> Result<(), TransferError> {
        self.request(SchedulerCommand::Finished).await
    }

    pub async fn clear(&self) -> Result<(), TransferError> {
        self.request(SchedulerCommand::Clear).await
    }

    /// Bumps on every installed view; waiters use it to notice owner changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        let mut generation = self.generation.clone();
        generation.borrow_and_update();
        generation
    }
}

pub struct SchedulerLoop {
    local: NodeId,
    allow_bulk_in_sparsed: bool,
    packs: PackSet,
    loop_active: bool,
    generation: watch::Sender<u64>,
    commands: UnboundedReceiver<SchedulerCommand>,
}

impl SchedulerLoop {
    pub fn spawn(local: NodeId, allow_bulk_in_sparsed: bool) -> (SchedulerHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = unbounded_channel();
        let (generation_tx, generation_rx) = watch::channel(0);

        let worker = Self {
            local,
            allow_bulk_in_sparsed,
            packs: PackSet::default(),
            loop_active: false,
            generation: generation_tx,
            commands: commands_rx,
        };
        let task = tokio::spawn(worker.run());

        (
            SchedulerHandle {
                commands: commands_tx,
                generation: generation_rx,
            },
            task,
        )
    }

    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        tracing::debug!("Transfer scheduler for {} stopped", self.local);
    }

    fn handle(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Update {
                assignments,
                queued,
                reply,
            } => {
                self.packs.reconcile(&assignments, &self.local);
                for bucket in queued {
                    self.packs.add(bucket);
                }
                self.generation.send_modify(|g| *g += 1);

                let claim = !self.loop_active && !self.packs.is_empty();
                if claim {
                    self.loop_active = true;
                }
                let _ = reply.send(claim);
            }
            SchedulerCommand::Next(reply) => {
                let work = self.packs.next_work(self.allow_bulk_in_sparsed);
                if work == TransferWork::End {
                    self.loop_active = false;
                }
                let _ = reply.send(work);
            }
            SchedulerCommand::Transferred {
                owner,
                buckets,
                reply,
            } => {
                self.packs.transferred(&owner, &buckets);
                let _ = reply.send(());
            }
            SchedulerCommand::Forget { buckets, reply } => {
                self.packs.forget(&buckets);
                let _ = reply.send(());
            }
            SchedulerCommand::Defer {
                owner,
                buckets,
                reply,
            } => {
                self.packs.defer(&owner, &buckets);
                let _ = reply.send(());
            }
            SchedulerCommand::OwnerOf { bucket, reply } => {
                let _ = reply.send(self.packs.owner_of(bucket));
            }
            SchedulerCommand::Snapshot(reply) => {
                let _ = reply.send(self.packs.clone());
            }
            SchedulerCommand::Finished(reply) => {
                self.loop_active = false;
                let _ = reply.send(());
            }
            SchedulerCommand::Clear(reply) => {
                self.packs.clear();
                self.generation.send_modify(|g| *g += 1);
                let _ = reply.send(());
            }
        }
    }
}
