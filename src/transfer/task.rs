//! The pulling side of a rebalance.
//!
//! [`StateTransferTask`] receives views from the membership layer, queues the
//! buckets it has to pull and runs one background loop that locks, pulls,
//! applies and acknowledges them a unit at a time.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::protocol::TransferRequest;
use super::scheduler::{QueuedBucket, SchedulerHandle, SchedulerLoop};
use super::throttle::ThrottlingManager;
use super::transport::BucketTransport;
use super::types::{LoggedOperation, TransferPayload, TransferUnit, TransferWork};
use crate::cluster::coordinator::ClusterCoordinator;
use crate::cluster::types::{BucketAssignment, BucketId, LockResult, NodeId, TransferOutcome};
use crate::config::StateTransferConfig;
use crate::error::TransferError;
use crate::storage::CacheStore;
use crate::storage::types::{CacheEntry, FilterKind, InsertResult, MessageOperation};

/// How a pass over one set of locked buckets ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PassOutcome {
    Transferred,
    /// Still queued; retried after the other work.
    Deferred,
    /// Dropped from this node's queue.
    Abandoned,
    Cancelled,
}

#[derive(Debug)]
enum OwnerChange {
    Changed(NodeId),
    Same,
    Gone,
    Cancelled,
}

enum LoopExit {
    Drained,
    Cancelled,
}

/// State that lives for one run of the transfer loop.
struct TransferRun {
    throttle: ThrottlingManager,
    corresponding_nodes: BTreeSet<NodeId>,
    failed_keys: Vec<String>,
    data_since_compaction: u64,
    started: bool,
}

impl TransferRun {
    fn new(config: &StateTransferConfig) -> Self {
        Self {
            throttle: ThrottlingManager::new(config.bytes_per_second),
            corresponding_nodes: BTreeSet::new(),
            failed_keys: Vec::new(),
            data_since_compaction: 0,
            started: false,
        }
    }
}

pub struct StateTransferTask {
    local: NodeId,
    config: StateTransferConfig,
    coordinator: Arc<dyn ClusterCoordinator>,
    transport: Arc<dyn BucketTransport>,
    store: Arc<dyn CacheStore>,
    scheduler: SchedulerHandle,
    scheduler_task: JoinHandle<()>,
    update_id: AtomicU64,
    disposed: AtomicBool,
    running: AtomicBool,
    cancel: CancellationToken,
    /// Held for the whole of a run so a new run waits for the previous one to wind down.
    run_lock: Mutex<()>,
    outcomes: watch::Sender<Option<TransferOutcome>>,
}

impl StateTransferTask {
    pub fn new(
        local: NodeId,
        config: StateTransferConfig,
        coordinator: Arc<dyn ClusterCoordinator>,
        transport: Arc<dyn BucketTransport>,
        store: Arc<dyn CacheStore>,
    ) -> Arc<Self> {
        let (scheduler, scheduler_task) =
            SchedulerLoop::spawn(local.clone(), config.allow_bulk_in_sparsed);
        let (outcomes, _) = watch::channel(None);

        Arc::new(Self {
            local,
            config,
            coordinator,
            transport,
            store,
            scheduler,
            scheduler_task,
            update_id: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            run_lock: Mutex::new(()),
            outcomes,
        })
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn current_update_id(&self) -> u64 {
        self.update_id.load(Ordering::SeqCst)
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Outcome of the most recent run, `None` until one has finished.
    pub fn subscribe_outcomes(&self) -> watch::Receiver<Option<TransferOutcome>> {
        self.outcomes.subscribe()
    }

    /// Takes a new view and handles it in the background. Returns the update
    /// id assigned to it; older ids become stale.
    pub fn do_state_transfer(self: &Arc<Self>, assignments: Vec<BucketAssignment>) -> u64 {
        let update_id = self.update_id.fetch_add(1, Ordering::SeqCst) + 1;
        let task = Arc::clone(self);
        tokio::spawn(async move {
            task.update_async(assignments, update_id).await;
        });
        update_id
    }

    async fn update_async(self: Arc<Self>, assignments: Vec<BucketAssignment>, update_id: u64) {
        if let Err(e) = self.coordinator.determine_cluster_status().await {
            tracing::warn!("Could not refresh cluster status: {}", e);
        }
        self.update_state_transfer(&assignments, update_id).await;
    }

    /// Installs `assignments` if `update_id` is still current. Returns false
    /// for a stale update or a stopped task.
    pub async fn update_state_transfer(
        self: &Arc<Self>,
        assignments: &[BucketAssignment],
        update_id: u64,
    ) -> bool {
        if !self.is_current(update_id) {
            tracing::debug!("Skipping stale state transfer update {}", update_id);
            return false;
        }

        let queued = match self.classify(assignments).await {
            Ok(queued) => queued,
            Err(e) => {
                tracing::error!("State transfer update {} failed: {}", update_id, e);
                return false;
            }
        };

        if !self.is_current(update_id) {
            tracing::debug!("Update {} superseded while classifying", update_id);
            return false;
        }

        match self.scheduler.update(assignments.to_vec(), queued).await {
            Ok(true) => {
                self.spawn_run();
            }
            Ok(false) => self.coordinator.view_installation_complete(),
            Err(e) => {
                tracing::error!("State transfer update {} failed: {}", update_id, e);
                return false;
            }
        }
        true
    }

    fn is_current(&self, update_id: u64) -> bool {
        !self.disposed.load(Ordering::SeqCst)
            && self.update_id.load(Ordering::SeqCst) == update_id
    }

    /// Buckets this node has to pull that are not queued yet, with their
    /// owner and sparsed/filled class.
    async fn classify(&self, assignments: &[BucketAssignment]) -> Result<Vec<QueuedBucket>, TransferError> {
        let current = self.scheduler.snapshot().await?;
        let mut queued = Vec::new();

        for row in assignments.iter().filter(|row| row.needs_transfer_to(&self.local)) {
            let Some(owner) = row.permanent_owner.clone() else {
                continue;
            };
            // Queued under another owner: the update drops it there and requeues it here.
            if current.owner_of(row.bucket_id).as_ref() == Some(&owner) {
                continue;
            }
            let sparsed = self.is_sparsed_bucket(row.bucket_id, &owner).await;
            queued.push(QueuedBucket {
                bucket_id: row.bucket_id,
                owner,
                sparsed,
            });
        }
        Ok(queued)
    }

    /// Buckets whose size is unknown count as filled.
    async fn is_sparsed_bucket(&self, bucket: BucketId, owner: &NodeId) -> bool {
        self.coordinator
            .bucket_statistics(bucket, owner)
            .await
            .is_some_and(|stats| stats.data_size < self.config.sparse_threshold)
    }

    fn spawn_run(self: &Arc<Self>) {
        let task = Arc::clone(self);
        tokio::spawn(async move {
            task.process().await;
        });
    }

    /// Stops the loop and drops everything queued. Later updates are ignored.
    pub async fn stop(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        if let Err(e) = self.scheduler.clear().await {
            tracing::debug!("Scheduler already gone: {}", e);
        }
    }

    async fn process(self: Arc<Self>) -> TransferOutcome {
        let _run = self.run_lock.lock().await;
        self.running.store(true, Ordering::SeqCst);
        self.coordinator.view_installation_complete();

        let mut run = TransferRun::new(&self.config);
        let exit = self.run_loop(&mut run).await;

        let outcome = match &exit {
            Ok(LoopExit::Drained) => TransferOutcome::Completed {
                local_count: self.store.count(),
            },
            Ok(LoopExit::Cancelled) => TransferOutcome::Cancelled,
            Err(e) => {
                tracing::error!("State transfer failed: {}", e);
                TransferOutcome::Failed(e.to_string())
            }
        };

        if !matches!(exit, Ok(LoopExit::Drained))
            && let Err(e) = self.scheduler.finished().await
        {
            tracing::debug!("Scheduler already gone: {}", e);
        }

        self.coordinator.end_state_transfer(&outcome).await;

        for node in &run.corresponding_nodes {
            if let Err(e) = self.transport.signal_end_of_transfer(node).await {
                tracing::warn!("Could not signal end of transfer to {}: {}", node, e);
            }
        }

        if run.started {
            tracing::info!("State transfer has ended: {}", outcome);
        }

        self.running.store(false, Ordering::SeqCst);
        self.outcomes.send_replace(Some(outcome.clone()));
        outcome
    }

    async fn run_loop(&self, run: &mut TransferRun) -> Result<LoopExit, TransferError> {
        if let Err(e) = self.coordinator.announce_presence(true).await {
            tracing::warn!("Could not announce state transfer: {}", e);
        }
        if let Err(e) = self.coordinator.determine_cluster_status().await {
            tracing::warn!("Could not refresh cluster status: {}", e);
        }

        loop {
            if self.cancel.is_cancelled() {
                return Ok(LoopExit::Cancelled);
            }

            match self.scheduler.next().await? {
                TransferWork::End => return Ok(LoopExit::Drained),
                TransferWork::Buckets {
                    bucket_ids,
                    owner,
                    sparsed,
                } => {
                    run.corresponding_nodes.insert(owner.clone());
                    self.transfer_data(run, bucket_ids, owner, sparsed).await?;
                }
            }
        }
    }

    async fn transfer_data(
        &self,
        run: &mut TransferRun,
        buckets: Vec<BucketId>,
        owner: NodeId,
        sparsed: bool,
    ) -> Result<(), TransferError> {
        let Some(lock) = self.acquire_lock_on_buckets(&buckets).await else {
            tracing::error!("Lock acquisition failure for buckets {:?}", buckets);
            return self.defer(owner, buckets).await;
        };

        if !lock.owner_changed.is_empty() {
            tracing::info!(
                "Buckets {:?} changed owner before they could be locked",
                lock.owner_changed
            );
            self.scheduler.forget(lock.owner_changed.clone()).await?;
        }

        let acquired = lock.lock_acquired;
        if acquired.is_empty() {
            let pending: Vec<BucketId> = buckets
                .into_iter()
                .filter(|b| !lock.owner_changed.contains(b))
                .collect();
            if !pending.is_empty() {
                tracing::debug!("Buckets {:?} are locked elsewhere", pending);
                return self.defer(owner, pending).await;
            }
            return Ok(());
        }

        run.failed_keys.clear();
        if let Err(e) = self.coordinator.announce_state_transfer(&acquired).await {
            tracing::warn!("Could not announce transfer of {:?}: {}", acquired, e);
        }
        for bucket in &acquired {
            self.store.start_filtering(*bucket, FilterKind::Query);
        }

        let result = self.transfer_buckets(run, &acquired, owner.clone(), sparsed).await;

        self.store.stop_filtering(&acquired, FilterKind::Query);
        if let Err(e) = self.coordinator.release_buckets(&acquired).await {
            tracing::error!("Could not release buckets {:?}: {}", acquired, e);
        }
        self.remove_failed_keys_on_replica(run);

        match result? {
            PassOutcome::Deferred => self.defer(owner, acquired).await,
            PassOutcome::Transferred | PassOutcome::Abandoned | PassOutcome::Cancelled => Ok(()),
        }
    }

    async fn acquire_lock_on_buckets(&self, buckets: &[BucketId]) -> Option<LockResult> {
        let attempts = self.config.lock_attempts.max(1);
        for attempt in 1..=attempts {
            match self.coordinator.lock_buckets(buckets).await {
                Ok(result) => return Some(result),
                Err(e) => tracing::error!(
                    "Lock request for {:?} failed (attempt {}/{}): {}",
                    buckets,
                    attempt,
                    attempts,
                    e
                ),
            }
        }
        None
    }

    /// Puts `buckets` behind the other work and backs off before the loop
    /// picks anything again.
    async fn defer(&self, owner: NodeId, buckets: Vec<BucketId>) -> Result<(), TransferError> {
        self.scheduler.defer(owner, buckets).await?;
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.config.lock_retry_backoff()) => {}
        }
        Ok(())
    }

    async fn transfer_buckets(
        &self,
        run: &mut TransferRun,
        buckets: &[BucketId],
        mut owner: NodeId,
        sparsed: bool,
    ) -> Result<PassOutcome, TransferError> {
        let mut expected_transfer_id = 1u64;
        let mut resync_attempts = 0u32;
        tracing::info!("Starting transfer. Owner: {}, buckets: {:?}", owner, buckets);

        loop {
            if self.cancel.is_cancelled() {
                return Ok(PassOutcome::Cancelled);
            }
            self.maybe_compact(run);

            let unit = match self
                .safe_transfer_bucket(buckets, &owner, sparsed, expected_transfer_id)
                .await
            {
                Ok(unit) => unit,
                Err(TransferError::PeerSuspected { .. }) => {
                    tracing::info!("{} is suspected", owner);
                    match self.changed_owner(buckets[0], &owner).await {
                        OwnerChange::Changed(new_owner) => {
                            tracing::info!("{} is the new owner of {:?}", new_owner, buckets);
                            self.discard_partial(buckets);
                            run.corresponding_nodes.insert(new_owner.clone());
                            owner = new_owner;
                            expected_transfer_id = 1;
                            resync_attempts = 0;
                        }
                        OwnerChange::Same => {
                            resync_attempts += 1;
                            if resync_attempts >= self.config.max_resync_attempts {
                                tracing::error!(
                                    "Owner {} of {:?} never replaced after {} resync attempts; giving up",
                                    owner,
                                    buckets,
                                    resync_attempts
                                );
                                self.discard_partial(buckets);
                                self.scheduler.forget(buckets.to_vec()).await?;
                                return Ok(PassOutcome::Abandoned);
                            }
                        }
                        OwnerChange::Gone => {
                            tracing::error!("Could not get new owner for {:?}", buckets);
                            self.discard_partial(buckets);
                            return Ok(PassOutcome::Abandoned);
                        }
                        OwnerChange::Cancelled => return Ok(PassOutcome::Cancelled),
                    }
                    continue;
                }
                Err(TransferError::Timeout { peer }) => {
                    tracing::error!("Transfer of {:?} from {} keeps timing out", buckets, peer);
                    return Ok(PassOutcome::Deferred);
                }
                Err(e) => return Err(e),
            };

            if !run.started {
                run.started = true;
                tracing::info!("State transfer has started");
            }

            let completed = unit.transfer_completed;
            let size = unit.data_size;
            run.data_since_compaction += size;
            self.apply_unit(run, unit);
            expected_transfer_id += 1;

            if completed {
                self.scheduler.transferred(owner.clone(), buckets.to_vec()).await?;
                if let Err(e) = self.coordinator.buckets_transferred(&owner, buckets).await {
                    tracing::warn!("Could not report transfer of {:?}: {}", buckets, e);
                }
                tracing::info!("Acknowledging transfer of {:?} to {}", buckets, owner);
                if let Err(e) = self.transport.ack_transfer_completed(&owner, buckets).await {
                    tracing::warn!("Could not acknowledge {:?} to {}: {}", buckets, owner, e);
                }
                return Ok(PassOutcome::Transferred);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(PassOutcome::Cancelled),
                _ = run.throttle.throttle(size) => {}
            }
        }
    }

    /// Pulls one unit, retrying timeouts. Suspicion and fatal errors go back
    /// to the caller.
    async fn safe_transfer_bucket(
        &self,
        buckets: &[BucketId],
        owner: &NodeId,
        sparsed: bool,
        expected_transfer_id: u64,
    ) -> Result<TransferUnit, TransferError> {
        let mut retries = self.config.bucket_transfer_retries.max(1);

        loop {
            let request = TransferRequest {
                requester: self.local.clone(),
                bucket_ids: buckets.to_vec(),
                sparsed,
                expected_transfer_id,
                transfer_type: self.config.transfer_type,
            };

            match self.transport.transfer_bucket(owner, request).await {
                Ok(unit) => return Ok(unit),
                Err(e @ TransferError::PeerSuspected { .. }) => {
                    tracing::error!("{} is suspected during state transfer", owner);
                    if let Ok(Some(current)) = self.scheduler.owner_of(buckets[0]).await
                        && &current != owner
                    {
                        self.discard_partial(buckets);
                    }
                    return Err(e);
                }
                Err(e @ TransferError::Timeout { .. }) => {
                    retries -= 1;
                    tracing::error!(
                        "State transfer request to {} timed out ({} retries left)",
                        owner,
                        retries
                    );
                    if retries == 0 {
                        return Err(e);
                    }
                }
                Err(e) => {
                    tracing::error!("An error occurred during state transfer: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Waits for a view that names someone other than `current` for `bucket`.
    async fn changed_owner(&self, bucket: BucketId, current: &NodeId) -> OwnerChange {
        let mut generation = self.scheduler.subscribe();
        let deadline = tokio::time::Instant::now() + self.config.owner_change_timeout();

        loop {
            match self.scheduler.owner_of(bucket).await {
                Ok(None) | Err(_) => return OwnerChange::Gone,
                Ok(Some(owner)) if &owner != current => return OwnerChange::Changed(owner),
                Ok(Some(_)) => {}
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return OwnerChange::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return OwnerChange::Same,
                changed = generation.changed() => {
                    if changed.is_err() {
                        return OwnerChange::Gone;
                    }
                }
            }
        }
    }

    fn apply_unit(&self, run: &mut TransferRun, unit: TransferUnit) {
        tracing::debug!(
            "Applying {} items ({} bytes)",
            unit.payload.item_count(),
            unit.data_size
        );
        match unit.payload {
            TransferPayload::Empty => {}
            TransferPayload::Entries(entries) => {
                for (key, entry) in entries {
                    self.apply_entry(run, key, entry);
                }
            }
            TransferPayload::Messages(topics) => {
                for (topic, messages) in topics {
                    for message in messages {
                        self.apply_message(MessageOperation::Store {
                            topic: topic.clone(),
                            message,
                        });
                    }
                }
            }
            TransferPayload::LoggedOperations(ops) => {
                for op in ops {
                    match op {
                        LoggedOperation::Insert { key, entry } => self.apply_entry(run, key, entry),
                        LoggedOperation::Remove { key } => self.apply_entry(run, key, None),
                        LoggedOperation::Message(op) => self.apply_message(op),
                    }
                }
            }
            TransferPayload::Snapshot { entries, messages } => {
                for (key, entry) in entries {
                    self.apply_entry(run, key, entry);
                }
                for (topic, messages) in messages {
                    for message in messages {
                        self.apply_message(MessageOperation::Store {
                            topic: topic.clone(),
                            message,
                        });
                    }
                }
            }
        }
    }

    fn apply_entry(&self, run: &mut TransferRun, key: String, entry: Option<CacheEntry>) {
        let Some(entry) = entry else {
            if let Err(e) = self.store.remove(&key) {
                tracing::warn!("Could not remove transferred key {}: {}", key, e);
            }
            return;
        };

        match self.store.insert(&key, entry.for_transfer(), true) {
            Ok(InsertResult::NeedsEviction) => run.failed_keys.push(key),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Could not apply transferred key {}: {}", key, e);
                run.failed_keys.push(key);
            }
        }
    }

    fn apply_message(&self, op: MessageOperation) {
        let result = match op {
            MessageOperation::Store { topic, message } => self.store.store_message(&topic, message),
            MessageOperation::Remove { topic, message_id } => {
                self.store.remove_message(&topic, &message_id)
            }
        };
        if let Err(e) = result {
            tracing::warn!("Could not apply transferred message: {}", e);
        }
    }

    /// A synchronous replica may not keep keys it could not apply.
    fn remove_failed_keys_on_replica(&self, run: &mut TransferRun) {
        if !self.config.is_sync_replica || run.failed_keys.is_empty() {
            return;
        }
        tracing::info!("Removing {} keys that failed to transfer", run.failed_keys.len());
        for key in run.failed_keys.drain(..) {
            if let Err(e) = self.store.remove(&key) {
                tracing::warn!("Could not remove failed key {}: {}", key, e);
            }
        }
    }

    fn discard_partial(&self, buckets: &[BucketId]) {
        for bucket in buckets {
            self.store.empty_bucket(*bucket);
        }
    }

    fn maybe_compact(&self, run: &mut TransferRun) {
        let Some(threshold) = self.config.gc_threshold_bytes else {
            return;
        };
        if run.data_since_compaction < threshold {
            return;
        }
        run.data_since_compaction = 0;

        let started = Instant::now();
        self.store.compact();
        tracing::info!(
            "Compaction during state transfer took {:?}",
            started.elapsed()
        );
    }
}

impl Drop for StateTransferTask {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.scheduler_task.abort();
    }
}
