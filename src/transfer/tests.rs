//! State Transfer Module Tests
//!
//! Drives whole transfers between in-process nodes and checks what ends up
//! where.
//!
//! ## Test Scopes
//! - **Corresponder**: Chunking, replay of retried units, completion, cleanup.
//! - **Scenarios**: Filled and sparsed buckets, suspected owners, writes during a transfer.
//! - **Driver**: Lock and release pairing, deferral, stale updates, cancellation.

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use crate::cluster::distribution::DistributionMap;
    use crate::cluster::types::{BucketId, BucketStatus, NodeId, TransferOutcome, TransferType};
    use crate::config::StateTransferConfig;
    use crate::storage::CacheStore;
    use crate::storage::memory::BucketStore;
    use crate::storage::types::{CacheEntry, TopicMessage};
    use crate::transfer::corresponder::{Corresponder, CorresponderPhase, CorresponderSettings};
    use crate::transfer::testkit::{
        CoordinatorEvent, Fault, LocalCluster, TestNode, wait_for_outcome,
    };
    use crate::transfer::types::{LoggedOperation, TransferPayload, TransferUnit};

    const BUCKETS: u32 = 8;
    const VALUE_SIZE: usize = 1000;

    fn config() -> StateTransferConfig {
        StateTransferConfig {
            lock_retry_backoff_ms: 50,
            owner_change_timeout_ms: 5_000,
            ..StateTransferConfig::default()
        }
    }

    fn keys_in_bucket(store: &BucketStore, bucket: BucketId, count: usize) -> Vec<String> {
        (0..)
            .map(|i| format!("key_{}", i))
            .filter(|key| store.bucket_of(key) == bucket)
            .take(count)
            .collect()
    }

    /// Writes `count` entries of about 1 KB into `bucket`; returns the keys sorted.
    fn fill(store: &BucketStore, bucket: BucketId, count: usize) -> Vec<String> {
        let mut keys = keys_in_bucket(store, bucket, count);
        for key in &keys {
            store
                .insert(key, CacheEntry::new(vec![7u8; VALUE_SIZE]), false)
                .unwrap();
        }
        keys.sort();
        keys
    }

    struct Cluster {
        map: Arc<DistributionMap>,
        cluster: Arc<LocalCluster>,
        a: TestNode,
        b: TestNode,
    }

    /// Two nodes; every bucket starts on "a".
    fn two_nodes(b_config: StateTransferConfig, b_capacity: Option<u64>) -> Cluster {
        let map = Arc::new(DistributionMap::with_single_owner(BUCKETS, &NodeId::from("a")));
        let cluster = LocalCluster::new();
        let a = TestNode::spawn("a", &cluster, &map, config(), None);
        let b = TestNode::spawn("b", &cluster, &map, b_config, b_capacity);
        Cluster { map, cluster, a, b }
    }

    fn requests_for(cluster: &LocalCluster, bucket: BucketId) -> Vec<(Vec<BucketId>, bool, u64)> {
        cluster
            .requests()
            .into_iter()
            .filter(|(_, req)| req.bucket_ids.contains(&bucket))
            .map(|(_, req)| (req.bucket_ids, req.sparsed, req.expected_transfer_id))
            .collect()
    }

    fn lock_release_counts(events: &[CoordinatorEvent]) -> (usize, usize) {
        let locks = events
            .iter()
            .filter(|e| matches!(e, CoordinatorEvent::Lock(acquired) if !acquired.is_empty()))
            .count();
        let releases = events
            .iter()
            .filter(|e| matches!(e, CoordinatorEvent::Release(_)))
            .count();
        (locks, releases)
    }

    fn corresponder(store: Arc<BucketStore>, transfer_type: TransferType, mirror: bool) -> Corresponder {
        let map = Arc::new(DistributionMap::with_single_owner(BUCKETS, &NodeId::from("a")));
        Corresponder::new(
            NodeId::from("b"),
            store,
            map,
            CorresponderSettings {
                chunk_threshold: 20 * 1024,
                stop_logging_threshold: 50,
                started_as_mirror: mirror,
            },
            transfer_type,
        )
    }

    fn unit_keys(unit: &TransferUnit) -> Vec<String> {
        match &unit.payload {
            TransferPayload::Entries(entries) => entries.iter().map(|(k, _)| k.clone()).collect(),
            TransferPayload::LoggedOperations(ops) => ops
                .iter()
                .filter_map(|op| match op {
                    LoggedOperation::Insert { key, .. } => Some(key.clone()),
                    _ => None,
                })
                .collect(),
            TransferPayload::Snapshot { entries, .. } => {
                entries.iter().map(|(k, _)| k.clone()).collect()
            }
            _ => Vec::new(),
        }
    }

    // ============================================================
    // CORRESPONDER TESTS
    // ============================================================

    #[test]
    fn test_retried_id_replays_the_same_unit() {
        let store = Arc::new(BucketStore::new(BUCKETS));
        fill(&store, 1, 50);
        let mut corresponder = corresponder(store, TransferType::Move, false);

        let first = corresponder.transfer_bucket(&[1], false, 1);
        let replay = corresponder.transfer_bucket(&[1], false, 1);
        let second = corresponder.transfer_bucket(&[1], false, 2);

        assert_eq!(first, replay);
        assert_ne!(first, second);
        assert!(!first.transfer_completed);
        assert_eq!(corresponder.phase(), CorresponderPhase::BulkKeys);

        let overlap: HashSet<String> = unit_keys(&first).into_iter().collect();
        assert!(unit_keys(&second).iter().all(|k| !overlap.contains(k)));
    }

    #[test]
    fn test_only_the_last_unit_completes() {
        let store = Arc::new(BucketStore::new(BUCKETS));
        let keys = fill(&store, 1, 50);
        let mut corresponder = corresponder(store, TransferType::Move, false);

        let mut units = Vec::new();
        for id in 1..=20 {
            let unit = corresponder.transfer_bucket(&[1], false, id);
            let done = unit.transfer_completed;
            units.push(unit);
            if done {
                break;
            }
        }

        // ASSERT: chunked at ~20 KB, completion flagged once at the end
        assert!(units.len() >= 3);
        let (last, rest) = units.split_last().unwrap();
        assert!(last.transfer_completed);
        assert!(rest.iter().all(|u| !u.transfer_completed));
        assert!(rest.iter().all(|u| u.data_size <= 20 * 1024));

        let served: HashSet<String> = units.iter().flat_map(unit_keys).collect();
        assert_eq!(served, keys.into_iter().collect());
        assert_eq!(corresponder.phase(), CorresponderPhase::Completed);
    }

    #[test]
    fn test_writes_while_serving_are_replayed_from_the_log() {
        let store = Arc::new(BucketStore::new(BUCKETS));
        let keys = fill(&store, 1, 50);
        let mut corresponder = corresponder(store.clone(), TransferType::Move, false);

        // ARRANGE: first unit out, then the bucket keeps changing
        corresponder.transfer_bucket(&[1], false, 1);
        let late = keys_in_bucket(&store, 1, 51).pop().unwrap();
        store.insert(&late, CacheEntry::new("late"), false).unwrap();
        store.remove(&keys[0]).unwrap();

        // ACT
        let mut last = corresponder.transfer_bucket(&[1], false, 2);
        let mut id = 2;
        while !last.transfer_completed {
            id += 1;
            last = corresponder.transfer_bucket(&[1], false, id);
        }

        // ASSERT
        let TransferPayload::LoggedOperations(ops) = &last.payload else {
            panic!("expected logged operations, got {:?}", last.payload);
        };
        assert!(ops.iter().any(|op| matches!(
            op,
            LoggedOperation::Insert { key, entry: Some(_) } if key == &late
        )));
        assert!(ops.contains(&LoggedOperation::Remove {
            key: keys[0].clone()
        }));
        assert!(store.is_frozen(1));
    }

    #[test]
    fn test_empty_bucket_completes_immediately() {
        let store = Arc::new(BucketStore::new(BUCKETS));
        let mut corresponder = corresponder(store.clone(), TransferType::Replicate, false);

        let unit = corresponder.transfer_bucket(&[4], false, 1);

        assert!(unit.transfer_completed);
        assert_eq!(unit.payload, TransferPayload::Empty);
        assert!(store.is_filtered(4));

        corresponder.dispose();
        assert!(!store.is_filtered(4));
    }

    #[test]
    fn test_mirror_upgrades_replication_to_move() {
        let store = Arc::new(BucketStore::new(BUCKETS));
        let corresponder = corresponder(store, TransferType::Replicate, true);

        assert_eq!(corresponder.transfer_type(), TransferType::Move);
        assert!(corresponder.transfer_type_changed());
    }

    #[test]
    fn test_served_bucket_is_under_transfer_for_store_writes() {
        let store = Arc::new(BucketStore::new(BUCKETS));
        fill(&store, 1, 50);
        let mut corresponder = corresponder(store.clone(), TransferType::Move, false);

        corresponder.transfer_bucket(&[1], false, 1);
        let served = keys_in_bucket(&store, 1, 51).pop().unwrap();
        let other = keys_in_bucket(&store, 2, 1).pop().unwrap();
        store.insert(&served, CacheEntry::new("late"), false).unwrap();
        store.insert(&other, CacheEntry::new("elsewhere"), false).unwrap();

        // ASSERT: only the bucket being served records its writes
        let table = store.log_table(&[1], 0).unwrap();
        assert_eq!(table.updated, vec![served]);
        assert!(!table.logging_stopped);
        assert!(store.log_table(&[2], 0).is_none());
    }

    #[test]
    fn test_dispose_in_move_mode_drops_logs() {
        let store = Arc::new(BucketStore::new(BUCKETS));
        fill(&store, 1, 50);
        let mut corresponder = corresponder(store.clone(), TransferType::Move, false);

        corresponder.transfer_bucket(&[1], false, 1);
        assert!(store.is_logging(1));

        corresponder.dispose();
        assert!(!store.is_logging(1));
        assert!(!store.is_frozen(1));
    }

    #[test]
    fn test_sparsed_request_is_one_terminal_snapshot() {
        let store = Arc::new(BucketStore::new(BUCKETS));
        let mut expected = fill(&store, 3, 3);
        expected.extend(fill(&store, 5, 2));
        let mut corresponder = corresponder(store.clone(), TransferType::Move, false);

        let unit = corresponder.transfer_bucket(&[3, 5], true, 1);

        assert!(unit.transfer_completed);
        let served: HashSet<String> = unit_keys(&unit).into_iter().collect();
        assert_eq!(served, expected.into_iter().collect());
        assert!(store.is_frozen(3) && store.is_frozen(5));
        assert!(store.is_filtered(3));
    }

    // ============================================================
    // SCENARIO TESTS
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_filled_bucket_moves_in_chunks() {
        let Cluster { map, cluster, a, b } = two_nodes(config(), None);
        let keys = fill(&a.store, 1, 50);
        let message_ids = keys_in_bucket(&a.store, 1, 53).split_off(50);
        for id in &message_ids {
            a.store
                .store_message("news", TopicMessage::new(id.clone(), "hello"))
                .unwrap();
        }
        let versions: Vec<u64> = keys.iter().map(|k| a.store.get(k).unwrap().version).collect();

        // ACT
        map.plan_move(&[1], &b.id);
        b.driver.do_state_transfer(map.assignments());
        let outcome = wait_for_outcome(&b.driver).await;

        // ASSERT: data and versions arrived, source copy dropped
        assert_eq!(outcome, TransferOutcome::Completed { local_count: 50 });
        for (key, version) in keys.iter().zip(versions) {
            assert_eq!(b.store.get(key).unwrap().version, version);
        }
        for id in &message_ids {
            assert!(b.store.get_message("news", id).is_some());
        }
        assert_eq!(a.store.bucket_statistics(1).count, 0);
        assert!(!a.store.is_frozen(1));

        // ASSERT: one filled bucket, ids strictly increasing from 1
        let requests = requests_for(&cluster, 1);
        assert!(requests.len() >= 4);
        for (i, (buckets, sparsed, id)) in requests.iter().enumerate() {
            assert_eq!(buckets, &vec![1]);
            assert!(!sparsed);
            assert_eq!(*id, i as u64 + 1);
        }

        let row = map.assignment(1).unwrap();
        assert_eq!(row.permanent_owner, Some(b.id.clone()));
        assert_eq!(row.status, BucketStatus::Functional);
        assert_eq!(cluster.acks(), vec![(a.id.clone(), vec![1])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sparsed_buckets_move_in_one_request() {
        let Cluster { map, cluster, a, b } = two_nodes(config(), None);
        let mut keys = fill(&a.store, 3, 5);
        keys.extend(fill(&a.store, 5, 2));

        map.plan_move(&[3, 5], &b.id);
        b.driver.do_state_transfer(map.assignments());
        let outcome = wait_for_outcome(&b.driver).await;

        assert_eq!(outcome, TransferOutcome::Completed { local_count: 7 });
        assert_eq!(cluster.requests().len(), 1);
        assert_eq!(requests_for(&cluster, 3), vec![(vec![3, 5], true, 1)]);
        for key in &keys {
            assert!(b.store.get(key).is_some());
        }
        assert_eq!(a.store.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sparsed_buckets_one_at_a_time_without_bulk() {
        let b_config = StateTransferConfig {
            allow_bulk_in_sparsed: false,
            ..config()
        };
        let Cluster { map, cluster, a, b } = two_nodes(b_config, None);
        fill(&a.store, 3, 5);
        fill(&a.store, 5, 2);

        map.plan_move(&[3, 5], &b.id);
        b.driver.do_state_transfer(map.assignments());
        let outcome = wait_for_outcome(&b.driver).await;

        assert_eq!(outcome, TransferOutcome::Completed { local_count: 7 });
        assert!(cluster
            .requests()
            .iter()
            .all(|(_, req)| req.bucket_ids.len() == 1 && !req.sparsed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspected_owner_is_replaced_by_new_owner() {
        let Cluster { map, cluster, a, b } = two_nodes(config(), None);
        let c = TestNode::spawn("c", &cluster, &map, config(), None);
        let keys = fill(&a.store, 2, 30);
        for key in &keys {
            c.store.insert(key, CacheEntry::new("from-c"), false).unwrap();
        }

        // ARRANGE: the owner dies before the first pull
        cluster.kill(&a.id);
        map.plan_move(&[2], &b.id);
        b.driver.do_state_transfer(map.assignments());
        while cluster.suspicions() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // ACT: membership hands the bucket's data to c
        let mut rows = map.assignments();
        rows[2].permanent_owner = Some(c.id.clone());
        map.install(rows);
        b.driver.do_state_transfer(map.assignments());
        let outcome = wait_for_outcome(&b.driver).await;

        // ASSERT
        assert_eq!(outcome, TransferOutcome::Completed { local_count: 30 });
        for key in &keys {
            assert_eq!(b.store.get(key).unwrap().value, b"from-c".to_vec());
        }
        assert_eq!(c.store.bucket_statistics(2).count, 0);
        assert_eq!(map.assignment(2).unwrap().permanent_owner, Some(b.id.clone()));
        assert_eq!(cluster.acks(), vec![(c.id.clone(), vec![2])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_during_transfer_reach_new_owner() {
        let Cluster { map, cluster, a, b } = two_nodes(config(), None);
        let keys = fill(&a.store, 1, 50);
        let late = keys_in_bucket(&a.store, 1, 51).pop().unwrap();
        let victim = keys[0].clone();

        let source_store = a.store.clone();
        let fired = AtomicBool::new(false);
        let (late_key, victim_key) = (late.clone(), victim.clone());
        cluster.on_serve(move |req| {
            if req.expected_transfer_id == 2 && !fired.swap(true, Ordering::SeqCst) {
                source_store
                    .insert(&late_key, CacheEntry::new("late"), false)
                    .unwrap();
                source_store.remove(&victim_key).unwrap();
            }
        });

        map.plan_move(&[1], &b.id);
        b.driver.do_state_transfer(map.assignments());
        let outcome = wait_for_outcome(&b.driver).await;

        assert_eq!(outcome, TransferOutcome::Completed { local_count: 50 });
        assert_eq!(b.store.get(&late).unwrap().value, b"late".to_vec());
        assert!(b.store.get(&victim).is_none());
        assert_eq!(a.store.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_response_is_replayed_without_loss() {
        let Cluster { map, cluster, a, b } = two_nodes(config(), None);
        let keys = fill(&a.store, 1, 50);
        cluster.inject(&a.id, &[Fault::LostResponse, Fault::Timeout]);

        map.plan_move(&[1], &b.id);
        b.driver.do_state_transfer(map.assignments());
        let outcome = wait_for_outcome(&b.driver).await;

        assert_eq!(outcome, TransferOutcome::Completed { local_count: 50 });
        for key in &keys {
            assert!(b.store.get(key).is_some());
        }
        let ids: Vec<u64> = requests_for(&cluster, 1).into_iter().map(|(_, _, id)| id).collect();
        assert_eq!(&ids[..4], &[1, 1, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_lost_after_first_chunk_restarts_on_new_owner() {
        let Cluster { map, cluster, a, b } = two_nodes(config(), None);
        let c = TestNode::spawn("c", &cluster, &map, config(), None);
        let keys = fill(&a.store, 2, 50);
        let (head, tail) = keys.split_at(25);
        for key in tail {
            c.store.insert(key, CacheEntry::new("from-c"), false).unwrap();
        }

        // ARRANGE: "a" answers the first pull and is gone for the second
        let dying = cluster.clone();
        let owner = a.id.clone();
        let fired = AtomicBool::new(false);
        cluster.on_serve(move |_| {
            if !fired.swap(true, Ordering::SeqCst) {
                dying.kill(&owner);
            }
        });

        map.plan_move(&[2], &b.id);
        b.driver.do_state_transfer(map.assignments());
        while cluster.suspicions() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // ACT
        let mut rows = map.assignments();
        rows[2].permanent_owner = Some(c.id.clone());
        map.install(rows);
        b.driver.do_state_transfer(map.assignments());
        let outcome = wait_for_outcome(&b.driver).await;

        // ASSERT: the chunk from "a" was dropped, c served everything from id 1
        assert_eq!(outcome, TransferOutcome::Completed { local_count: 25 });
        assert!(head.iter().all(|key| b.store.get(key).is_none()));
        for key in tail {
            assert_eq!(b.store.get(key).unwrap().value, b"from-c".to_vec());
        }

        let ids_from = |node: &NodeId| -> Vec<u64> {
            cluster
                .requests()
                .into_iter()
                .filter(|(owner, _)| owner == node)
                .map(|(_, req)| req.expected_transfer_id)
                .collect()
        };
        assert_eq!(ids_from(&a.id), vec![1]);
        let from_c = ids_from(&c.id);
        assert!(from_c.len() >= 2);
        for (i, id) in from_c.iter().enumerate() {
            assert_eq!(*id, i as u64 + 1);
        }
        assert_eq!(cluster.acks(), vec![(c.id.clone(), vec![2])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspected_owner_that_stays_is_asked_again_with_same_id() {
        let Cluster { map, cluster, a, b } = two_nodes(config(), None);
        let keys = fill(&a.store, 1, 50);
        cluster.inject(&a.id, &[Fault::Suspect, Fault::Suspect]);

        map.plan_move(&[1], &b.id);
        b.driver.do_state_transfer(map.assignments());
        let outcome = wait_for_outcome(&b.driver).await;

        assert_eq!(outcome, TransferOutcome::Completed { local_count: 50 });
        for key in &keys {
            assert!(b.store.get(key).is_some());
        }
        assert_eq!(cluster.suspicions(), 2);
        let ids: Vec<u64> = requests_for(&cluster, 1).into_iter().map(|(_, _, id)| id).collect();
        assert_eq!(&ids[..5], &[1, 1, 1, 2, 3]);
        assert!(cluster.requests().iter().all(|(owner, _)| owner == &a.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_timeouts_defer_the_bucket() {
        let Cluster { map, cluster, a, b } = two_nodes(config(), None);
        fill(&a.store, 1, 50);
        cluster.inject(&a.id, &[Fault::Timeout, Fault::Timeout, Fault::Timeout]);

        map.plan_move(&[1], &b.id);
        b.driver.do_state_transfer(map.assignments());
        let outcome = wait_for_outcome(&b.driver).await;

        // ASSERT: three tries of id 1, then a second locked pass from id 1
        assert_eq!(outcome, TransferOutcome::Completed { local_count: 50 });
        let ids: Vec<u64> = requests_for(&cluster, 1).into_iter().map(|(_, _, id)| id).collect();
        assert_eq!(&ids[..5], &[1, 1, 1, 1, 2]);
        let (locks, releases) = lock_release_counts(&b.coordinator.events());
        assert_eq!((locks, releases), (2, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_replica_drops_keys_it_could_not_apply() {
        let entry_size = CacheEntry::new(vec![7u8; VALUE_SIZE]).size_with_key("key_00000");
        let b_config = StateTransferConfig {
            is_sync_replica: true,
            ..config()
        };
        let Cluster { map, a, b, .. } = two_nodes(b_config, Some(entry_size * 10));
        let keys = fill(&a.store, 1, 50);

        // ARRANGE: b holds a stale copy of a key that will not fit any more
        let stale = keys.last().unwrap().clone();
        b.store.insert(&stale, CacheEntry::new("stale"), false).unwrap();

        map.plan_move(&[1], &b.id);
        b.driver.do_state_transfer(map.assignments());
        let outcome = wait_for_outcome(&b.driver).await;

        assert!(matches!(outcome, TransferOutcome::Completed { local_count } if local_count < 50));
        assert!(b.store.get(&stale).is_none());
    }

    // ============================================================
    // DRIVER TESTS
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_every_lock_is_released() {
        let Cluster { map, a, b, .. } = two_nodes(config(), None);
        fill(&a.store, 1, 50);
        fill(&a.store, 2, 40);
        fill(&a.store, 3, 5);

        map.plan_move(&[1, 2, 3], &b.id);
        b.driver.do_state_transfer(map.assignments());
        let outcome = wait_for_outcome(&b.driver).await;

        assert_eq!(outcome, TransferOutcome::Completed { local_count: 95 });
        let events = b.coordinator.events();
        let (locks, releases) = lock_release_counts(&events);
        assert_eq!(locks, 3);
        assert_eq!(locks, releases);
        assert!(events.contains(&CoordinatorEvent::Presence(true)));
        assert!(events.contains(&CoordinatorEvent::End(outcome)));
        assert!(map.lock_holder(1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_lock_defers_and_retries() {
        let Cluster { map, a, b, .. } = two_nodes(config(), None);
        fill(&a.store, 1, 50);
        b.coordinator.fail_locks(3);

        map.plan_move(&[1], &b.id);
        b.driver.do_state_transfer(map.assignments());
        let outcome = wait_for_outcome(&b.driver).await;

        assert_eq!(outcome, TransferOutcome::Completed { local_count: 50 });
        let (locks, releases) = lock_release_counts(&b.coordinator.events());
        assert_eq!((locks, releases), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_fails_the_run() {
        let Cluster { map, cluster, a, b } = two_nodes(config(), None);
        fill(&a.store, 1, 50);
        cluster.inject(&a.id, &[Fault::Fatal]);

        map.plan_move(&[1], &b.id);
        b.driver.do_state_transfer(map.assignments());
        let outcome = wait_for_outcome(&b.driver).await;

        assert!(matches!(outcome, TransferOutcome::Failed(_)));
        let (locks, releases) = lock_release_counts(&b.coordinator.events());
        assert_eq!(locks, releases);
        assert!(b.driver.scheduler().snapshot().await.unwrap().is_queued(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_never_replaced_is_abandoned() {
        let Cluster { map, cluster, a, b } = two_nodes(config(), None);
        fill(&a.store, 1, 50);
        cluster.kill(&a.id);

        map.plan_move(&[1], &b.id);
        b.driver.do_state_transfer(map.assignments());
        let outcome = wait_for_outcome(&b.driver).await;

        // ASSERT: the run ends instead of retrying the dead owner forever
        assert_eq!(outcome, TransferOutcome::Completed { local_count: 0 });
        assert!(cluster.suspicions() >= config().max_resync_attempts);
        assert!(b.driver.scheduler().snapshot().await.unwrap().is_empty());
        let events = b.coordinator.events();
        assert_eq!(lock_release_counts(&events), (1, 1));
        assert!(events.contains(&CoordinatorEvent::End(outcome)));
        assert!(!b.driver.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_update_is_rejected() {
        let Cluster { b, .. } = two_nodes(config(), None);

        let first = b.driver.do_state_transfer(Vec::new());
        let second = b.driver.do_state_transfer(Vec::new());

        assert!(!b.driver.update_state_transfer(&[], first).await);
        assert!(b.driver.update_state_transfer(&[], second).await);
        assert!(b.coordinator.views_installed() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_a_running_transfer() {
        let b_config = StateTransferConfig {
            bytes_per_second: 1_000,
            ..config()
        };
        let Cluster { map, a, b, .. } = two_nodes(b_config, None);
        fill(&a.store, 1, 50);

        map.plan_move(&[1], &b.id);
        b.driver.do_state_transfer(map.assignments());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        b.driver.stop().await;
        let outcome = wait_for_outcome(&b.driver).await;

        assert_eq!(outcome, TransferOutcome::Cancelled);
        let (locks, releases) = lock_release_counts(&b.coordinator.events());
        assert_eq!(locks, releases);
        assert!(!b.store.is_filtered(1));
        assert!(
            !b.driver
                .update_state_transfer(&map.assignments(), b.driver.current_update_id())
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_filter_is_lifted_after_transfer() {
        let Cluster { map, a, b, .. } = two_nodes(config(), None);
        let keys = fill(&a.store, 1, 5);

        map.plan_move(&[1], &b.id);
        b.driver.do_state_transfer(map.assignments());
        wait_for_outcome(&b.driver).await;

        assert!(!b.store.is_filtered(1));
        assert_eq!(b.store.query_keys("key_"), keys);
        assert!(!a.store.is_filtered(1));
    }
}
