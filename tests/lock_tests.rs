//! Distributed lock semantics over the in-memory store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use keyflow::clock::{Clock, ManualClock};
use keyflow::cluster::keys;
use keyflow::cluster::{DistributedLock, LockRecord};
use keyflow::store::{encode, ClusterStore, InMemoryStore};

fn locks() -> (Arc<ManualClock>, DistributedLock) {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
    (clock.clone(), DistributedLock::with_clock(store, clock))
}

/// Lease lifecycle: acquire at t=0 with a 5s lease, contender fails,
/// refresh at t=2 pushes expiry to t=7, still owned at t=6, contender
/// succeeds past t=7.
#[tokio::test]
async fn lease_refresh_and_takeover_timeline() {
    let (clock, locks) = locks();
    let lease = Duration::from_secs(5);

    // t=0: node-1 acquires.
    let acquired = locks
        .try_acquire("job", "node-1", lease, HashMap::new())
        .await
        .unwrap()
        .unwrap();

    // t=0: node-2 fails.
    assert!(locks
        .try_acquire("job", "node-2", lease, HashMap::new())
        .await
        .unwrap()
        .is_none());

    // t=2: node-1 refreshes; new expiry is t=7.
    clock.advance(Duration::from_secs(2));
    let refreshed = locks
        .refresh("job", "node-1", lease)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        refreshed.lease_expires_at - acquired.lease_expires_at,
        chrono::Duration::seconds(2)
    );

    // t=6: still owned by node-1, node-2 still fails.
    clock.advance(Duration::from_secs(4));
    let current = locks.get_lock("job").await.unwrap().unwrap();
    assert_eq!(current.owner_node_id, "node-1");
    assert!(locks
        .try_acquire("job", "node-2", lease, HashMap::new())
        .await
        .unwrap()
        .is_none());

    // Past t=7: node-2 takes over.
    clock.advance(Duration::from_secs(2));
    let taken = locks
        .try_acquire("job", "node-2", lease, HashMap::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(taken.owner_node_id, "node-2");
}

#[tokio::test]
async fn at_most_one_concurrent_caller_wins() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
    let locks = Arc::new(DistributedLock::with_clock(store, clock));

    let mut handles = Vec::new();
    for n in 0..10 {
        let locks = Arc::clone(&locks);
        handles.push(tokio::spawn(async move {
            locks
                .try_acquire(
                    "job",
                    &format!("node-{n}"),
                    Duration::from_secs(30),
                    HashMap::new(),
                )
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn metadata_round_trips_and_survives_refresh() {
    let (_, locks) = locks();
    let mut metadata = HashMap::new();
    metadata.insert("purpose".to_string(), "compaction".to_string());
    metadata.insert("partition".to_string(), "3".to_string());

    locks
        .try_acquire("job", "node-1", Duration::from_secs(30), metadata.clone())
        .await
        .unwrap()
        .unwrap();

    let refreshed = locks
        .refresh("job", "node-1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.metadata, metadata);

    let read = locks.get_lock("job").await.unwrap().unwrap();
    assert_eq!(read.metadata, metadata);
}

#[tokio::test]
async fn stale_owner_cannot_release_a_successor() {
    let (clock, locks) = locks();
    let lease = Duration::from_secs(5);

    locks
        .try_acquire("job", "node-1", lease, HashMap::new())
        .await
        .unwrap()
        .unwrap();

    // node-1's lease lapses and node-2 takes over.
    clock.advance(Duration::from_secs(6));
    locks
        .try_acquire("job", "node-2", lease, HashMap::new())
        .await
        .unwrap()
        .unwrap();

    // The stale owner's release must not delete node-2's record.
    assert!(!locks.release("job", "node-1").await.unwrap());
    let current = locks.get_lock("job").await.unwrap().unwrap();
    assert_eq!(current.owner_node_id, "node-2");
}

/// Backends may retain a record past its lease. The stale owner can then
/// neither refresh nor release it, and any caller may claim it via CAS.
#[tokio::test]
async fn lingering_expired_record_is_not_owned_by_anyone() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
    let locks = DistributedLock::with_clock(store.clone(), clock.clone());

    let stale = LockRecord {
        name: "job".to_string(),
        owner_node_id: "node-1".to_string(),
        lease_expires_at: clock.now() - chrono::Duration::seconds(1),
        metadata: HashMap::new(),
    };
    store
        .put(
            &keys::lock_key("job"),
            encode(&stale).unwrap(),
            Duration::from_secs(600),
        )
        .await
        .unwrap();

    assert!(locks
        .refresh("job", "node-1", Duration::from_secs(5))
        .await
        .unwrap()
        .is_none());
    assert!(!locks.release("job", "node-1").await.unwrap());

    let taken = locks
        .try_acquire("job", "node-2", Duration::from_secs(5), HashMap::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(taken.owner_node_id, "node-2");
}

#[tokio::test]
async fn snapshot_reflects_live_locks() {
    let (clock, locks) = locks();
    locks
        .try_acquire("alpha", "node-1", Duration::from_secs(3), HashMap::new())
        .await
        .unwrap()
        .unwrap();
    locks
        .try_acquire("beta", "node-2", Duration::from_secs(60), HashMap::new())
        .await
        .unwrap()
        .unwrap();

    let all = locks.snapshot().await.unwrap();
    assert_eq!(all.len(), 2);

    clock.advance(Duration::from_secs(4));
    let live = locks.snapshot().await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live["beta"].owner_node_id, "node-2");
}
