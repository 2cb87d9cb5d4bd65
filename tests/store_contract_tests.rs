//! Contract checks every `ClusterStore` backend must satisfy, run against
//! the in-memory reference implementation through the trait object.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use keyflow::clock::ManualClock;
use keyflow::store::{ClusterStore, InMemoryStore, StoreEventType};

fn store() -> (Arc<ManualClock>, Arc<dyn ClusterStore>) {
    let clock = Arc::new(ManualClock::starting_now());
    let store: Arc<dyn ClusterStore> = Arc::new(InMemoryStore::with_clock(clock.clone()));
    (clock, store)
}

const TTL: Duration = Duration::from_secs(60);

#[tokio::test]
async fn put_if_absent_is_exclusive_until_expiry() {
    let (clock, store) = store();

    assert!(store
        .put_if_absent("k", Bytes::from_static(b"first"), Duration::from_secs(10))
        .await
        .unwrap());
    assert!(!store
        .put_if_absent("k", Bytes::from_static(b"second"), TTL)
        .await
        .unwrap());

    clock.advance(Duration::from_secs(11));
    assert!(store
        .put_if_absent("k", Bytes::from_static(b"second"), TTL)
        .await
        .unwrap());
    assert_eq!(store.get("k").await.unwrap().unwrap().as_ref(), b"second");
}

#[tokio::test]
async fn cas_requires_exact_current_bytes() {
    let (_, store) = store();
    store.put("k", Bytes::from_static(b"v1"), TTL).await.unwrap();

    // Wrong expected value loses.
    assert!(!store
        .compare_and_set("k", b"v0", Bytes::from_static(b"v2"), TTL)
        .await
        .unwrap());
    // Exact bytes win.
    assert!(store
        .compare_and_set("k", b"v1", Bytes::from_static(b"v2"), TTL)
        .await
        .unwrap());
    // The old snapshot is now stale.
    assert!(!store
        .compare_and_set("k", b"v1", Bytes::from_static(b"v3"), TTL)
        .await
        .unwrap());
}

#[tokio::test]
async fn absent_key_never_matches_an_expected_value() {
    let (_, store) = store();
    assert!(!store
        .compare_and_set("missing", b"anything", Bytes::from_static(b"v"), TTL)
        .await
        .unwrap());
    assert!(store.get("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn only_one_of_many_concurrent_cas_callers_wins() {
    let (_, store) = store();
    store.put("k", Bytes::from_static(b"base"), TTL).await.unwrap();

    let mut handles = Vec::new();
    for n in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .compare_and_set("k", b"base", Bytes::from(format!("w{n}")), TTL)
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn scan_is_prefix_scoped_and_sorted() {
    let (_, store) = store();
    store.put("b:2", Bytes::from_static(b"y"), TTL).await.unwrap();
    store.put("b:1", Bytes::from_static(b"x"), TTL).await.unwrap();
    store.put("a:1", Bytes::from_static(b"z"), TTL).await.unwrap();

    let results = store.scan("b:").await.unwrap();
    let keys: Vec<_> = results.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["b:1", "b:2"]);
}

#[tokio::test]
async fn watch_sees_put_delete_and_expire() {
    let (clock, store) = store();
    let mut watch = store.watch("w:");

    store
        .put("w:k", Bytes::from_static(b"v"), Duration::from_secs(5))
        .await
        .unwrap();
    let put = watch.recv().await.unwrap();
    assert_eq!(put.event_type, StoreEventType::Put);

    store.delete("w:k").await.unwrap();
    let deleted = watch.recv().await.unwrap();
    assert_eq!(deleted.event_type, StoreEventType::Delete);

    store
        .put("w:k", Bytes::from_static(b"v2"), Duration::from_secs(5))
        .await
        .unwrap();
    watch.recv().await.unwrap();

    // Lazy expiry is observable through the watch stream.
    clock.advance(Duration::from_secs(6));
    assert!(store.get("w:k").await.unwrap().is_none());
    let expired = watch.recv().await.unwrap();
    assert_eq!(expired.event_type, StoreEventType::Expire);
}
