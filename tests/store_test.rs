//! Integration tests for single-key operations.
//!
//! These tests validate:
//! - Per-key serialization of read-modify-write callbacks
//! - Read parallelism bounded by the per-key budget
//! - Urgent traffic overtaking queued normal work
//! - Hard and break deadlines
//! - Idle-death garbage collection
//! - Crash reclamation and shutdown behavior

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hivemap::builders::StoreBuilder;
use hivemap::core::{CallTimeout, Mutation, Parallelism, Priority, StoreError};
use hivemap::runtime::{SharedSpawner, TokioSpawner};
use hivemap::store::{CallOptions, Store};

fn counter_store(initial: u64) -> Store<&'static str, u64> {
    StoreBuilder::new().entry("a", initial).build().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hundred_parallel_increments_serialize() {
    let store = counter_store(0);
    let mut calls = Vec::new();
    for _ in 0..100 {
        let store = store.clone();
        calls.push(tokio::spawn(async move {
            store
                .get_and_update("a", |v| {
                    let n = v.unwrap_or(0) + 1;
                    (n, Mutation::Put(n))
                })
                .await
                .unwrap();
        }));
    }
    futures::future::join_all(calls).await;
    assert_eq!(store.fetch("a").await.unwrap(), Some(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn read_parallelism_respects_budget() {
    let store: Store<&str, u64> = StoreBuilder::new()
        .entry("a", 7)
        .max_processes(Parallelism::Bounded(3))
        .build()
        .unwrap();

    // Promote the key and pin its worker so every read takes the worker
    // path: two child slots plus the worker's own loop for the overflow.
    store.keep_alive("a", true).unwrap();
    store.sync().await.unwrap();

    let running = Arc::new(AtomicU64::new(0));
    let peak = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let mut reads = Vec::new();
    for _ in 0..5 {
        let store = store.clone();
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        reads.push(tokio::spawn(async move {
            store
                .get("a", move |v| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(200));
                    running.fetch_sub(1, Ordering::SeqCst);
                    v
                })
                .await
                .unwrap()
        }));
    }
    for read in reads {
        assert_eq!(read.await.unwrap(), Some(7));
    }

    let elapsed = started.elapsed();
    assert!(
        peak.load(Ordering::SeqCst) <= 3,
        "read budget exceeded: {} concurrent",
        peak.load(Ordering::SeqCst)
    );
    // Parallel waves, far from the 1s a fully serial drain takes.
    assert!(elapsed < Duration::from_millis(850), "took {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn urgent_read_overtakes_queued_normals() {
    let store = counter_store(0);

    // Occupy the worker so everything below queues behind it.
    store
        .cast("a", |v| {
            std::thread::sleep(Duration::from_millis(100));
            Mutation::Put(v.unwrap_or(0))
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    for _ in 0..10 {
        store.cast("a", |v| Mutation::Put(v.unwrap_or(0) + 1)).unwrap();
    }
    let seen = store
        .get_with("a", CallOptions::urgent(), |v| v.unwrap_or(0))
        .await
        .unwrap();
    assert!(seen <= 1, "urgent read should beat queued normals, saw {seen}");

    store.sync().await.unwrap();
    assert_eq!(store.fetch("a").await.unwrap(), Some(10));
}

#[tokio::test]
async fn now_priority_reads_current_value() {
    let store = counter_store(42);
    let seen = store
        .get_with("a", CallOptions::now(), |v| v.unwrap_or(0))
        .await
        .unwrap();
    assert_eq!(seen, 42);
}

#[tokio::test]
async fn round_trip_put_get_delete_default() {
    let store: Store<String, String> = StoreBuilder::new().build().unwrap();
    store.put("k".into(), "v".into()).await.unwrap();
    assert_eq!(store.fetch("k".into()).await.unwrap(), Some("v".into()));

    store.delete("k".into()).await.unwrap();
    let with_default = store
        .get("k".into(), |v| v.unwrap_or_else(|| "fallback".into()))
        .await
        .unwrap();
    assert_eq!(with_default, "fallback");
}

#[tokio::test]
async fn keep_callback_never_mutates_and_pop_is_idempotent() {
    let store = counter_store(5);

    let before = store
        .get_and_update("a", |v| (v, Mutation::Keep))
        .await
        .unwrap();
    assert_eq!(before, Some(5));
    assert_eq!(store.fetch("a").await.unwrap(), Some(5));

    assert_eq!(store.pop("a").await.unwrap(), Some(5));
    // A keep after the pop observes and preserves the absence.
    let after = store
        .get_and_update("a", |v| (v, Mutation::Keep))
        .await
        .unwrap();
    assert_eq!(after, None);
    assert_eq!(store.pop("a").await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn break_deadline_abandons_overrunning_callback() {
    let store = counter_store(1);
    let opts = CallOptions::new().with_timeout(CallTimeout::Break(Duration::from_millis(50)));
    let err = store
        .get_and_update_with("a", opts, |_| {
            std::thread::sleep(Duration::from_millis(400));
            (0, Mutation::Put(99))
        })
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::TooLong);

    // The abandoned callback's mutation was discarded.
    assert_eq!(store.fetch("a").await.unwrap(), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hard_deadline_expires_queued_request() {
    let store = counter_store(0);
    store
        .cast("a", |_| {
            std::thread::sleep(Duration::from_millis(120));
            Mutation::Keep
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let opts = CallOptions::new().with_timeout(CallTimeout::Hard(Duration::from_millis(30)));
    let err = store
        .get_and_update_with("a", opts, |v| (v, Mutation::Put(1)))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::Expired);
    store.sync().await.unwrap();
    assert_eq!(store.fetch("a").await.unwrap(), Some(0));
}

#[tokio::test]
async fn idle_worker_dies_and_empty_key_is_collected() {
    let store: Store<&str, u64> = StoreBuilder::new()
        .idle_wait(Duration::from_millis(40))
        .build()
        .unwrap();

    store.put("a", 1).await.unwrap();
    store.delete("a").await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store.keys().await.unwrap().is_empty());
    assert_eq!(store.fetch("a").await.unwrap(), None);

    let stats = store.stats().await.unwrap();
    assert!(stats.retirements >= 1);
    assert_eq!(stats.live_workers, 0);
}

#[tokio::test]
async fn idle_worker_keeps_value_in_a_cell() {
    let store: Store<&str, u64> = StoreBuilder::new()
        .idle_wait(Duration::from_millis(40))
        .build()
        .unwrap();

    store.put("a", 9).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.live_workers, 0, "worker should have retired");
    assert_eq!(stats.keys, 1, "value must survive the worker");
    assert_eq!(store.fetch("a").await.unwrap(), Some(9));
}

#[tokio::test]
async fn absent_key_reads_never_materialize_state() {
    let store: Store<&str, u64> = StoreBuilder::new().build().unwrap();
    assert_eq!(store.fetch("ghost").await.unwrap(), None);
    assert!(!store.has_key("ghost").await.unwrap());
    assert!(store.keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn budget_override_is_remembered_and_collected() {
    let store: Store<&str, u64> = StoreBuilder::new().build().unwrap();

    store.set_max_processes("a", Parallelism::Bounded(9)).unwrap();
    store.sync().await.unwrap();
    assert_eq!(store.keys().await.unwrap(), vec!["a"]);

    // Restoring the default makes the empty cell garbage again.
    store.set_max_processes("a", Parallelism::DEFAULT).unwrap();
    store.sync().await.unwrap();
    assert!(store.keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn keep_alive_pins_worker_against_idle_death() {
    let store: Store<&str, u64> = StoreBuilder::new()
        .idle_wait(Duration::from_millis(30))
        .build()
        .unwrap();

    store.keep_alive("a", true).unwrap();
    store.put("a", 1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.stats().await.unwrap().live_workers, 1);

    store.keep_alive("a", false).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.stats().await.unwrap().live_workers, 0);
    assert_eq!(store.fetch("a").await.unwrap(), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_callback_loses_only_its_key() {
    let store = counter_store(3);

    let err = store
        .get_and_update("a", |_| -> (u64, Mutation<u64>) {
            panic!("user callback exploded");
        })
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::WorkerCrashed);

    // The server reclaims the key as absent and keeps serving it.
    store.put("a", 11).await.unwrap();
    assert_eq!(store.fetch("a").await.unwrap(), Some(11));
}

#[tokio::test]
async fn stopped_store_rejects_everything() {
    let store = counter_store(0);
    let second_handle = store.clone();
    store.put("a", 2).await.unwrap();

    second_handle.clone().stop().await.unwrap();
    let err = second_handle.put("a", 3).await.unwrap_err();
    assert_eq!(err, StoreError::Shutdown);
}

#[tokio::test]
async fn stats_track_promotions_and_routing() {
    let store = counter_store(0);
    store.put("a", 1).await.unwrap();
    store.fetch("a").await.unwrap();

    let stats = store.stats().await.unwrap();
    assert!(stats.promotions >= 1);
    assert!(stats.routed_requests >= 2);
    assert_eq!(stats.transactions, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_keys_run_independent_workers() {
    let store: Store<u32, u64> = StoreBuilder::new().build().unwrap();
    let mut calls = Vec::new();
    for key in 0..20 {
        let store = store.clone();
        calls.push(tokio::spawn(async move {
            store.put(key, u64::from(key) * 10).await.unwrap();
        }));
    }
    futures::future::join_all(calls).await;

    assert_eq!(store.len().await.unwrap(), 20);
    for key in 0..20 {
        assert_eq!(store.fetch(key).await.unwrap(), Some(u64::from(key) * 10));
    }
}

#[test]
fn blocking_api_works_off_runtime() {
    let spawner: SharedSpawner = Arc::new(TokioSpawner::owned_runtime().unwrap());
    let store: Store<&str, u64> = StoreBuilder::new().spawner(spawner).build().unwrap();

    store.put_blocking("k", 5).unwrap();
    assert_eq!(store.fetch_blocking("k").unwrap(), Some(5));
    assert_eq!(store.get_blocking("k", |v| v.unwrap_or(0) * 2).unwrap(), 10);
}

#[tokio::test]
async fn priority_shorthands_compose() {
    let opts = CallOptions::new()
        .with_priority(Priority::AboveAvg)
        .with_timeout(CallTimeout::Infinite);
    let store = counter_store(1);
    let value = store.get_with("a", opts, |v| v.unwrap_or(0)).await.unwrap();
    assert_eq!(value, 1);
}
