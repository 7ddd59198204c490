//! Verifies the cache paths emit their expected metric keys.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use metrics_util::debugging::DebuggingRecorder;
use sincro::{CacheConfig, MutationOptions, OptimisticUpdate, QueryKey, RemoteError, SyncCache};
use tokio::sync::watch;

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    sincro::describe_metrics();

    let cache = SyncCache::new(CacheConfig {
        gc_grace_ms: 0,
        ..Default::default()
    });

    // Miss then hit
    let key = QueryKey::root("comments").with("a1");
    cache
        .ensure_fresh(&key, || async { Ok::<_, RemoteError>(1u32) })
        .await
        .expect("miss path");
    cache
        .ensure_fresh(&key, || async { Ok::<_, RemoteError>(1u32) })
        .await
        .expect("hit path");

    // Join: two concurrent callers, one gated remote call
    let join_key = QueryKey::root("dues");
    let calls = Arc::new(AtomicUsize::new(0));
    let (release, gate) = watch::channel(false);
    let fetch = {
        let calls = Arc::clone(&calls);
        move || {
            let calls = Arc::clone(&calls);
            let mut gate = gate.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let released = *gate.borrow();
                if !released {
                    let _ = gate.changed().await;
                }
                Ok::<_, RemoteError>(2u32)
            }
        }
    };
    let first = tokio::spawn({
        let cache = cache.clone();
        let key = join_key.clone();
        let fetch = fetch.clone();
        async move { cache.ensure_fresh(&key, fetch).await }
    });
    let second = tokio::spawn({
        let cache = cache.clone();
        let key = join_key.clone();
        async move { cache.ensure_fresh(&key, fetch).await }
    });
    while calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    release.send(true).expect("release gate");
    first.await.expect("join").expect("fetch");
    second.await.expect("join").expect("fetch");

    // Fetch error
    let error_key = QueryKey::root("audit");
    let _ = cache
        .ensure_fresh(&error_key, || async {
            Err::<u32, _>(RemoteError::server(500, "boom"))
        })
        .await;

    // Optimistic apply + rollback
    let like_key = QueryKey::root("likes").with("post-1");
    cache.prime(&like_key, 5u32);
    let _ = cache
        .mutate(
            (),
            |()| async { Err::<(), _>(RemoteError::network("offline")) },
            MutationOptions::new().optimistic(
                OptimisticUpdate::new()
                    .patch::<u32, _>(like_key.clone(), |count| count.unwrap_or(0) + 1),
            ),
        )
        .await;

    // Invalidation fan-out
    cache.invalidate(&QueryKey::root("comments")).await;

    // GC sweep
    let detached = QueryKey::root("categories");
    let sub = cache.subscribe(detached.clone(), Arc::new(|_| {}));
    cache.prime(&detached, 0u32);
    sub.unsubscribe();
    assert_eq!(cache.sweep_detached(), 1);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "sincro_cache_hit_total",
        "sincro_cache_miss_total",
        "sincro_fetch_join_total",
        "sincro_fetch_error_total",
        "sincro_fetch_ms",
        "sincro_optimistic_apply_total",
        "sincro_rollback_total",
        "sincro_mutation_ms",
        "sincro_invalidated_keys_total",
        "sincro_gc_evicted_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
