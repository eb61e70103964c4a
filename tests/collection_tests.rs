use stale_cache::{BoxError, CacheError, CachedCollection, ManualClock};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::assert_err;

type Batches = Arc<Mutex<Vec<HashSet<i32>>>>;

/// Batch fetch that records every key set it is called with and resolves
/// each key to `value_<key>`.
fn recording_fetch(
    batches: Batches,
) -> impl Fn(HashSet<i32>) -> futures::future::BoxFuture<'static, Result<HashMap<i32, String>, BoxError>>
{
    use futures::FutureExt;
    move |keys: HashSet<i32>| {
        let batches = batches.clone();
        async move {
            batches.lock().unwrap().push(keys.clone());
            Ok(keys
                .into_iter()
                .map(|key| (key, format!("value_{key}")))
                .collect())
        }
        .boxed()
    }
}

#[tokio::test]
async fn test_fetches_only_missing_keys() {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let cache =
        CachedCollection::new(recording_fetch(batches.clone()), Duration::from_secs(10)).unwrap();

    let first = cache.get_data(&HashSet::from([1, 2, 3])).await.unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(first[&2], "value_2");

    let second = cache
        .get_data(&HashSet::from([1, 2, 3, 4, 5, 6]))
        .await
        .unwrap();
    assert_eq!(second.len(), 6);
    assert_eq!(cache.size(), 6);

    let recorded = batches.lock().unwrap().clone();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0], HashSet::from([1, 2, 3]));
    assert_eq!(recorded[1], HashSet::from([4, 5, 6]));
}

#[tokio::test]
async fn test_overlapping_concurrent_requests_coalesce() {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let cache =
        CachedCollection::new(recording_fetch(batches.clone()), Duration::from_secs(10)).unwrap();

    let left = HashSet::from([1, 2]);
    let right = HashSet::from([2, 3]);
    let (first, second) = tokio::join!(cache.get_data(&left), cache.get_data(&right));

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    assert_eq!(second[&3], "value_3");

    // Both requests were covered by a single underlying fetch for the union
    // of their missing keys.
    let recorded = batches.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0], HashSet::from([1, 2, 3]));
}

#[tokio::test]
async fn test_partial_results_are_omitted_without_error() {
    use futures::FutureExt;
    let cache = CachedCollection::new(
        |keys: HashSet<i32>| {
            async move {
                // Only even keys exist in the backend.
                Ok::<_, BoxError>(
                    keys.into_iter()
                        .filter(|key| key % 2 == 0)
                        .map(|key| (key, key * 10))
                        .collect::<HashMap<_, _>>(),
                )
            }
            .boxed()
        },
        Duration::from_secs(10),
    )
    .unwrap();

    let response = cache.get_data(&HashSet::from([1, 2, 3, 4])).await.unwrap();
    assert_eq!(response.len(), 2);
    assert_eq!(response[&2], 20);
    assert_eq!(response[&4], 40);
    assert!(!response.contains_key(&1));
    assert_eq!(cache.size(), 2);
}

#[tokio::test]
async fn test_delete_returns_removed_count() {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let cache =
        CachedCollection::new(recording_fetch(batches.clone()), Duration::from_secs(10)).unwrap();

    cache.get_data(&HashSet::from([1, 2])).await.unwrap();
    assert_eq!(cache.size(), 2);

    assert_eq!(cache.delete([1, 2]), 2);
    assert_eq!(cache.delete([1, 2]), 0);
    assert_eq!(cache.size(), 0);

    // Deleted keys are fetched again on the next request.
    cache.get_data(&HashSet::from([1])).await.unwrap();
    assert_eq!(batches.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_purge_removes_only_overdue_entries() {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let clock = ManualClock::new(0);
    let cache =
        CachedCollection::new(recording_fetch(batches.clone()), Duration::from_millis(10))
            .unwrap()
            .with_clock(clock.clone());

    cache.get_data(&HashSet::from([1, 2])).await.unwrap();
    assert_eq!(cache.size(), 2);

    // Touch key 1 so only key 2 goes overdue.
    clock.advance(20);
    cache.get_data(&HashSet::from([1])).await.unwrap();

    assert_eq!(cache.purge(), 1);
    assert_eq!(cache.size(), 1);
    assert!(
        cache
            .get_data(&HashSet::from([1]))
            .await
            .unwrap()
            .contains_key(&1)
    );
    assert_eq!(cache.purge(), 0);
}

#[tokio::test]
async fn test_background_purge_empties_idle_collection() {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let cache =
        CachedCollection::new(recording_fetch(batches.clone()), Duration::from_millis(25)).unwrap();

    cache.get_data(&HashSet::from([1, 2, 3])).await.unwrap();
    assert_eq!(cache.size(), 3);

    // The owned purge task sweeps untouched entries without any further
    // calls into the cache.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(cache.size(), 0);
}

#[tokio::test]
async fn test_decoupled_purge_interval_controls_sweep_timing() {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let cache = CachedCollection::new(recording_fetch(batches.clone()), Duration::from_millis(20))
        .unwrap()
        .with_purge_interval(Duration::from_millis(80))
        .unwrap();

    cache.get_data(&HashSet::from([1])).await.unwrap();
    assert_eq!(cache.size(), 1);

    // Well past the TTL but before the first sweep: the overdue entry is
    // still held, because expiry is only enforced by the purge task.
    tokio::time::sleep(Duration::from_millis(45)).await;
    assert_eq!(cache.size(), 1);

    // After the decoupled interval elapses the sweep removes it.
    tokio::time::sleep(Duration::from_millis(140)).await;
    assert_eq!(cache.size(), 0);
}

#[tokio::test]
async fn test_key_guard_rejects_before_fetch() {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let cache =
        CachedCollection::new(recording_fetch(batches.clone()), Duration::from_secs(10))
            .unwrap()
            .with_key_guard(|key: &i32| *key > 0);

    let result = cache.get_data(&HashSet::from([1, -2, 3])).await;
    let err = assert_err!(result);
    assert!(matches!(err, CacheError::InvalidKeys(_)));
    assert!(err.to_string().contains("-2"));

    // Validation precedes all side effects.
    assert!(batches.lock().unwrap().is_empty());
    assert_eq!(cache.size(), 0);
    assert_eq!(cache.entries_in_progress(), 0);

    let valid = cache.get_data(&HashSet::from([1, 3])).await.unwrap();
    assert_eq!(valid.len(), 2);
}

#[tokio::test]
async fn test_fetch_error_clears_in_flight_and_allows_retry() {
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = CachedCollection::new(
        move |keys: HashSet<i32>| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Err::<HashMap<i32, i32>, BoxError>("backend down".into())
                } else {
                    Ok(keys.into_iter().map(|key| (key, key)).collect())
                }
            }
            .boxed()
        },
        Duration::from_secs(10),
    )
    .unwrap();

    let failure = cache.get_data(&HashSet::from([1, 2])).await;
    let err = assert_err!(failure);
    assert!(err.to_string().contains("backend down"));
    assert_eq!(cache.size(), 0);
    assert_eq!(cache.entries_in_progress(), 0);

    let retry = cache.get_data(&HashSet::from([1, 2])).await.unwrap();
    assert_eq!(retry.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_entries_in_progress_reflects_active_fetches() {
    use futures::FutureExt;

    let cache = Arc::new(
        CachedCollection::new(
            |keys: HashSet<i32>| {
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, BoxError>(
                        keys.into_iter()
                            .map(|key| (key, key))
                            .collect::<HashMap<_, _>>(),
                    )
                }
                .boxed()
            },
            Duration::from_secs(10),
        )
        .unwrap(),
    );

    let request = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_data(&HashSet::from([1, 2])).await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.entries_in_progress(), 2);
    assert_eq!(cache.size(), 0);

    request.await.unwrap().unwrap();
    assert_eq!(cache.entries_in_progress(), 0);
    assert_eq!(cache.size(), 2);
}

#[tokio::test]
async fn test_struct_values_and_string_keys() {
    use futures::FutureExt;

    #[derive(Debug, Clone, PartialEq)]
    struct Profile {
        id: String,
        score: u32,
    }

    let cache = CachedCollection::new(
        |keys: HashSet<String>| {
            async move {
                Ok::<_, BoxError>(
                    keys.into_iter()
                        .map(|key| {
                            let profile = Profile {
                                id: key.clone(),
                                score: key.len() as u32,
                            };
                            (key, profile)
                        })
                        .collect::<HashMap<_, _>>(),
                )
            }
            .boxed()
        },
        Duration::from_secs(10),
    )
    .unwrap();

    let response = cache
        .get_data(&HashSet::from(["alice".to_string(), "bob".to_string()]))
        .await
        .unwrap();
    assert_eq!(
        response["alice"],
        Profile {
            id: "alice".to_string(),
            score: 5
        }
    );
    assert_eq!(cache.size(), 2);
}
