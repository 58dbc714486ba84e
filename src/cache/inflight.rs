//! Per-key request coalescing.
//!
//! The first caller for a key spawns the producer on the Tokio runtime and
//! parks a [`Shared`] handle to it in the registry; every concurrent caller
//! for the same key awaits that handle instead of starting its own fetch.
//! The slot is released by the producer task itself when it finishes (or
//! panics), so it is removed exactly once no matter how many callers joined
//! or how many of them stopped waiting.
//!
//! Slots are tagged with the write epoch their fetch started under. A caller
//! arriving under a newer epoch never joins an older fetch: that fetch may
//! carry data an invalidation already discarded, so a new one is started in
//! its place.

use super::stats::AtomicStats;
use crate::{Error, ErrorContext, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Handle to an outstanding producer call. Cloneable; every clone resolves
/// to the same value or the same error.
pub type SharedFetch<V> = Shared<BoxFuture<'static, Result<V>>>;

struct Slot<V> {
    id: u64,
    epoch: u64,
    fetch: SharedFetch<V>,
}

type Slots<V> = Arc<Mutex<HashMap<String, Slot<V>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the slot when the producer task ends, including by panic.
struct Release<V> {
    slots: Slots<V>,
    key: String,
    id: u64,
}

impl<V> Drop for Release<V> {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        // a newer slot may already occupy the key; leave it alone
        if slots.get(&self.key).map(|s| s.id) == Some(self.id) {
            slots.remove(&self.key);
        }
    }
}

pub struct InFlightRegistry<V> {
    slots: Slots<V>,
    next_id: AtomicU64,
    stats: Arc<AtomicStats>,
}

impl<V> InFlightRegistry<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_stats(Arc::new(AtomicStats::default()))
    }

    pub(crate) fn with_stats(stats: Arc<AtomicStats>) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            stats,
        }
    }

    /// Await the outstanding fetch for `key`, starting it with `producer` if
    /// there is none. `producer` is invoked at most once per call and never
    /// when a fetch is already outstanding.
    ///
    /// Dropping the returned future does not cancel the producer.
    pub async fn register_or_join<F, Fut>(&self, key: &str, producer: F) -> Result<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let (fetch, _) = self.join_or_spawn(key, producer);
        fetch.await
    }

    /// Non-suspending variant of [`register_or_join`](Self::register_or_join).
    /// Returns the shared handle and whether an existing fetch was joined.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn join_or_spawn<F, Fut>(&self, key: &str, producer: F) -> (SharedFetch<V>, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        self.join_or_spawn_at(key, 0, producer)
    }

    /// Like [`join_or_spawn`](Self::join_or_spawn), but only joins a fetch
    /// that started under the same `epoch`. An outstanding fetch from an
    /// older epoch is superseded: it keeps running for the callers already
    /// waiting on it, while new callers share the fetch started here.
    pub fn join_or_spawn_at<F, Fut>(
        &self,
        key: &str,
        epoch: u64,
        producer: F,
    ) -> (SharedFetch<V>, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get(key) {
            if slot.epoch == epoch {
                debug!(key, "joining in-flight fetch");
                AtomicStats::bump(&self.stats.coalesced);
                return (slot.fetch.clone(), true);
            }
            debug!(key, stale_epoch = slot.epoch, epoch, "superseding in-flight fetch");
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let release = Release {
            slots: Arc::clone(&self.slots),
            key: key.to_string(),
            id,
        };
        AtomicStats::bump(&self.stats.fetches);
        debug!(key, "starting fetch");

        // The slot map is still locked here, so the task cannot release
        // its slot before it has been inserted.
        let handle = tokio::spawn(async move {
            let _release = release;
            producer().await
        });
        let owned_key = key.to_string();
        let fetch = async move {
            match handle.await {
                Ok(out) => out,
                Err(e) => Err(Error::runtime_with_context(
                    format!("producer task failed: {}", e),
                    ErrorContext::new()
                        .with_field_path(owned_key)
                        .with_source("inflight"),
                )),
            }
        }
        .boxed()
        .shared();

        slots.insert(
            key.to_string(),
            Slot {
                id,
                epoch,
                fetch: fetch.clone(),
            },
        );
        (fetch, false)
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.slots).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for InFlightRegistry<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn slow_producer(
        calls: Arc<AtomicUsize>,
        value: u32,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<u32>> + Send + 'static {
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_producer_call() {
        let registry = Arc::new(InFlightRegistry::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let waits = (0..8).map(|i| {
            let registry = Arc::clone(&registry);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                registry
                    .register_or_join("event-detail:42", slow_producer(calls, 100 + i))
                    .await
            })
        });
        let results = join_all(waits).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let values: Vec<u32> = results.into_iter().map(|r| r.unwrap().unwrap()).collect();
        assert!(values.windows(2).all(|w| w[0] == w[1]));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_error_is_shared_by_all_joiners() {
        let registry = InFlightRegistry::<u32>::new();
        let producer = || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err::<u32, Error>(Error::transient("timeout"))
        };
        let (first, joined_first) = registry.join_or_spawn("profile:7", producer);
        let (second, joined_second) =
            registry.join_or_spawn("profile:7", || async { Ok::<u32, Error>(1) });
        assert!(!joined_first);
        assert!(joined_second);

        let (a, b) = futures::join!(first, second);
        assert!(a.unwrap_err().is_transient());
        assert!(b.unwrap_err().is_transient());
        assert!(!registry.contains("profile:7"));
    }

    #[tokio::test]
    async fn test_different_keys_do_not_coalesce() {
        let registry = InFlightRegistry::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (a, b) = futures::join!(
            registry.register_or_join("a:1", slow_producer(Arc::clone(&calls), 1)),
            registry.register_or_join("a:2", slow_producer(Arc::clone(&calls), 2)),
        );
        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abandoned_wait_does_not_cancel_producer() {
        let registry = InFlightRegistry::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let done = Arc::clone(&finished);
        let counter = Arc::clone(&calls);
        let (fetch, _) = registry.join_or_spawn("events-list:upcoming", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            done.fetch_add(1, Ordering::SeqCst);
            Ok(5)
        });
        drop(fetch);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_completed_key_starts_fresh_fetch() {
        let registry = InFlightRegistry::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register_or_join("a:1", slow_producer(Arc::clone(&calls), 1))
            .await
            .unwrap();
        registry
            .register_or_join("a:1", slow_producer(Arc::clone(&calls), 2))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_newer_epoch_does_not_join_older_fetch() {
        let registry = InFlightRegistry::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (old, _) =
            registry.join_or_spawn_at("profile:42", 1, slow_producer(Arc::clone(&calls), 3));
        let (new, joined) =
            registry.join_or_spawn_at("profile:42", 2, slow_producer(Arc::clone(&calls), 4));
        assert!(!joined);
        // same epoch still coalesces onto the newest fetch
        let (again, joined_again) =
            registry.join_or_spawn_at("profile:42", 2, slow_producer(Arc::clone(&calls), 5));
        assert!(joined_again);

        let (a, b, c) = futures::join!(old, new, again);
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (3, 4, 4));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // releasing the superseded fetch never removed the newer slot
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_producer_releases_slot() {
        let registry = InFlightRegistry::<u32>::new();
        let result = registry
            .register_or_join("a:1", || async {
                if true {
                    panic!("producer blew up");
                }
                Ok::<u32, Error>(0)
            })
            .await;
        assert!(matches!(result, Err(Error::Runtime { .. })));
        assert!(registry.is_empty());
    }
}
