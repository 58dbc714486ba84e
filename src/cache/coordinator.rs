//! Declarative invalidation edges and the mutation protocol built on them.

use super::entry::CacheEntry;
use super::key::{CacheKey, KeyPattern};
use super::policy::FreshnessPolicy;
use super::stats::AtomicStats;
use super::store::{CacheStore, StoreOp};
use crate::clock::Clock;
use crate::{Error, ErrorContext, Result};
use arc_swap::ArcSwap;
use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// "A successful mutation of a key matching `from` invalidates cached
/// entries matching `to`."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEdge {
    pub from: KeyPattern,
    pub to: KeyPattern,
}

impl InvalidationEdge {
    pub fn parse(from: &str, to: &str) -> Result<Self> {
        let from = KeyPattern::parse(from)?;
        let to = KeyPattern::parse(to)?;
        if to.binds_identity() && !from.binds_identity() {
            return Err(Error::configuration_with_context(
                "target binds {id} but source does not capture one",
                ErrorContext::new()
                    .with_field_path(format!("{} -> {}", from, to))
                    .with_source("edges"),
            ));
        }
        Ok(Self { from, to })
    }

    fn resolve(&self, identity: Option<&str>) -> Option<Target> {
        match (&self.to, identity) {
            (KeyPattern::Exact(k), _) => Some(Target::Key(k.clone())),
            (KeyPattern::Namespace(ns), _) => Some(Target::Namespace(ns.clone())),
            (KeyPattern::Prefix { namespace, prefix }, _) => Some(Target::Prefix {
                namespace: namespace.clone(),
                prefix: prefix.clone(),
            }),
            (KeyPattern::Identity(ns), Some(id)) => CacheKey::new(ns, id).ok().map(Target::Key),
            // reached through a namespace-wide invalidation: no identity to bind
            (KeyPattern::Identity(ns), None) => Some(Target::Namespace(ns.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Target {
    Key(CacheKey),
    Prefix { namespace: String, prefix: String },
    Namespace(String),
}

/// Serializes mutations per key without blocking unrelated keys.
#[derive(Default)]
pub(crate) struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

pub(crate) struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    pub(crate) async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // only the map still references the mutex: nobody holds or waits on it
        if locks.get(&self.key).is_some_and(|m| Arc::strong_count(m) == 1) {
            locks.remove(&self.key);
        }
    }
}

pub struct InvalidationCoordinator<V> {
    store: Arc<CacheStore<V>>,
    edges: ArcSwap<Vec<InvalidationEdge>>,
    locks: KeyLocks,
    clock: Arc<dyn Clock>,
    stats: Arc<AtomicStats>,
}

impl<V> InvalidationCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<CacheStore<V>>, clock: Arc<dyn Clock>) -> Self {
        Self::with_stats(store, clock, Arc::new(AtomicStats::default()))
    }

    pub(crate) fn with_stats(
        store: Arc<CacheStore<V>>,
        clock: Arc<dyn Clock>,
        stats: Arc<AtomicStats>,
    ) -> Self {
        Self {
            store,
            edges: ArcSwap::from_pointee(Vec::new()),
            locks: KeyLocks::default(),
            clock,
            stats,
        }
    }

    /// Declare that mutating keys matching `from` invalidates keys matching `to`.
    /// Registering the same edge twice is a no-op.
    pub fn register_edge(&self, from: &str, to: &str) -> Result<()> {
        let edge = InvalidationEdge::parse(from, to)?;
        self.edges.rcu(|edges| {
            let mut next = Vec::clone(edges);
            if !next.contains(&edge) {
                next.push(edge.clone());
            }
            next
        });
        debug!(from, to, "registered invalidation edge");
        Ok(())
    }

    pub fn edges(&self) -> Arc<Vec<InvalidationEdge>> {
        self.edges.load_full()
    }

    /// Everything reachable from `key` through the edge table, following
    /// edges transitively. The mutated key itself is never a target.
    fn targets(&self, key: &CacheKey) -> Vec<Target> {
        let edges = self.edges.load();
        let start = Target::Key(key.clone());
        let mut seen: HashSet<Target> = HashSet::from([start.clone()]);
        let mut queue = VecDeque::from([start]);
        let mut out = Vec::new();

        while let Some(current) = queue.pop_front() {
            for edge in edges.iter() {
                let next = match &current {
                    Target::Key(k) if edge.from.matches(k) => edge.resolve(Some(k.identity())),
                    Target::Prefix { namespace, prefix }
                        if edge.from.overlaps_prefix(namespace, prefix) =>
                    {
                        edge.resolve(None)
                    }
                    Target::Namespace(ns) if edge.from.namespace() == ns => edge.resolve(None),
                    _ => None,
                };
                if let Some(next) = next {
                    if seen.insert(next.clone()) {
                        out.push(next.clone());
                        queue.push_back(next);
                    }
                }
            }
        }
        out
    }

    fn invalidation_ops(&self, key: &CacheKey) -> Vec<StoreOp<V>> {
        self.targets(key)
            .into_iter()
            .map(|t| match t {
                Target::Key(k) => StoreOp::Remove(k),
                Target::Prefix { namespace, prefix } => StoreOp::RemovePrefix { namespace, prefix },
                Target::Namespace(ns) => StoreOp::RemoveNamespace(ns),
            })
            .collect()
    }

    /// Apply every edge triggered by a successful mutation of `key`.
    /// Returns the number of entries removed.
    pub fn on_mutation_succeeded(&self, key: &CacheKey) -> usize {
        let removed = self.store.apply(self.invalidation_ops(key));
        debug!(key = %key, removed, "cascaded invalidation");
        removed
    }

    /// Run a mutation against `key`:
    ///
    /// 1. write `optimistic` (if any) to the store,
    /// 2. await `remote`,
    /// 3. on success write the authoritative value through (`Some`) or drop
    ///    the key (`None`) together with every cascaded invalidation, as one
    ///    atomic batch,
    /// 4. on failure restore the prior entry (or remove the optimistic one)
    ///    and return the error. If anything else wrote to or invalidated the
    ///    namespace after the optimistic write, the key is removed instead:
    ///    the prior entry may predate a committed change.
    ///
    /// Mutations of the same key run one at a time. The work runs on its own
    /// task, so a caller that stops waiting does not leave the store
    /// half-updated.
    pub async fn mutate<F, Fut>(
        self: &Arc<Self>,
        key: CacheKey,
        policy: FreshnessPolicy,
        optimistic: Option<V>,
        remote: F,
    ) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>>> + Send + 'static,
    {
        let this = Arc::clone(self);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            this.run_mutation(task_key, policy, optimistic, remote)
                .await
        });
        match task.await {
            Ok(out) => out,
            Err(e) => Err(Error::runtime_with_context(
                format!("mutation task failed: {}", e),
                ErrorContext::new()
                    .with_field_path(key.to_string())
                    .with_source("coordinator"),
            )),
        }
    }

    async fn run_mutation<F, Fut>(
        &self,
        key: CacheKey,
        policy: FreshnessPolicy,
        optimistic: Option<V>,
        remote: F,
    ) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        let _guard = self.locks.lock(key.as_str()).await;
        let previous = self.store.entry(&key);

        let optimistic_epoch = optimistic.map(|value| {
            self.store
                .put_versioned(&key, CacheEntry::new(value, self.clock.now(), policy))
        });

        let outcome = match AssertUnwindSafe(remote()).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(Error::runtime_with_context(
                "mutation call panicked",
                ErrorContext::new()
                    .with_field_path(key.to_string())
                    .with_source("coordinator"),
            )),
        };

        match outcome {
            Ok(written) => {
                let mut ops = self.invalidation_ops(&key);
                // the write-through goes last so a namespace-wide edge cannot erase it
                ops.push(match &written {
                    Some(value) => StoreOp::Put {
                        key: key.clone(),
                        entry: CacheEntry::new(value.clone(), self.clock.now(), policy),
                    },
                    None => StoreOp::Remove(key.clone()),
                });
                let removed = self.store.apply(ops);
                AtomicStats::bump(&self.stats.mutations);
                info!(key = %key, removed, deleted = written.is_none(), "mutation committed");
                Ok(written)
            }
            Err(e) => {
                if let Some(epoch) = optimistic_epoch {
                    let restore = match previous {
                        Some(entry) => StoreOp::Put {
                            key: key.clone(),
                            entry,
                        },
                        None => StoreOp::Remove(key.clone()),
                    };
                    if self
                        .store
                        .apply_if_epoch(vec![restore], key.namespace(), epoch)
                        .is_none()
                    {
                        debug!(key = %key, "namespace changed during mutation; dropping key");
                        self.store.apply(vec![StoreOp::Remove(key.clone())]);
                    }
                    AtomicStats::bump(&self.stats.rollbacks);
                }
                let rolled_back = optimistic_epoch.is_some();
                warn!(key = %key, error = %e, rolled_back, "mutation failed");
                Err(e)
            }
        }
    }

    /// Empty the whole store (every namespace).
    pub fn sign_out(&self) -> usize {
        let removed = self.store.clear();
        info!(removed, "cleared all cached namespaces");
        removed
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.len()
    }
}
