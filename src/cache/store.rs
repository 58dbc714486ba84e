//! Generic keyed store of [`CacheEntry`] values, sharded by namespace.
//!
//! Each namespace owns an LRU-bounded shard behind its own lock, so reads and
//! writes in unrelated namespaces never contend. Multi-key changes go through
//! [`CacheStore::apply`], which locks every involved shard (in name order)
//! before touching any of them: a reader sees either none or all of a batch.
//!
//! Every shard also carries a write epoch. Invalidations, clears and batch
//! writes bump it; producers capture it before fetching and write back with
//! [`CacheStore::put_if_epoch`], so a fetch that raced an invalidation cannot
//! reinstate the data that was just discarded.

use super::entry::{CacheEntry, Freshness};
use super::key::CacheKey;
use super::policy::FreshnessPolicy;
use super::stats::{AtomicStats, CacheStats};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::SystemTime;
use tracing::debug;

/// One change in an atomic batch.
#[derive(Debug, Clone)]
pub enum StoreOp<V> {
    Put { key: CacheKey, entry: CacheEntry<V> },
    Remove(CacheKey),
    /// Every key in `namespace` whose identity starts with `prefix`.
    RemovePrefix { namespace: String, prefix: String },
    RemoveNamespace(String),
}

impl<V> StoreOp<V> {
    pub fn namespace(&self) -> &str {
        match self {
            StoreOp::Put { key, .. } | StoreOp::Remove(key) => key.namespace(),
            StoreOp::RemovePrefix { namespace, .. } | StoreOp::RemoveNamespace(namespace) => {
                namespace
            }
        }
    }
}

struct Shard<V> {
    entries: LruCache<CacheKey, CacheEntry<V>>,
    epoch: u64,
}

impl<V> Shard<V> {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            epoch: 0,
        }
    }
}

type ShardRef<V> = Arc<Mutex<Shard<V>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CacheStore<V> {
    shards: RwLock<HashMap<String, ShardRef<V>>>,
    default_capacity: NonZeroUsize,
    stats: Arc<AtomicStats>,
}

impl<V: Clone> CacheStore<V> {
    /// `default_capacity` bounds namespaces that were never configured explicitly.
    pub fn new(default_capacity: NonZeroUsize) -> Self {
        Self::with_stats(default_capacity, Arc::new(AtomicStats::default()))
    }

    pub(crate) fn with_stats(default_capacity: NonZeroUsize, stats: Arc<AtomicStats>) -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            default_capacity,
            stats,
        }
    }

    /// Set the maximum entry count for a namespace. Shrinking evicts LRU entries.
    pub fn configure_namespace(&self, namespace: &str, capacity: NonZeroUsize) {
        let mut shards = self.shards.write().unwrap_or_else(PoisonError::into_inner);
        match shards.get(namespace) {
            Some(shard) => {
                let mut shard = lock(shard);
                let before = shard.entries.len();
                shard.entries.resize(capacity);
                let evicted = before.saturating_sub(shard.entries.len());
                AtomicStats::add(&self.stats.evictions, evicted as u64);
            }
            None => {
                shards.insert(
                    namespace.to_string(),
                    Arc::new(Mutex::new(Shard::new(capacity))),
                );
            }
        }
    }

    fn existing_shard(&self, namespace: &str) -> Option<ShardRef<V>> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .cloned()
    }

    fn shard(&self, namespace: &str) -> ShardRef<V> {
        if let Some(shard) = self.existing_shard(namespace) {
            return shard;
        }
        let mut shards = self.shards.write().unwrap_or_else(PoisonError::into_inner);
        shards
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Shard::new(self.default_capacity))))
            .clone()
    }

    fn insert(shard: &mut Shard<V>, key: CacheKey, entry: CacheEntry<V>, stats: &AtomicStats) {
        if let Some((old_key, _)) = shard.entries.push(key.clone(), entry) {
            if old_key != key {
                debug!(namespace = key.namespace(), evicted = %old_key, "LRU eviction");
                AtomicStats::bump(&stats.evictions);
            }
        }
    }

    /// Classify `key` at `now`. Promotes the entry in LRU order; nothing else changes.
    pub fn get(&self, key: &CacheKey, now: SystemTime) -> Freshness<V> {
        let Some(shard) = self.existing_shard(key.namespace()) else {
            return Freshness::Miss;
        };
        let mut shard = lock(&shard);
        match shard.entries.get(key) {
            Some(entry) => entry.classify_cloned(now),
            None => Freshness::Miss,
        }
    }

    /// Like [`get`](Self::get) but leaves LRU order untouched.
    pub fn peek(&self, key: &CacheKey, now: SystemTime) -> Freshness<V> {
        self.entry(key)
            .map(|e| e.classify_cloned(now))
            .unwrap_or(Freshness::Miss)
    }

    /// Raw entry, regardless of freshness.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let shard = self.existing_shard(key.namespace())?;
        let shard = lock(&shard);
        shard.entries.peek(key).cloned()
    }

    pub fn put(&self, key: &CacheKey, value: V, policy: FreshnessPolicy, now: SystemTime) {
        self.put_entry(key, CacheEntry::new(value, now, policy));
    }

    /// Insert a pre-stamped entry (used when restoring snapshots).
    pub fn put_entry(&self, key: &CacheKey, entry: CacheEntry<V>) {
        let shard = self.shard(key.namespace());
        let mut shard = lock(&shard);
        Self::insert(&mut shard, key.clone(), entry, &self.stats);
    }

    /// Write one entry as a batch of its own and return the namespace epoch
    /// it produced, for a later [`apply_if_epoch`](Self::apply_if_epoch).
    pub fn put_versioned(&self, key: &CacheKey, entry: CacheEntry<V>) -> u64 {
        let shard = self.shard(key.namespace());
        let mut shard = lock(&shard);
        shard.epoch += 1;
        Self::insert(&mut shard, key.clone(), entry, &self.stats);
        shard.epoch
    }

    /// Current write epoch of the namespace holding `key`.
    pub fn epoch(&self, namespace: &str) -> u64 {
        lock(&self.shard(namespace)).epoch
    }

    /// Write only if nothing invalidated or rewrote the namespace since `epoch`.
    pub fn put_if_epoch(
        &self,
        key: &CacheKey,
        value: V,
        policy: FreshnessPolicy,
        now: SystemTime,
        epoch: u64,
    ) -> bool {
        let shard = self.shard(key.namespace());
        let mut shard = lock(&shard);
        if shard.epoch != epoch {
            debug!(key = %key, "discarding fetch result superseded by a newer write");
            return false;
        }
        Self::insert(&mut shard, key.clone(), CacheEntry::new(value, now, policy), &self.stats);
        true
    }

    /// Idempotent: returns whether an entry was present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.apply(vec![StoreOp::Remove(key.clone())]) > 0
    }

    /// Remove every key matching `pattern`: `ns:*` (whole namespace) or
    /// `ns:prefix*` (identities starting with `prefix`). A pattern without a
    /// trailing `*` removes that exact key.
    pub fn invalidate_prefix(&self, pattern: &str) -> usize {
        let Some((ns, ident)) = pattern.split_once(':') else {
            return self.invalidate_namespace(pattern);
        };
        let Some(prefix) = ident.strip_suffix('*') else {
            return match CacheKey::new(ns, ident) {
                Ok(key) => usize::from(self.invalidate(&key)),
                Err(_) => 0,
            };
        };
        if prefix.is_empty() {
            return self.invalidate_namespace(ns);
        }
        if self.existing_shard(ns).is_none() {
            return 0;
        }
        self.apply(vec![StoreOp::RemovePrefix {
            namespace: ns.to_string(),
            prefix: prefix.to_string(),
        }])
    }

    pub fn invalidate_namespace(&self, namespace: &str) -> usize {
        self.apply(vec![StoreOp::RemoveNamespace(namespace.to_string())])
    }

    /// Empty every namespace at once.
    pub fn clear(&self) -> usize {
        let ops = self
            .namespaces()
            .into_iter()
            .map(StoreOp::RemoveNamespace)
            .collect();
        self.apply(ops)
    }

    /// Apply a batch atomically with respect to every reader. Returns the
    /// number of entries removed.
    pub fn apply(&self, ops: Vec<StoreOp<V>>) -> usize {
        self.apply_guarded(ops, None).unwrap_or(0)
    }

    /// Apply the batch only if `namespace` is still at `epoch`, checked under
    /// the same locks as the writes. `None` means the namespace moved on and
    /// nothing was applied.
    pub fn apply_if_epoch(
        &self,
        ops: Vec<StoreOp<V>>,
        namespace: &str,
        epoch: u64,
    ) -> Option<usize> {
        self.apply_guarded(ops, Some((namespace, epoch)))
    }

    fn apply_guarded(&self, ops: Vec<StoreOp<V>>, expect: Option<(&str, u64)>) -> Option<usize> {
        let mut names: Vec<String> = ops.iter().map(|op| op.namespace().to_string()).collect();
        if let Some((ns, _)) = expect {
            names.push(ns.to_string());
        }
        names.sort();
        names.dedup();

        let shards: Vec<ShardRef<V>> = names.iter().map(|n| self.shard(n)).collect();
        let mut guards: Vec<MutexGuard<'_, Shard<V>>> = shards.iter().map(|s| lock(s)).collect();
        if let Some((ns, epoch)) = expect {
            let idx = names.binary_search_by(|n| n.as_str().cmp(ns)).ok()?;
            if guards[idx].epoch != epoch {
                return None;
            }
        }
        for guard in guards.iter_mut() {
            guard.epoch += 1;
        }

        let mut removed = 0;
        for op in ops {
            let Ok(idx) = names.binary_search_by(|n| n.as_str().cmp(op.namespace())) else {
                continue;
            };
            let shard = &mut *guards[idx];
            match op {
                StoreOp::Put { key, entry } => Self::insert(shard, key, entry, &self.stats),
                StoreOp::Remove(key) => {
                    if shard.entries.pop(&key).is_some() {
                        removed += 1;
                    }
                }
                StoreOp::RemovePrefix { prefix, .. } => {
                    let doomed: Vec<CacheKey> = shard
                        .entries
                        .iter()
                        .filter(|(k, _)| k.identity().starts_with(prefix.as_str()))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in &doomed {
                        shard.entries.pop(k);
                    }
                    removed += doomed.len();
                }
                StoreOp::RemoveNamespace(_) => {
                    removed += shard.entries.len();
                    shard.entries.clear();
                }
            }
        }
        AtomicStats::add(&self.stats.invalidations, removed as u64);
        Some(removed)
    }

    /// Drop entries whose age reached their TTL. Pure memory reclaim: such
    /// entries already classify as `Miss`.
    pub fn purge_expired(&self, now: SystemTime) -> usize {
        let mut purged = 0;
        for ns in self.namespaces() {
            let Some(shard) = self.existing_shard(&ns) else {
                continue;
            };
            let mut shard = lock(&shard);
            let expired: Vec<CacheKey> = shard
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            for k in &expired {
                shard.entries.pop(k);
            }
            purged += expired.len();
        }
        if purged > 0 {
            debug!(purged, "swept expired entries");
        }
        purged
    }

    /// Snapshot of a namespace, most recently used first.
    pub fn entries(&self, namespace: &str) -> Vec<(CacheKey, CacheEntry<V>)> {
        match self.existing_shard(namespace) {
            Some(shard) => lock(&shard)
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn namespace_len(&self, namespace: &str) -> usize {
        self.existing_shard(namespace)
            .map(|s| lock(&s).entries.len())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.namespaces()
            .iter()
            .map(|ns| self.namespace_len(ns))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }
}
