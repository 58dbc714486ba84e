//! Entity namespaces: a freshness policy and a producer bound to the shared
//! store, registry and coordinator.
//!
//! Values are held as [`serde_json::Value`] so every namespace lives in one
//! store; [`Namespace<V>`] is the typed handle callers use.

use crate::cache::{
    AtomicStats, CacheKey, CacheStore, Freshness, FreshnessPolicy, InFlightRegistry,
    InvalidationCoordinator, SharedFetch,
};
use crate::clock::Clock;
use crate::credentials::CredentialCache;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fetches the authoritative value for a key. Called by the in-flight
/// registry on a miss or a stale read.
#[async_trait]
pub trait Producer<V>: Send + Sync {
    async fn produce(&self, key: &CacheKey) -> Result<V>;
}

#[async_trait]
impl<V, F, Fut> Producer<V> for F
where
    F: Fn(CacheKey) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V>> + Send + 'static,
    V: Send + 'static,
{
    async fn produce(&self, key: &CacheKey) -> Result<V> {
        (self)(key.clone()).await
    }
}

/// Adapts a typed producer to the JSON-valued store.
struct JsonProducer<P, V> {
    inner: P,
    _marker: PhantomData<fn() -> V>,
}

#[async_trait]
impl<P, V> Producer<Value> for JsonProducer<P, V>
where
    P: Producer<V>,
    V: Serialize + Send + 'static,
{
    async fn produce(&self, key: &CacheKey) -> Result<Value> {
        let value = self.inner.produce(key).await?;
        Ok(serde_json::to_value(value)?)
    }
}

pub(crate) fn erase<P, V>(producer: P) -> Arc<dyn Producer<Value>>
where
    P: Producer<V> + 'static,
    V: Serialize + Send + 'static,
{
    Arc::new(JsonProducer {
        inner: producer,
        _marker: PhantomData,
    })
}

#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    pub name: String,
    pub policy: FreshnessPolicy,
    /// Falls back to the engine-wide default when unset.
    pub max_entries: Option<NonZeroUsize>,
}

impl NamespaceConfig {
    pub fn new(name: impl Into<String>, policy: FreshnessPolicy) -> Result<Self> {
        let name = name.into();
        crate::cache::validate_namespace(&name)?;
        Ok(Self {
            name,
            policy,
            max_entries: None,
        })
    }

    pub fn with_max_entries(mut self, max_entries: NonZeroUsize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }
}

/// Shared machinery every namespace reads and writes through.
pub(crate) struct CacheCore {
    pub(crate) store: Arc<CacheStore<Value>>,
    pub(crate) registry: InFlightRegistry<Value>,
    pub(crate) coordinator: Arc<InvalidationCoordinator<Value>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) stats: Arc<AtomicStats>,
    pub(crate) credentials: Option<Arc<CredentialCache>>,
}

impl CacheCore {
    pub(crate) fn new(
        default_capacity: NonZeroUsize,
        clock: Arc<dyn Clock>,
        credentials: Option<Arc<CredentialCache>>,
    ) -> Self {
        let stats = Arc::new(AtomicStats::default());
        let store = Arc::new(CacheStore::with_stats(default_capacity, Arc::clone(&stats)));
        let coordinator = Arc::new(InvalidationCoordinator::with_stats(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&stats),
        ));
        Self {
            store,
            registry: InFlightRegistry::with_stats(Arc::clone(&stats)),
            coordinator,
            clock,
            stats,
            credentials,
        }
    }

    /// Rejected credentials must be re-derived before the error reaches the caller.
    pub(crate) async fn observe_error(&self, error: &Error) {
        if !error.is_auth() {
            return;
        }
        if let Some(credentials) = &self.credentials {
            warn!(error = %error, "authentication failure; invalidating credential cache");
            credentials.invalidate().await;
        }
    }
}

/// One namespace over the JSON-valued store.
pub(crate) struct RawNamespace {
    config: NamespaceConfig,
    producer: Arc<dyn Producer<Value>>,
    core: Arc<CacheCore>,
}

impl RawNamespace {
    pub(crate) fn new(
        config: NamespaceConfig,
        producer: Arc<dyn Producer<Value>>,
        core: Arc<CacheCore>,
    ) -> Self {
        if let Some(max) = config.max_entries {
            core.store.configure_namespace(&config.name, max);
        }
        Self {
            config,
            producer,
            core,
        }
    }

    pub(crate) fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    pub(crate) fn key(&self, identity: &str) -> Result<CacheKey> {
        CacheKey::new(&self.config.name, identity)
    }

    pub(crate) async fn read(&self, identity: &str) -> Result<Freshness<Value>> {
        let key = self.key(identity)?;
        let now = self.core.clock.now();
        match self.core.store.get(&key, now) {
            Freshness::Fresh(value) => {
                AtomicStats::bump(&self.core.stats.fresh_hits);
                debug!(key = %key, "fresh hit");
                Ok(Freshness::Fresh(value))
            }
            Freshness::Stale(value) => {
                AtomicStats::bump(&self.core.stats.stale_hits);
                debug!(key = %key, "stale hit; revalidating in background");
                self.refresh_in_background(key);
                Ok(Freshness::Stale(value))
            }
            Freshness::Miss => {
                AtomicStats::bump(&self.core.stats.misses);
                debug!(key = %key, "miss; fetching");
                let (fetch, _) = self.start_fetch(key);
                match fetch.await {
                    Ok(value) => Ok(Freshness::Fresh(value)),
                    Err(e) => {
                        self.core.observe_error(&e).await;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Start (or join) the producer call for `key`. The result is written
    /// back only if no invalidation or mutation touched the namespace while
    /// the call was outstanding, and a fetch started before such a change is
    /// never joined after it. Failures leave the store as it was.
    fn start_fetch(&self, key: CacheKey) -> (SharedFetch<Value>, bool) {
        let epoch = self.core.store.epoch(key.namespace());
        let producer = Arc::clone(&self.producer);
        let core = Arc::clone(&self.core);
        let policy = self.config.policy;
        let slot = key.to_string();
        self.core
            .registry
            .join_or_spawn_at(&slot, epoch, move || async move {
                let value = producer.produce(&key).await?;
                core.store
                    .put_if_epoch(&key, value.clone(), policy, core.clock.now(), epoch);
                Ok::<_, Error>(value)
            })
    }

    fn refresh_in_background(&self, key: CacheKey) {
        let (fetch, joined) = self.start_fetch(key.clone());
        if joined {
            // whoever started the fetch owns its outcome
            return;
        }
        let core = Arc::clone(&self.core);
        tokio::spawn(async move {
            if let Err(e) = fetch.await {
                AtomicStats::bump(&core.stats.refresh_failures);
                warn!(key = %key, error = %e, "background refresh failed; keeping stale value");
                core.observe_error(&e).await;
            }
        });
    }

    pub(crate) fn peek(&self, identity: &str) -> Result<Freshness<Value>> {
        let key = self.key(identity)?;
        Ok(self.core.store.peek(&key, self.core.clock.now()))
    }

    pub(crate) fn should_refresh(&self, identity: &str) -> Result<bool> {
        Ok(!self.peek(identity)?.is_fresh())
    }

    pub(crate) fn invalidate(&self, identity: &str) -> Result<bool> {
        let key = self.key(identity)?;
        Ok(self.core.store.invalidate(&key))
    }

    pub(crate) fn invalidate_all(&self) -> usize {
        self.core.store.invalidate_namespace(&self.config.name)
    }

    pub(crate) async fn mutate<F, Fut>(
        &self,
        identity: &str,
        optimistic: Option<Value>,
        remote: F,
    ) -> Result<Option<Value>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let key = self.key(identity)?;
        let result = self
            .core
            .coordinator
            .mutate(key, self.config.policy, optimistic, remote)
            .await;
        if let Err(e) = &result {
            self.core.observe_error(e).await;
        }
        result
    }
}

/// Typed handle to a registered namespace. Cheap to clone.
pub struct Namespace<V> {
    raw: Arc<RawNamespace>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for Namespace<V> {
    fn clone(&self) -> Self {
        Self {
            raw: Arc::clone(&self.raw),
            _marker: PhantomData,
        }
    }
}

impl<V> Namespace<V>
where
    V: Serialize + DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(raw: Arc<RawNamespace>) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.raw.config().name
    }

    pub fn policy(&self) -> FreshnessPolicy {
        self.raw.config().policy
    }

    pub fn key(&self, identity: &str) -> Result<CacheKey> {
        self.raw.key(identity)
    }

    /// `Fresh` returns immediately. `Stale` returns the cached value and
    /// starts one coalesced background refresh. `Miss` waits for the
    /// coalesced fetch and returns its value as `Fresh`, or its error.
    pub async fn read(&self, identity: &str) -> Result<Freshness<V>> {
        let raw = self.raw.read(identity).await?;
        Ok(raw.try_map(serde_json::from_value::<V>)?)
    }

    /// Read every identity concurrently. Results keep the input order and
    /// each carries its own freshness or error.
    pub async fn read_many<S: AsRef<str>>(&self, identities: &[S]) -> Vec<Result<Freshness<V>>> {
        join_all(identities.iter().map(|id| self.read(id.as_ref()))).await
    }

    /// Classify without fetching or touching LRU order.
    pub fn peek(&self, identity: &str) -> Result<Freshness<V>> {
        Ok(self.raw.peek(identity)?.try_map(serde_json::from_value::<V>)?)
    }

    /// True when the entry is stale or missing.
    pub fn should_refresh(&self, identity: &str) -> Result<bool> {
        self.raw.should_refresh(identity)
    }

    /// Idempotent: returns whether an entry was present.
    pub fn invalidate(&self, identity: &str) -> Result<bool> {
        self.raw.invalidate(identity)
    }

    pub fn invalidate_all(&self) -> usize {
        self.raw.invalidate_all()
    }

    /// Optimistically write `optimistic` (if given), run `remote`, then
    /// write its result through and cascade invalidations, or roll back and
    /// return the error.
    pub async fn mutate<F, Fut>(&self, identity: &str, optimistic: Option<V>, remote: F) -> Result<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let optimistic = optimistic.map(serde_json::to_value).transpose()?;
        let written = self
            .raw
            .mutate(identity, optimistic, move || async move {
                let value = remote().await?;
                Ok::<_, Error>(Some(serde_json::to_value(value)?))
            })
            .await?;
        match written {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Err(Error::runtime_with_context(
                "mutation committed without a value",
                crate::ErrorContext::new().with_field_path(identity),
            )),
        }
    }

    /// Run a remote delete. On success the key is dropped and edges cascade
    /// as for any other mutation.
    pub async fn delete<F, Fut>(&self, identity: &str, remote: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.raw
            .mutate(identity, None, move || async move {
                remote().await?;
                Ok::<_, Error>(None)
            })
            .await
            .map(|_| ())
    }
}
