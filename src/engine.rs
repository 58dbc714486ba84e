//! Composition root: one store, one in-flight registry, one coordinator and
//! one credential slot shared by every registered namespace.

use crate::cache::{CacheKey, CacheStats, Freshness, InvalidationEdge};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::credentials::{CredentialCache, KeyringStore, SecureStore};
use crate::entities;
use crate::namespace::{erase, CacheCore, Namespace, NamespaceConfig, Producer, RawNamespace};
use crate::persistence::{PersistedEntry, SnapshotStore};
use crate::{Error, ErrorContext, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Keychain service used when no secure store is supplied.
pub const DEFAULT_KEYRING_SERVICE: &str = "stalewise";

/// Builder for [`CacheEngine`].
pub struct CacheEngineBuilder {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    secure_store: Option<Arc<dyn SecureStore>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    edges: Vec<(String, String)>,
}

impl CacheEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            secure_store: None,
            snapshots: None,
            edges: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Defaults to the OS keychain under [`DEFAULT_KEYRING_SERVICE`].
    pub fn with_secure_store(mut self, store: Arc<dyn SecureStore>) -> Self {
        self.secure_store = Some(store);
        self
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Edge declared in code, added after the configured ones.
    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    pub fn build(self) -> Result<CacheEngine> {
        self.config.validate()?;

        let secure_store = self
            .secure_store
            .unwrap_or_else(|| {
                Arc::new(KeyringStore::new(DEFAULT_KEYRING_SERVICE)) as Arc<dyn SecureStore>
            });
        let credentials = Arc::new(
            CredentialCache::new(secure_store, Arc::clone(&self.clock))
                .with_secret_name(self.config.credential_secret_name.clone())
                .with_policy(self.config.credential_policy()?),
        );
        let core = Arc::new(CacheCore::new(
            self.config.default_capacity()?,
            self.clock,
            Some(Arc::clone(&credentials)),
        ));

        let configured = self
            .config
            .edges
            .iter()
            .map(|e| (e.from.clone(), e.to.clone()));
        for (from, to) in configured.chain(self.edges) {
            core.coordinator.register_edge(&from, &to)?;
        }
        debug!(
            edges = core.coordinator.edges().len(),
            namespaces = self.config.namespaces.len(),
            "cache engine built"
        );

        Ok(CacheEngine {
            core,
            credentials,
            snapshots: self.snapshots,
            config: self.config,
            namespaces: RwLock::new(HashMap::new()),
        })
    }
}

impl Default for CacheEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CacheEngine {
    core: Arc<CacheCore>,
    credentials: Arc<CredentialCache>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    config: EngineConfig,
    namespaces: RwLock<HashMap<String, Arc<RawNamespace>>>,
}

impl CacheEngine {
    pub fn builder() -> CacheEngineBuilder {
        CacheEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register `name` with the policy from the configuration, falling back
    /// to the standard entity policies.
    pub fn register<V, P>(&self, name: &str, producer: P) -> Result<Namespace<V>>
    where
        V: Serialize + DeserializeOwned + Send + 'static,
        P: Producer<V> + 'static,
    {
        let config = match self.config.namespaces.get(name) {
            Some(settings) => {
                let mut config = NamespaceConfig::new(name, settings.policy()?)?;
                config.max_entries = settings.capacity()?;
                config
            }
            None => {
                let policy = entities::default_policy(name).ok_or_else(|| {
                    Error::configuration_with_context(
                        "no policy configured for namespace",
                        ErrorContext::new()
                            .with_field_path(name)
                            .with_source("engine"),
                    )
                })?;
                NamespaceConfig::new(name, policy)?
            }
        };
        self.register_with(config, producer)
    }

    pub fn register_with<V, P>(&self, config: NamespaceConfig, producer: P) -> Result<Namespace<V>>
    where
        V: Serialize + DeserializeOwned + Send + 'static,
        P: Producer<V> + 'static,
    {
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if namespaces.contains_key(&config.name) {
            return Err(Error::configuration_with_context(
                "namespace already registered",
                ErrorContext::new()
                    .with_field_path(config.name.clone())
                    .with_source("engine"),
            ));
        }
        debug!(
            namespace = %config.name,
            ttl_ms = config.policy.ttl().as_millis() as u64,
            stale_after_ms = config.policy.stale_after().as_millis() as u64,
            "namespace registered"
        );
        let name = config.name.clone();
        let raw = Arc::new(RawNamespace::new(config, erase(producer), Arc::clone(&self.core)));
        namespaces.insert(name, Arc::clone(&raw));
        Ok(Namespace::new(raw))
    }

    /// Typed handle to an already registered namespace. The type is not
    /// checked here; decoding a value of another shape fails with
    /// [`Error::Serialization`].
    pub fn namespace<V>(&self, name: &str) -> Result<Namespace<V>>
    where
        V: Serialize + DeserializeOwned + Send + 'static,
    {
        self.raw(name).map(Namespace::new)
    }

    pub fn namespace_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn raw(&self, name: &str) -> Result<Arc<RawNamespace>> {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| {
                Error::configuration_with_context(
                    "unknown namespace",
                    ErrorContext::new()
                        .with_field_path(name)
                        .with_source("engine"),
                )
            })
    }

    pub async fn read(&self, namespace: &str, identity: &str) -> Result<Freshness<Value>> {
        self.raw(namespace)?.read(identity).await
    }

    pub fn peek(&self, namespace: &str, identity: &str) -> Result<Freshness<Value>> {
        self.raw(namespace)?.peek(identity)
    }

    pub fn should_refresh(&self, namespace: &str, identity: &str) -> Result<bool> {
        self.raw(namespace)?.should_refresh(identity)
    }

    pub fn invalidate(&self, namespace: &str, identity: &str) -> Result<bool> {
        self.raw(namespace)?.invalidate(identity)
    }

    /// See [`CacheStore::invalidate_prefix`](crate::cache::CacheStore::invalidate_prefix).
    pub fn invalidate_prefix(&self, pattern: &str) -> usize {
        self.core.store.invalidate_prefix(pattern)
    }

    pub async fn mutate<F, Fut>(
        &self,
        namespace: &str,
        identity: &str,
        optimistic: Option<Value>,
        remote: F,
    ) -> Result<Option<Value>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        self.raw(namespace)?
            .mutate(identity, optimistic, remote)
            .await
    }

    pub fn register_edge(&self, from: &str, to: &str) -> Result<()> {
        self.core.coordinator.register_edge(from, to)
    }

    pub fn edges(&self) -> Arc<Vec<InvalidationEdge>> {
        self.core.coordinator.edges()
    }

    /// Cascade edges for a change that happened outside [`mutate`](Self::mutate),
    /// e.g. a server push.
    pub fn on_mutation_succeeded(&self, key: &str) -> Result<usize> {
        let key = CacheKey::parse(key)?;
        Ok(self.core.coordinator.on_mutation_succeeded(&key))
    }

    /// Clear every namespace and the credential slot, and delete the stored
    /// secret. Returns the number of cached entries dropped.
    pub async fn sign_out(&self) -> Result<usize> {
        let removed = self.core.coordinator.sign_out();
        self.credentials.sign_out().await?;
        info!(removed, "signed out");
        Ok(removed)
    }

    pub fn credentials(&self) -> &Arc<CredentialCache> {
        &self.credentials
    }

    pub fn stats(&self) -> CacheStats {
        self.core.stats.to_stats()
    }

    pub fn len(&self) -> usize {
        self.core.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.store.is_empty()
    }

    /// Number of producer calls currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.core.registry.len()
    }

    /// Drop entries whose TTL elapsed. Never changes what a read returns.
    pub fn purge_expired(&self) -> usize {
        self.core.store.purge_expired(self.core.clock.now())
    }

    /// Periodically purge expired entries. The task stops by itself once
    /// the engine is dropped; abort the handle to stop it earlier.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let core = Arc::downgrade(&self.core);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(core) = core.upgrade() else {
                    break;
                };
                core.store.purge_expired(core.clock.now());
            }
        })
    }

    /// [`spawn_sweeper`](Self::spawn_sweeper) with the configured interval, if any.
    pub fn spawn_configured_sweeper(&self) -> Option<JoinHandle<()>> {
        self.config
            .sweep_interval()
            .map(|interval| self.spawn_sweeper(interval))
    }

    fn snapshot_store(&self) -> Result<&Arc<dyn SnapshotStore>> {
        self.snapshots.as_ref().ok_or_else(|| {
            Error::configuration_with_context(
                "no snapshot store configured",
                ErrorContext::new().with_source("engine"),
            )
        })
    }

    /// Save the unexpired entries of `namespace`. Returns how many were saved.
    pub async fn persist(&self, namespace: &str) -> Result<usize> {
        let snapshots = self.snapshot_store()?;
        let raw = self.raw(namespace)?;
        let now = self.core.clock.now();
        let entries: Vec<PersistedEntry> = self
            .core
            .store
            .entries(&raw.config().name)
            .into_iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| PersistedEntry::from_entry(key, &entry))
            .collect();
        let count = entries.len();
        snapshots.save_snapshot(namespace, entries).await?;
        info!(namespace, entries = count, "namespace persisted");
        Ok(count)
    }

    /// Load the saved entries of `namespace`, keeping their original
    /// `cached_at`. Expired entries, entries of other namespaces, and entries
    /// older than what is already cached are skipped.
    pub async fn restore(&self, namespace: &str) -> Result<usize> {
        let snapshots = self.snapshot_store()?;
        let raw = self.raw(namespace)?;
        let policy = raw.config().policy;
        let saved = snapshots.load_snapshot(namespace).await?;
        let now = self.core.clock.now();

        let mut restored = 0;
        // snapshots list the most recently used entry first; insert it last
        for persisted in saved.into_iter().rev() {
            if persisted.key.namespace() != namespace {
                continue;
            }
            let (key, entry) = persisted.into_entry(policy);
            if entry.is_expired(now) {
                continue;
            }
            let newer_cached = self
                .core
                .store
                .entry(&key)
                .is_some_and(|current| current.cached_at >= entry.cached_at);
            if newer_cached {
                continue;
            }
            self.core.store.put_entry(&key, entry);
            restored += 1;
        }
        info!(namespace, entries = restored, "namespace restored");
        Ok(restored)
    }

    pub async fn persist_all(&self) -> Result<usize> {
        let mut total = 0;
        for name in self.namespace_names() {
            total += self.persist(&name).await?;
        }
        Ok(total)
    }

    pub async fn restore_all(&self) -> Result<usize> {
        let mut total = 0;
        for name in self.namespace_names() {
            total += self.restore(&name).await?;
        }
        Ok(total)
    }
}
