//! Short-lived credential slot backed by a secure persistent store.
//!
//! The slot never refreshes in the background: an expired token blocks the
//! next caller until the secure store has been read again. Concurrent callers
//! that find the slot empty wait on the same read.

use crate::cache::{CacheEntry, Freshness, FreshnessPolicy};
use crate::clock::Clock;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, PoisonError};
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Keychain-style storage for secrets, keyed by name.
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// `Ok(None)` when no secret is stored under `name`.
    async fn get_secret(&self, name: &str) -> Result<Option<String>>;
    async fn set_secret(&self, name: &str, value: &str) -> Result<()>;
    /// Deleting a missing secret is not an error.
    async fn delete_secret(&self, name: &str) -> Result<()>;
}

fn secure_store_error(e: impl fmt::Display) -> Error {
    Error::SecureStore {
        message: e.to_string(),
    }
}

/// [`SecureStore`] over the operating system keychain.
///
/// Keychain calls may block (unlock prompts, D-Bus round trips), so each one
/// runs on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    async fn with_entry<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(keyring::Entry) -> Result<T> + Send + 'static,
    {
        let service = self.service.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &name).map_err(secure_store_error)?;
            f(entry)
        })
        .await
        .map_err(secure_store_error)?
    }
}

#[async_trait]
impl SecureStore for KeyringStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        self.with_entry(name, |entry| match entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(secure_store_error(e)),
        })
        .await
    }

    async fn set_secret(&self, name: &str, value: &str) -> Result<()> {
        let value = value.to_string();
        self.with_entry(name, move |entry| {
            entry.set_password(&value).map_err(secure_store_error)
        })
        .await
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        self.with_entry(name, |entry| match entry.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(secure_store_error(e)),
        })
        .await
    }
}

/// In-process [`SecureStore`]. Counts reads so callers can verify how often
/// the cache fell through to the store.
#[derive(Debug, Default)]
pub struct MemorySecureStore {
    secrets: RwLock<HashMap<String, String>>,
    reads: AtomicUsize,
}

impl MemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(name: &str, value: &str) -> Self {
        let store = Self::new();
        store
            .secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), value.to_string());
        store
    }

    /// Number of `get_secret` calls served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecureStore for MemorySecureStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned())
    }

    async fn set_secret(&self, name: &str, value: &str) -> Result<()> {
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub cached_at: SystemTime,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("cached_at", &self.cached_at)
            .finish()
    }
}

pub struct CredentialCache {
    store: Arc<dyn SecureStore>,
    secret_name: String,
    policy: FreshnessPolicy,
    clock: Arc<dyn Clock>,
    slot: Mutex<Option<CacheEntry<String>>>,
}

impl CredentialCache {
    pub fn new(store: Arc<dyn SecureStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            secret_name: "auth-token".to_string(),
            policy: FreshnessPolicy::credential(),
            clock,
            slot: Mutex::new(None),
        }
    }

    /// Name under which the token lives in the secure store.
    pub fn with_secret_name(mut self, name: impl Into<String>) -> Self {
        self.secret_name = name.into();
        self
    }

    /// Override the slot lifetime. The slot has no stale window: whatever
    /// stale threshold the policy carries is ignored.
    pub fn with_policy(mut self, policy: FreshnessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }

    pub fn policy(&self) -> FreshnessPolicy {
        self.policy
    }

    /// The cached token while it is younger than the TTL, otherwise a fresh
    /// read from the secure store. A missing secret is an [`Error::Auth`].
    pub async fn get_token(&self) -> Result<Credential> {
        let mut slot = self.slot.lock().await;
        let now = self.clock.now();
        if let Some(entry) = slot.as_ref() {
            // a stale window would have to serve an unverified token; treat
            // anything short of expiry as usable and expiry as a miss
            match entry.classify(now) {
                Freshness::Fresh(token) | Freshness::Stale(token) => {
                    return Ok(Credential {
                        token: token.clone(),
                        cached_at: entry.cached_at,
                    });
                }
                Freshness::Miss => {}
            }
        }

        *slot = None;
        debug!(secret = %self.secret_name, "credential slot empty; reading secure store");
        let token = self
            .store
            .get_secret(&self.secret_name)
            .await?
            .ok_or_else(|| Error::auth("no stored credential"))?;
        let cached_at = self.clock.now();
        *slot = Some(CacheEntry::new(token.clone(), cached_at, self.policy));
        Ok(Credential { token, cached_at })
    }

    /// Forget the cached token; the next `get_token` reads the secure store.
    pub async fn invalidate(&self) {
        if self.slot.lock().await.take().is_some() {
            debug!(secret = %self.secret_name, "credential slot invalidated");
        }
    }

    pub async fn is_cached(&self) -> bool {
        let now = self.clock.now();
        self.slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Persist a new token and prime the slot with it.
    pub async fn sign_in(&self, token: &str) -> Result<Credential> {
        let mut slot = self.slot.lock().await;
        self.store.set_secret(&self.secret_name, token).await?;
        let cached_at = self.clock.now();
        *slot = Some(CacheEntry::new(token.to_string(), cached_at, self.policy));
        info!(secret = %self.secret_name, "signed in");
        Ok(Credential {
            token: token.to_string(),
            cached_at,
        })
    }

    /// Drop the slot and delete the stored secret.
    pub async fn sign_out(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        *slot = None;
        self.store.delete_secret(&self.secret_name).await
    }

    /// Run an outbound call with the current credential. An
    /// [`Error::Auth`] from the call invalidates the slot before it is
    /// returned, so the retry re-derives the token.
    pub async fn authorize<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: FnOnce(Credential) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let credential = self.get_token().await?;
        let result = call(credential).await;
        if let Err(e) = &result {
            if e.is_auth() {
                warn!(error = %e, "credential rejected; invalidating");
                self.invalidate().await;
            }
        }
        result
    }
}
