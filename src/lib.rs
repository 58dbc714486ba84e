//! # stalewise
//!
//! Policy-driven client-side caching with stale-while-revalidate reads,
//! per-key request coalescing, and declarative cascading invalidation.
//!
//! ## Overview
//!
//! Every read is classified against a per-namespace [`FreshnessPolicy`]:
//!
//! - **Fresh**: served from memory, no network activity
//! - **Stale**: served from memory while one background refresh runs
//! - **Miss**: the caller waits for a fetch shared with every concurrent caller
//!
//! Mutations write optimistically, run the remote call, then write the
//! authoritative value through and invalidate every dependent entry as one
//! atomic batch, or roll back on failure.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stalewise::{CacheEngine, CacheKey, EngineConfig, Freshness, MemorySecureStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> stalewise::Result<()> {
//!     let engine = CacheEngine::builder()
//!         .with_config(EngineConfig::standard())
//!         .with_secure_store(Arc::new(MemorySecureStore::new()))
//!         .build()?;
//!
//!     let details = engine.register::<serde_json::Value, _>("event-detail", |key: CacheKey| async move {
//!         // call the backend here
//!         Ok::<_, stalewise::Error>(serde_json::json!({ "id": key.identity(), "attendees": 3 }))
//!     })?;
//!
//!     match details.read("42").await? {
//!         Freshness::Fresh(event) | Freshness::Stale(event) => println!("{}", event),
//!         Freshness::Miss => unreachable!("read always resolves a miss"),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Freshness policy, store, in-flight registry, invalidation coordinator |
//! | [`namespace`] | Producers and typed namespace handles |
//! | [`entities`] | Standard namespaces, policies and edges |
//! | [`credentials`] | Short-lived credential slot over a secure store |
//! | [`persistence`] | Snapshot storage across restarts |
//! | [`config`] | YAML/JSON configuration with env overrides |
//! | [`engine`] | [`CacheEngine`] composition root |
//! | [`clock`] | Injectable time source |

pub mod cache;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod entities;
pub mod namespace;
pub mod persistence;

pub use cache::{
    CacheEntry, CacheKey, CacheStats, CacheStore, Freshness, FreshnessPolicy, InFlightRegistry,
    InvalidationCoordinator, InvalidationEdge, KeyPattern,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EdgeSettings, EngineConfig, NamespaceSettings};
pub use credentials::{Credential, CredentialCache, KeyringStore, MemorySecureStore, SecureStore};
pub use engine::{CacheEngine, CacheEngineBuilder};
pub use namespace::{Namespace, NamespaceConfig, Producer};
pub use persistence::{FileSnapshotStore, MemorySnapshotStore, PersistedEntry, SnapshotStore};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
