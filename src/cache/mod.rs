//! # Cache Core
//!
//! Policy-driven, single-process cache primitives: freshness classification,
//! an LRU-bounded keyed store, per-key request coalescing, and declarative
//! cascading invalidation.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`FreshnessPolicy`] | `ttl` / `stale_after` pair assigned per namespace |
//! | [`CacheEntry`] | Value plus `cached_at` stamp and policy |
//! | [`Freshness`] | Three-way read result: `Fresh`, `Stale`, `Miss` |
//! | [`CacheKey`] | `{namespace}:{identity}` identifier |
//! | [`KeyPattern`] | `ns:*`, `ns:{id}` or exact key, used by edges |
//! | [`CacheStore`] | Namespace-sharded LRU store with atomic batches |
//! | [`InFlightRegistry`] | At most one outstanding producer call per key |
//! | [`InvalidationCoordinator`] | Edge table, mutation protocol, sign-out |
//! | [`CacheStats`] | Hit/miss/fetch/eviction counters |
//!
//! ## Example
//!
//! ```rust
//! use stalewise::cache::{CacheKey, CacheStore, Freshness, FreshnessPolicy};
//! use std::num::NonZeroUsize;
//! use std::time::{Duration, SystemTime};
//!
//! let store = CacheStore::new(NonZeroUsize::new(128).unwrap());
//! let key = CacheKey::parse("events-list:upcoming").unwrap();
//! let now = SystemTime::now();
//!
//! store.put(&key, vec![1, 2, 3], FreshnessPolicy::list(), now);
//! assert!(matches!(store.get(&key, now), Freshness::Fresh(_)));
//! assert!(store.get(&key, now + Duration::from_secs(2 * 3600)).is_stale());
//! ```

mod coordinator;
mod entry;
mod inflight;
mod key;
mod policy;
mod stats;
mod store;

pub use coordinator::{InvalidationCoordinator, InvalidationEdge};
pub use entry::{CacheEntry, Freshness};
pub use inflight::{InFlightRegistry, SharedFetch};
pub use key::{CacheKey, KeyPattern};
pub use policy::FreshnessPolicy;
pub use stats::CacheStats;
pub use store::{CacheStore, StoreOp};

pub(crate) use key::validate_namespace;
pub(crate) use stats::AtomicStats;
