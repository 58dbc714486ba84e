//! Cache entries and read-time freshness classification.

use super::policy::FreshnessPolicy;
use crate::clock;
use std::time::{Duration, SystemTime};

/// Result of classifying a cached value at read time.
///
/// There is no implicit "null": callers must decide what to do with a stale
/// value instead of treating it like a fresh one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness<V> {
    /// `age < stale_after`
    Fresh(V),
    /// `stale_after <= age < ttl`
    Stale(V),
    /// Absent, or `age >= ttl`.
    Miss,
}

impl<V> Freshness<V> {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Freshness::Fresh(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Freshness::Stale(_))
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Freshness::Miss)
    }

    /// Borrow the value, whether fresh or stale.
    pub fn value(&self) -> Option<&V> {
        match self {
            Freshness::Fresh(v) | Freshness::Stale(v) => Some(v),
            Freshness::Miss => None,
        }
    }

    pub fn into_value(self) -> Option<V> {
        match self {
            Freshness::Fresh(v) | Freshness::Stale(v) => Some(v),
            Freshness::Miss => None,
        }
    }

    pub fn map<U, F>(self, f: F) -> Freshness<U>
    where
        F: FnOnce(V) -> U,
    {
        match self {
            Freshness::Fresh(v) => Freshness::Fresh(f(v)),
            Freshness::Stale(v) => Freshness::Stale(f(v)),
            Freshness::Miss => Freshness::Miss,
        }
    }

    /// Fallible map, used when decoding stored values into typed ones.
    pub fn try_map<U, E, F>(self, f: F) -> std::result::Result<Freshness<U>, E>
    where
        F: FnOnce(V) -> std::result::Result<U, E>,
    {
        Ok(match self {
            Freshness::Fresh(v) => Freshness::Fresh(f(v)?),
            Freshness::Stale(v) => Freshness::Stale(f(v)?),
            Freshness::Miss => Freshness::Miss,
        })
    }
}

/// A cached value with the stamp and policy needed to classify it.
///
/// Entries are never stored pre-classified; freshness is a pure function of
/// `now - cached_at` against the policy.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub value: V,
    pub cached_at: SystemTime,
    pub policy: FreshnessPolicy,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, cached_at: SystemTime, policy: FreshnessPolicy) -> Self {
        Self {
            value,
            cached_at,
            policy,
        }
    }

    pub fn age(&self, now: SystemTime) -> Duration {
        clock::age(self.cached_at, now)
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.age(now) >= self.policy.ttl()
    }

    /// Classify without consuming the entry.
    pub fn classify(&self, now: SystemTime) -> Freshness<&V> {
        let age = self.age(now);
        if age < self.policy.stale_after() {
            Freshness::Fresh(&self.value)
        } else if age < self.policy.ttl() {
            Freshness::Stale(&self.value)
        } else {
            Freshness::Miss
        }
    }
}

impl<V: Clone> CacheEntry<V> {
    pub fn classify_cloned(&self, now: SystemTime) -> Freshness<V> {
        self.classify(now).map(Clone::clone)
    }
}
