//! Freshness policies.

use crate::{Error, ErrorContext, Result};
use std::time::Duration;

/// How long an entry is served as-is (`stale_after`) and how long it may
/// still be served while a refresh runs (`ttl`).
///
/// Invariant: `0 < stale_after <= ttl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    ttl: Duration,
    stale_after: Duration,
}

impl FreshnessPolicy {
    pub fn new(ttl: Duration, stale_after: Duration) -> Result<Self> {
        if ttl.is_zero() {
            return Err(Error::configuration_with_context(
                "ttl must be greater than zero",
                ErrorContext::new().with_source("policy"),
            ));
        }
        if stale_after.is_zero() || stale_after > ttl {
            return Err(Error::configuration_with_context(
                "stale_after must be in (0, ttl]",
                ErrorContext::new()
                    .with_details(format!(
                        "ttl={}ms stale_after={}ms",
                        ttl.as_millis(),
                        stale_after.as_millis()
                    ))
                    .with_source("policy"),
            ));
        }
        Ok(Self { ttl, stale_after })
    }

    /// Policy with no background-refresh tier: the entry is fresh until it expires.
    pub fn fixed(ttl: Duration) -> Result<Self> {
        Self::new(ttl, ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Whether entries under this policy ever pass through the stale tier.
    pub fn has_stale_window(&self) -> bool {
        self.stale_after < self.ttl
    }

    /// List-style data: long TTL, short stale threshold.
    pub fn list() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 3600),
            stale_after: Duration::from_secs(3600),
        }
    }

    /// Detail views: medium TTL, stale threshold close to it.
    pub fn detail() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            stale_after: Duration::from_secs(25 * 60),
        }
    }

    /// Relationship status (e.g. RSVP): short-lived, refreshed near expiry.
    pub fn relationship() -> Self {
        Self {
            ttl: Duration::from_secs(10 * 60),
            stale_after: Duration::from_secs(8 * 60),
        }
    }

    pub fn profile() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            stale_after: Duration::from_secs(50 * 60),
        }
    }

    /// Short-lived credentials; expiry must block.
    pub fn credential() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            stale_after: Duration::from_secs(300),
        }
    }
}
