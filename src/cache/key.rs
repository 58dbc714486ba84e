//! Namespaced cache keys and invalidation patterns.

use crate::{Error, ErrorContext, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static NAMESPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("namespace regex is valid"));

pub(crate) fn validate_namespace(namespace: &str) -> Result<()> {
    if NAMESPACE_RE.is_match(namespace) {
        Ok(())
    } else {
        Err(Error::configuration_with_context(
            "invalid namespace name",
            ErrorContext::new()
                .with_field_path(namespace)
                .with_details("expected lowercase letters, digits, '-' or '_'"),
        ))
    }
}

/// `{namespace}:{identity}`, e.g. `event-detail:42` or `events-list:upcoming`.
///
/// Opaque to the store; the namespace selects policy and invalidation edges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey {
    full: String,
    split: usize,
}

impl CacheKey {
    pub fn new(namespace: &str, identity: &str) -> Result<Self> {
        validate_namespace(namespace)?;
        if identity.is_empty() {
            return Err(Error::configuration_with_context(
                "cache key identity must not be empty",
                ErrorContext::new().with_field_path(namespace),
            ));
        }
        Ok(Self {
            full: format!("{}:{}", namespace, identity),
            split: namespace.len(),
        })
    }

    /// Parse `namespace:identity`. The identity may itself contain `:`.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((ns, id)) => Self::new(ns, id),
            None => Err(Error::configuration_with_context(
                "cache key must have the form namespace:identity",
                ErrorContext::new().with_field_path(s),
            )),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.full[..self.split]
    }

    pub fn identity(&self) -> &str {
        &self.full[self.split + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<CacheKey> for String {
    fn from(k: CacheKey) -> Self {
        k.full
    }
}

/// Side of an invalidation edge.
///
/// - `ns:*` matches every key in `ns`
/// - `ns:{id}` matches every key in `ns` and binds its identity, so a target
///   of the same form resolves to the key with that identity
/// - `ns:prefix*` matches every key in `ns` whose identity starts with `prefix`
/// - `ns:literal` matches exactly one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    Namespace(String),
    Identity(String),
    Prefix { namespace: String, prefix: String },
    Exact(CacheKey),
}

impl KeyPattern {
    pub fn parse(s: &str) -> Result<Self> {
        let (ns, id) = s.split_once(':').ok_or_else(|| {
            Error::configuration_with_context(
                "pattern must have the form namespace:identity",
                ErrorContext::new().with_field_path(s).with_source("edges"),
            )
        })?;
        validate_namespace(ns)?;
        if id == "*" {
            Ok(KeyPattern::Namespace(ns.to_string()))
        } else if id.len() > 2 && id.starts_with('{') && id.ends_with('}') {
            Ok(KeyPattern::Identity(ns.to_string()))
        } else {
            match id.strip_suffix('*') {
                Some(prefix) if !prefix.contains('*') => Ok(KeyPattern::Prefix {
                    namespace: ns.to_string(),
                    prefix: prefix.to_string(),
                }),
                _ if id.contains('*') => Err(Error::configuration_with_context(
                    "'*' is only allowed at the end of a pattern",
                    ErrorContext::new().with_field_path(s).with_source("edges"),
                )),
                _ => Ok(KeyPattern::Exact(CacheKey::new(ns, id)?)),
            }
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            KeyPattern::Namespace(ns) | KeyPattern::Identity(ns) => ns,
            KeyPattern::Prefix { namespace, .. } => namespace,
            KeyPattern::Exact(k) => k.namespace(),
        }
    }

    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            KeyPattern::Namespace(ns) | KeyPattern::Identity(ns) => key.namespace() == ns,
            KeyPattern::Prefix { namespace, prefix } => {
                key.namespace() == namespace && key.identity().starts_with(prefix.as_str())
            }
            KeyPattern::Exact(k) => k == key,
        }
    }

    /// Whether some key in `namespace` starting with `prefix` could match.
    pub(crate) fn overlaps_prefix(&self, namespace: &str, prefix: &str) -> bool {
        if self.namespace() != namespace {
            return false;
        }
        match self {
            KeyPattern::Namespace(_) | KeyPattern::Identity(_) => true,
            KeyPattern::Prefix { prefix: own, .. } => {
                own.starts_with(prefix) || prefix.starts_with(own.as_str())
            }
            KeyPattern::Exact(k) => k.identity().starts_with(prefix),
        }
    }

    pub fn binds_identity(&self) -> bool {
        matches!(self, KeyPattern::Identity(_))
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::Namespace(ns) => write!(f, "{}:*", ns),
            KeyPattern::Identity(ns) => write!(f, "{}:{{id}}", ns),
            KeyPattern::Prefix { namespace, prefix } => write!(f, "{}:{}*", namespace, prefix),
            KeyPattern::Exact(k) => write!(f, "{}", k),
        }
    }
}
