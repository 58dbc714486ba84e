//! Engine configuration.
//!
//! Loaded from YAML (or JSON, which YAML accepts) and optionally adjusted by
//! environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `STALEWISE_MAX_ENTRIES` | `default_max_entries` |
//! | `STALEWISE_CREDENTIAL_TTL_SECS` | `credential_ttl_secs` |
//! | `STALEWISE_SWEEP_INTERVAL_SECS` | `sweep_interval_secs` |
//!
//! ```yaml
//! default_max_entries: 256
//! namespaces:
//!   events-list: { ttl_secs: 86400, stale_after_secs: 3600 }
//!   event-detail: { ttl_secs: 1800, stale_after_secs: 1500, max_entries: 64 }
//! edges:
//!   - { from: "event-detail:{id}", to: "events-list:*" }
//! ```

use crate::cache::{validate_namespace, FreshnessPolicy, InvalidationEdge};
use crate::entities;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

fn default_max_entries() -> usize {
    512
}

fn default_credential_ttl_secs() -> u64 {
    300
}

fn default_secret_name() -> String {
    "auth-token".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceSettings {
    pub ttl_secs: u64,
    /// Defaults to `ttl_secs` (no stale window).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_after_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
}

impl NamespaceSettings {
    pub fn policy(&self) -> Result<FreshnessPolicy> {
        let ttl = Duration::from_secs(self.ttl_secs);
        let stale_after = Duration::from_secs(self.stale_after_secs.unwrap_or(self.ttl_secs));
        FreshnessPolicy::new(ttl, stale_after)
    }

    pub fn capacity(&self) -> Result<Option<NonZeroUsize>> {
        match self.max_entries {
            None => Ok(None),
            Some(n) => NonZeroUsize::new(n).map(Some).ok_or_else(|| {
                Error::configuration_with_context(
                    "max_entries must be greater than zero",
                    ErrorContext::new().with_source("config"),
                )
            }),
        }
    }

    fn from_policy(policy: FreshnessPolicy) -> Self {
        Self {
            ttl_secs: policy.ttl().as_secs(),
            stale_after_secs: Some(policy.stale_after().as_secs()),
            max_entries: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSettings {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// LRU bound for namespaces without their own `max_entries`.
    #[serde(default = "default_max_entries")]
    pub default_max_entries: usize,
    #[serde(default = "default_credential_ttl_secs")]
    pub credential_ttl_secs: u64,
    /// Secure-store name of the credential secret.
    #[serde(default = "default_secret_name")]
    pub credential_secret_name: String,
    /// Interval of the optional expired-entry sweep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep_interval_secs: Option<u64>,
    #[serde(default)]
    pub namespaces: BTreeMap<String, NamespaceSettings>,
    #[serde(default)]
    pub edges: Vec<EdgeSettings>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_entries: default_max_entries(),
            credential_ttl_secs: default_credential_ttl_secs(),
            credential_secret_name: default_secret_name(),
            sweep_interval_secs: None,
            namespaces: BTreeMap::new(),
            edges: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// The standard entity namespaces and edges from [`entities`].
    pub fn standard() -> Self {
        let namespaces = [
            entities::EVENTS_LIST,
            entities::EVENT_DETAIL,
            entities::RSVP_STATUS,
            entities::PROFILE,
        ]
        .into_iter()
        .filter_map(|ns| {
            entities::default_policy(ns).map(|p| (ns.to_string(), NamespaceSettings::from_policy(p)))
        })
        .collect();
        let edges = entities::default_edges()
            .into_iter()
            .map(|(from, to)| EdgeSettings {
                from: from.to_string(),
                to: to.to_string(),
            })
            .collect();
        Self {
            namespaces,
            edges,
            ..Self::default()
        }
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::configuration_with_context(
                format!("failed to read config: {}", e),
                ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_source("config"),
            )
        })?;
        Self::from_yaml_str(&content)
    }

    /// Apply `STALEWISE_*` environment overrides. Unparseable values are ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(n) = lookup("STALEWISE_MAX_ENTRIES").and_then(|s| s.parse::<usize>().ok()) {
            self.default_max_entries = n;
        }
        if let Some(secs) =
            lookup("STALEWISE_CREDENTIAL_TTL_SECS").and_then(|s| s.parse::<u64>().ok())
        {
            self.credential_ttl_secs = secs;
        }
        if let Some(secs) =
            lookup("STALEWISE_SWEEP_INTERVAL_SECS").and_then(|s| s.parse::<u64>().ok())
        {
            self.sweep_interval_secs = Some(secs).filter(|s| *s > 0);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.default_capacity()?;
        self.credential_policy()?;
        for (name, settings) in &self.namespaces {
            let in_namespace = |e: Error| match e {
                Error::Configuration { message, context } => Error::Configuration {
                    message,
                    context: context.with_field_path(format!("namespaces.{}", name)),
                },
                other => other,
            };
            validate_namespace(name)?;
            if name == entities::AUTH_TOKEN {
                return Err(in_namespace(Error::configuration_with_context(
                    "the credential slot is configured with credential_ttl_secs",
                    ErrorContext::new().with_source("config"),
                )));
            }
            settings.policy().map_err(in_namespace)?;
            settings.capacity().map_err(in_namespace)?;
        }
        for edge in &self.edges {
            InvalidationEdge::parse(&edge.from, &edge.to)?;
        }
        if self.sweep_interval_secs == Some(0) {
            return Err(Error::configuration_with_context(
                "sweep_interval_secs must be greater than zero",
                ErrorContext::new().with_source("config"),
            ));
        }
        Ok(())
    }

    pub fn default_capacity(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.default_max_entries).ok_or_else(|| {
            Error::configuration_with_context(
                "default_max_entries must be greater than zero",
                ErrorContext::new().with_source("config"),
            )
        })
    }

    pub fn credential_policy(&self) -> Result<FreshnessPolicy> {
        FreshnessPolicy::fixed(Duration::from_secs(self.credential_ttl_secs))
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const YAML: &str = r#"
default_max_entries: 64
namespaces:
  events-list: { ttl_secs: 86400, stale_after_secs: 3600 }
  event-detail:
    ttl_secs: 1800
    stale_after_secs: 1500
    max_entries: 16
edges:
  - { from: "event-detail:{id}", to: "events-list:*" }
"#;

    #[test]
    fn test_parse_yaml() {
        let config = EngineConfig::from_yaml_str(YAML).unwrap();
        assert_eq!(config.default_max_entries, 64);
        assert_eq!(config.credential_ttl_secs, 300);
        assert_eq!(config.credential_secret_name, "auth-token");
        let detail = &config.namespaces["event-detail"];
        assert_eq!(detail.capacity().unwrap().map(NonZeroUsize::get), Some(16));
        assert_eq!(detail.policy().unwrap(), FreshnessPolicy::detail());
        assert!(config.namespaces["events-list"].policy().unwrap().has_stale_window());
        assert_eq!(config.edges.len(), 1);
    }

    #[test]
    fn test_parse_json() {
        let config = EngineConfig::from_yaml_str(
            r#"{"namespaces": {"profile": {"ttl_secs": 3600, "stale_after_secs": 3000}}}"#,
        )
        .unwrap();
        assert_eq!(config.namespaces["profile"].policy().unwrap(), FreshnessPolicy::profile());
        assert_eq!(config.default_max_entries, 512);
    }

    #[test]
    fn test_rejects_stale_after_beyond_ttl() {
        let err = EngineConfig::from_yaml_str(
            "namespaces:\n  profile: { ttl_secs: 60, stale_after_secs: 120 }\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("namespaces.profile"));
    }

    #[test]
    fn test_rejects_bad_edges_and_capacities() {
        assert!(EngineConfig::from_yaml_str(
            "edges:\n  - { from: \"events-list:*\", to: \"event-detail:{id}\" }\n"
        )
        .is_err());
        assert!(EngineConfig::from_yaml_str("default_max_entries: 0\n").is_err());
        assert!(EngineConfig::from_yaml_str(
            "namespaces:\n  profile: { ttl_secs: 60, max_entries: 0 }\n"
        )
        .is_err());
        assert!(EngineConfig::from_yaml_str("credential_ttl_secs: 0\n").is_err());
    }

    #[test]
    fn test_rejects_credential_namespace_settings() {
        let err = EngineConfig::from_yaml_str(
            "credential_ttl_secs: 120\nnamespaces:\n  auth-token: { ttl_secs: 300 }\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("credential_ttl_secs"));
        assert!(err.to_string().contains("namespaces.auth-token"));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("STALEWISE_MAX_ENTRIES", "1024"),
            ("STALEWISE_CREDENTIAL_TTL_SECS", "not-a-number"),
            ("STALEWISE_SWEEP_INTERVAL_SECS", "30"),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::default()
            .with_overrides(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.default_max_entries, 1024);
        assert_eq!(config.credential_ttl_secs, 300);
        assert_eq!(config.sweep_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_standard_config_is_valid() {
        let config = EngineConfig::standard();
        config.validate().unwrap();
        assert_eq!(config.namespaces.len(), 4);
        assert_eq!(config.edges.len(), 3);
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.yaml");
        tokio::fs::write(&path, YAML).await.unwrap();
        let config = EngineConfig::from_file(&path).await.unwrap();
        assert_eq!(config.namespaces.len(), 2);
        assert!(EngineConfig::from_file(dir.path().join("missing.yaml")).await.is_err());
    }
}
