//! Optional snapshot storage so cached entries survive a process restart.
//!
//! Snapshots carry the original `cached_at` stamp. Restored entries are
//! classified against the wall clock, so anything that expired while the
//! process was down is dropped on load.

use crate::cache::{validate_namespace, CacheEntry, CacheKey, FreshnessPolicy};
use crate::clock::{from_millis, to_millis};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub key: CacheKey,
    pub value: Value,
    /// Milliseconds since the Unix epoch.
    pub cached_at_ms: u64,
}

impl PersistedEntry {
    pub fn from_entry(key: CacheKey, entry: &CacheEntry<Value>) -> Self {
        Self {
            key,
            value: entry.value.clone(),
            cached_at_ms: to_millis(entry.cached_at),
        }
    }

    /// Rebuild the entry under the namespace's current policy.
    pub fn into_entry(self, policy: FreshnessPolicy) -> (CacheKey, CacheEntry<Value>) {
        let entry = CacheEntry::new(self.value, from_millis(self.cached_at_ms), policy);
        (self.key, entry)
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Empty when nothing was saved for `namespace`.
    async fn load_snapshot(&self, namespace: &str) -> Result<Vec<PersistedEntry>>;
    /// Replace the saved snapshot for `namespace`.
    async fn save_snapshot(&self, namespace: &str, entries: Vec<PersistedEntry>) -> Result<()>;
}

/// One JSON file per namespace under a directory.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, namespace: &str) -> Result<PathBuf> {
        // namespace names cannot contain path separators
        validate_namespace(namespace)?;
        Ok(self.dir.join(format!("{}.json", namespace)))
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::persistence_with_context(
        format!("{}: {}", action, e),
        ErrorContext::new()
            .with_field_path(path.display().to_string())
            .with_source("snapshot"),
    )
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load_snapshot(&self, namespace: &str) -> Result<Vec<PersistedEntry>> {
        let path = self.path_for(namespace)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("reading snapshot", &path, e)),
        };
        serde_json::from_str(&content).map_err(|e| {
            Error::persistence_with_context(
                format!("malformed snapshot: {}", e),
                ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_source("snapshot"),
            )
        })
    }

    async fn save_snapshot(&self, namespace: &str, entries: Vec<PersistedEntry>) -> Result<()> {
        let path = self.path_for(namespace)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error("creating snapshot dir", &self.dir, e))?;

        let content = serde_json::to_vec_pretty(&entries)?;
        // write-then-rename so a crash never leaves a truncated snapshot
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| io_error("writing snapshot", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("replacing snapshot", &path, e))?;
        debug!(namespace, entries = entries.len(), path = %path.display(), "snapshot saved");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Vec<PersistedEntry>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load_snapshot(&self, namespace: &str) -> Result<Vec<PersistedEntry>> {
        Ok(self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_snapshot(&self, namespace: &str, entries: Vec<PersistedEntry>) -> Result<()> {
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace.to_string(), entries);
        Ok(())
    }
}
