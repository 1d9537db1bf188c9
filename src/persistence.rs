use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::HistoryEntry;

/// Minimal key-value persistence boundary shared by the budget ledger and
/// the history log. Values are opaque strings; callers own serialization.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str) -> Result<()>;
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        (**self).put(key, value).await
    }
}

/// Process-local store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("store lock poisoned"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// File-backed store: one file per key under a base directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    base_dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Keys may contain `/` as a namespace separator; everything else
    /// non-alphanumeric is flattened so a key cannot escape the base dir.
    fn path_for(&self, key: &str) -> PathBuf {
        let sanitized = key
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect::<String>();
        self.base_dir.join(format!("{sanitized}.json"))
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.base_dir.display()))?;
        let path = self.path_for(key);
        tokio::fs::write(&path, value)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

// ============================================================
// File sink
// ============================================================

/// File-writing boundary handed to external renderers: bytes in, final
/// path out, invoked once per requested output format.
#[async_trait]
pub trait FileSink: Send + Sync {
    async fn write(&self, bytes: &[u8], file_name: &str) -> Result<String>;
}

/// Writes artifacts under a base directory with sanitized file names.
#[derive(Debug, Clone)]
pub struct LocalFileSink {
    base_dir: PathBuf,
}

impl LocalFileSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl FileSink for LocalFileSink {
    async fn write(&self, bytes: &[u8], file_name: &str) -> Result<String> {
        let sanitized = file_name
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect::<String>();

        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.base_dir.display()))?;
        let path = self.base_dir.join(sanitized);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path.display().to_string())
    }
}

// ============================================================
// History log
// ============================================================

const HISTORY_INDEX_KEY: &str = "history/index";

/// Append-only audit log of completed generations, newest first on read.
pub struct HistoryLog<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> HistoryLog<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    fn entry_key(id: Uuid) -> String {
        format!("history/entry/{id}")
    }

    async fn read_index(&self) -> Result<Vec<Uuid>> {
        match self.store.get(HISTORY_INDEX_KEY).await? {
            Some(raw) => serde_json::from_str(&raw).context("Failed to decode history index"),
            None => Ok(Vec::new()),
        }
    }

    /// Write the entry record, then the updated index. Entries are never
    /// rewritten once stored.
    pub async fn append(&self, entry: &HistoryEntry) -> Result<()> {
        let record = serde_json::to_string(entry).context("Failed to encode history entry")?;
        self.store.put(&Self::entry_key(entry.id), &record).await?;

        let mut index = self.read_index().await?;
        index.push(entry.id);
        let encoded = serde_json::to_string(&index).context("Failed to encode history index")?;
        self.store.put(HISTORY_INDEX_KEY, &encoded).await
    }

    pub async fn list(&self) -> Result<Vec<HistoryEntry>> {
        let index = self.read_index().await?;
        let mut entries = Vec::with_capacity(index.len());
        for id in index.iter().rev() {
            match self.store.get(&Self::entry_key(*id)).await? {
                Some(raw) => entries.push(
                    serde_json::from_str(&raw)
                        .with_context(|| format!("Failed to decode history entry {id}"))?,
                ),
                None => tracing::warn!(id = %id, "History index points at missing entry"),
            }
        }
        Ok(entries)
    }
}
