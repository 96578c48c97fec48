//! Host record storage.
//!
//! The orchestrator only needs get/list/update. Insert and remove exist for
//! administration and tests. Every write stamps `updated_at`, which is what
//! the reconciliation merge compares against.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use super::HostRecord;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// No host with this id.
    #[error("host not found: {0}")]
    NotFound(String),

    /// A host with this id already exists.
    #[error("host already exists: {0}")]
    AlreadyExists(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid host database: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Storage for host records.
///
/// Implementations serialize writes per record id.
#[async_trait]
pub trait HostStore: Send + Sync {
    async fn get(&self, id: &str) -> StoreResult<Option<HostRecord>>;

    async fn list(&self) -> StoreResult<Vec<HostRecord>>;

    /// Replace an existing record, stamping `updated_at`. Returns the stored copy.
    async fn update(&self, host: HostRecord) -> StoreResult<HostRecord>;

    async fn insert(&self, host: HostRecord) -> StoreResult<HostRecord>;

    async fn remove(&self, id: &str) -> StoreResult<()>;
}

fn apply_update(hosts: &mut BTreeMap<String, HostRecord>, mut host: HostRecord) -> StoreResult<HostRecord> {
    if !hosts.contains_key(&host.id) {
        return Err(StoreError::NotFound(host.id));
    }
    host.updated_at = Utc::now();
    hosts.insert(host.id.clone(), host.clone());
    Ok(host)
}

fn apply_insert(hosts: &mut BTreeMap<String, HostRecord>, mut host: HostRecord) -> StoreResult<HostRecord> {
    if hosts.contains_key(&host.id) {
        return Err(StoreError::AlreadyExists(host.id));
    }
    let now = Utc::now();
    host.created_at = now;
    host.updated_at = now;
    hosts.insert(host.id.clone(), host.clone());
    Ok(host)
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryHostStore {
    hosts: RwLock<BTreeMap<String, HostRecord>>,
}

impl MemoryHostStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store without touching timestamps.
    pub fn with_hosts(hosts: impl IntoIterator<Item = HostRecord>) -> Self {
        Self {
            hosts: RwLock::new(hosts.into_iter().map(|h| (h.id.clone(), h)).collect()),
        }
    }
}

#[async_trait]
impl HostStore for MemoryHostStore {
    async fn get(&self, id: &str) -> StoreResult<Option<HostRecord>> {
        Ok(self.hosts.read().await.get(id).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<HostRecord>> {
        Ok(self.hosts.read().await.values().cloned().collect())
    }

    async fn update(&self, host: HostRecord) -> StoreResult<HostRecord> {
        apply_update(&mut *self.hosts.write().await, host)
    }

    async fn insert(&self, host: HostRecord) -> StoreResult<HostRecord> {
        apply_insert(&mut *self.hosts.write().await, host)
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        self.hosts
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

// ============================================================================
// JSON file store
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct HostFile {
    #[serde(default)]
    hosts: Vec<HostRecord>,
}

/// Whole-file JSON store. Reads are served from memory; every write
/// rewrites the file through a temporary sibling and a rename.
#[derive(Debug)]
pub struct JsonFileHostStore {
    path: PathBuf,
    hosts: RwLock<BTreeMap<String, HostRecord>>,
    write_lock: Mutex<()>,
}

impl JsonFileHostStore {
    /// Open the file at `path`, creating an empty database if it does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let hosts = match fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => {
                let file: HostFile = serde_json::from_slice(&bytes)?;
                file.hosts.into_iter().map(|h| (h.id.clone(), h)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("loaded {} host(s) from {}", hosts.len(), path.display());

        Ok(Self {
            path,
            hosts: RwLock::new(hosts),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, hosts: &BTreeMap<String, HostRecord>) -> StoreResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let file = HostFile {
            hosts: hosts.values().cloned().collect(),
        };
        let body = serde_json::to_vec_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Apply `change` to a copy of the records, persist it, then publish it.
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, HostRecord>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.hosts.read().await.clone();
        let out = change(&mut next)?;
        self.flush(&next).await?;
        *self.hosts.write().await = next;
        Ok(out)
    }
}

#[async_trait]
impl HostStore for JsonFileHostStore {
    async fn get(&self, id: &str) -> StoreResult<Option<HostRecord>> {
        Ok(self.hosts.read().await.get(id).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<HostRecord>> {
        Ok(self.hosts.read().await.values().cloned().collect())
    }

    async fn update(&self, host: HostRecord) -> StoreResult<HostRecord> {
        self.mutate(|hosts| apply_update(hosts, host)).await
    }

    async fn insert(&self, host: HostRecord) -> StoreResult<HostRecord> {
        self.mutate(|hosts| apply_insert(hosts, host)).await
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        self.mutate(|hosts| {
            hosts
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        })
        .await
    }
}
