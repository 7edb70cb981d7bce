//! Host registry interface and the two registries shipped with the server.

use crate::types::{Host, HostId, HostStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Default polling interval for seeded hosts
pub const DEFAULT_HOST_INTERVAL: Duration = Duration::from_secs(30);

/// Shortest interval the file registry hands out
pub const MIN_HOST_INTERVAL: Duration = Duration::from_secs(1);

/// Registry read errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("failed to access hosts file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse hosts file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl From<RegistryError> for common::Error {
    fn from(e: RegistryError) -> Self {
        common::Error::registry(e)
    }
}

/// Source of host records. Records may change or disappear between any two reads.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostRegistry: Send + Sync {
    /// Full snapshot read
    async fn list_hosts(&self) -> Result<Vec<Host>, RegistryError>;

    /// Single record read; `Ok(None)` when the host does not exist
    async fn get_host(&self, id: HostId) -> Result<Option<Host>, RegistryError>;
}

/// Hosts every fresh installation starts with
pub fn default_hosts() -> Vec<Host> {
    vec![
        Host::new(1, "localhost", "127.0.0.1", DEFAULT_HOST_INTERVAL)
            .with_category("local", "Localhost"),
        Host::new(2, "google.com", "8.8.8.8", DEFAULT_HOST_INTERVAL)
            .with_category("public", "Google DNS"),
        Host::new(3, "cloudflare.com", "1.1.1.1", DEFAULT_HOST_INTERVAL)
            .with_category("public", "Cloudflare DNS"),
    ]
}

/// In-process registry, mutable at runtime
#[derive(Default)]
pub struct InMemoryRegistry {
    hosts: RwLock<BTreeMap<HostId, Host>>,
    unavailable: AtomicBool,
}

impl InMemoryRegistry {
    pub fn new(hosts: impl IntoIterator<Item = Host>) -> Self {
        Self {
            hosts: RwLock::new(hosts.into_iter().map(|h| (h.id, h)).collect()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Insert or replace a host
    pub async fn upsert(&self, host: Host) {
        self.hosts.write().await.insert(host.id, host);
    }

    pub async fn remove(&self, id: HostId) -> Option<Host> {
        self.hosts.write().await.remove(&id)
    }

    /// Change a host's status; returns false when the host does not exist
    pub async fn set_status(&self, id: HostId, status: HostStatus) -> bool {
        match self.hosts.write().await.get_mut(&id) {
            Some(host) => {
                host.status = status;
                true
            }
            None => false,
        }
    }

    /// Change a host's polling interval; returns false when the host does not exist
    pub async fn set_interval(&self, id: HostId, interval: Duration) -> bool {
        match self.hosts.write().await.get_mut(&id) {
            Some(host) => {
                host.interval = interval;
                true
            }
            None => false,
        }
    }

    /// Make every read fail until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RegistryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("registry marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl HostRegistry for InMemoryRegistry {
    async fn list_hosts(&self) -> Result<Vec<Host>, RegistryError> {
        self.check_available()?;
        Ok(self.hosts.read().await.values().cloned().collect())
    }

    async fn get_host(&self, id: HostId) -> Result<Option<Host>, RegistryError> {
        self.check_available()?;
        Ok(self.hosts.read().await.get(&id).cloned())
    }
}

/// On-disk layout of the hosts file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostsFile {
    #[serde(default)]
    pub hosts: Vec<Host>,
}

/// Registry backed by a YAML file, re-read on every call so edits apply on the next refresh
pub struct FileRegistry {
    path: PathBuf,
    min_interval: Duration,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            min_interval: MIN_HOST_INTERVAL,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the default hosts when the file does not exist yet.
    ///
    /// Returns true when a file was created.
    pub async fn seed_defaults(&self) -> Result<bool, RegistryError> {
        if tokio::fs::try_exists(&self.path).await? {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let contents = serde_yaml::to_string(&HostsFile {
            hosts: default_hosts(),
        })?;
        tokio::fs::write(&self.path, contents).await?;
        info!(path = %self.path.display(), "Seeded hosts file with default hosts");
        Ok(true)
    }

    async fn load(&self) -> Result<Vec<Host>, RegistryError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let file: HostsFile = serde_yaml::from_str(&contents)?;

        let hosts = file
            .hosts
            .into_iter()
            .map(|mut host| {
                if host.interval < self.min_interval {
                    warn!(
                        host_id = host.id,
                        interval = ?host.interval,
                        floor = ?self.min_interval,
                        "Host interval below floor, clamping"
                    );
                    host.interval = self.min_interval;
                }
                host
            })
            .collect::<Vec<_>>();

        debug!(path = %self.path.display(), count = hosts.len(), "Loaded hosts file");
        Ok(hosts)
    }
}

#[async_trait]
impl HostRegistry for FileRegistry {
    async fn list_hosts(&self) -> Result<Vec<Host>, RegistryError> {
        self.load().await
    }

    async fn get_host(&self, id: HostId) -> Result<Option<Host>, RegistryError> {
        Ok(self.load().await?.into_iter().find(|h| h.id == id))
    }
}
