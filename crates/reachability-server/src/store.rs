//! Storage backends behind the persistence gateway.

use crate::types::{LogEvent, ProbeResult, Record};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is busy")]
    Busy,

    #[error("store is locked")]
    Locked,

    #[error("store connection is closed")]
    Closed,

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Busy or locked: the write may succeed if tried again shortly
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::Busy | StoreError::Locked)
    }
}

impl From<StoreError> for common::Error {
    fn from(e: StoreError) -> Self {
        common::Error::persistence(e)
    }
}

/// Open connection to a store. Shared by every writer.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    async fn write(&self, record: &Record) -> Result<(), StoreError>;

    /// Cheap liveness check
    async fn ping(&self) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Opens connections; used for the initial connect and for every reconnect
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn StoreConnection>, StoreError>;

    fn describe(&self) -> String;
}

fn validate(record: &Record) -> Result<(), StoreError> {
    if let Record::Event(event) = record {
        if event.category.is_empty() {
            return Err(StoreError::InvalidRecord("event without category".to_string()));
        }
    }
    Ok(())
}

/// Append-only JSON-lines file
pub struct JsonLinesConnector {
    path: PathBuf,
    lock_wait: Duration,
}

impl JsonLinesConnector {
    pub fn new(path: impl Into<PathBuf>, lock_wait: Duration) -> Self {
        Self {
            path: path.into(),
            lock_wait,
        }
    }
}

#[async_trait]
impl StoreConnector for JsonLinesConnector {
    async fn connect(&self) -> Result<Arc<dyn StoreConnection>, StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        debug!(path = %self.path.display(), "Opened results file");

        Ok(Arc::new(JsonLinesConnection {
            path: self.path.clone(),
            lock_wait: self.lock_wait,
            file: tokio::sync::Mutex::new(Some(file)),
        }))
    }

    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }
}

pub struct JsonLinesConnection {
    path: PathBuf,
    lock_wait: Duration,
    file: tokio::sync::Mutex<Option<File>>,
}

impl JsonLinesConnection {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StoreConnection for JsonLinesConnection {
    async fn write(&self, record: &Record) -> Result<(), StoreError> {
        validate(record)?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut guard = tokio::time::timeout(self.lock_wait, self.file.lock())
            .await
            .map_err(|_| StoreError::Busy)?;
        let file = guard.as_mut().ok_or(StoreError::Closed)?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.file.lock().await.is_none() {
            return Err(StoreError::Closed);
        }
        // The file may have been rotated or deleted under us
        if !tokio::fs::try_exists(&self.path).await? {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    records: Vec<Record>,
    write_attempts: u32,
    connects: u64,
    broken_up_to: u64,
    always_busy: bool,
    refuse_connects: bool,
    fail_next: VecDeque<StoreError>,
    closed: u32,
}

/// In-process store with injectable failures. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every write fails with `Busy` while set
    pub fn set_always_busy(&self, busy: bool) {
        self.state().always_busy = busy;
    }

    /// Queue an error for the next write attempt
    pub fn fail_next(&self, error: StoreError) {
        self.state().fail_next.push_back(error);
    }

    /// Break every connection opened so far. New connections are healthy.
    pub fn break_connections(&self) {
        let mut state = self.state();
        state.broken_up_to = state.connects;
    }

    pub fn set_refuse_connects(&self, refuse: bool) {
        self.state().refuse_connects = refuse;
    }

    pub fn records(&self) -> Vec<Record> {
        self.state().records.clone()
    }

    pub fn probe_results(&self) -> Vec<ProbeResult> {
        self.state()
            .records
            .iter()
            .filter_map(|r| match r {
                Record::ProbeResult(result) => Some(result.clone()),
                Record::Event(_) => None,
            })
            .collect()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.state()
            .records
            .iter()
            .filter_map(|r| match r {
                Record::Event(event) => Some(event.clone()),
                Record::ProbeResult(_) => None,
            })
            .collect()
    }

    /// Write attempts seen, successful or not
    pub fn write_attempts(&self) -> u32 {
        self.state().write_attempts
    }

    /// Successful connects
    pub fn connects(&self) -> u64 {
        self.state().connects
    }

    pub fn closed(&self) -> u32 {
        self.state().closed
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(&self) -> Result<Arc<dyn StoreConnection>, StoreError> {
        let mut state = self.state();
        if state.refuse_connects {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory store refusing connections",
            )));
        }
        state.connects += 1;
        Ok(Arc::new(MemoryConnection {
            store: self.clone(),
            generation: state.connects,
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryConnection {
    store: MemoryStore,
    generation: u64,
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn write(&self, record: &Record) -> Result<(), StoreError> {
        let mut state = self.store.state();
        state.write_attempts += 1;
        if self.generation <= state.broken_up_to {
            return Err(StoreError::Closed);
        }
        if state.always_busy {
            return Err(StoreError::Busy);
        }
        if let Some(error) = state.fail_next.pop_front() {
            return Err(error);
        }
        validate(record)?;
        state.records.push(record.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.generation <= self.store.state().broken_up_to {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.store.state().closed += 1;
        Ok(())
    }
}
