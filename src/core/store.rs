//! Position persistence
//!
//! The engine never waits on storage. It publishes the latest position
//! snapshot on a `watch` channel; a writer task saves it, retrying failed
//! saves with backoff. A newer snapshot replaces one still being retried, so
//! the store converges on the latest in-memory state and never reverts an
//! exit decision already taken.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::shared::{Backoff, ReconnectConfig};
use crate::config::StoreConfig;

use super::position::Position;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything persisted: open positions plus the closed archive
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredPositions {
    #[serde(default)]
    pub open: Vec<Position>,
    #[serde(default)]
    pub closed: Vec<Position>,
    #[serde(default)]
    pub saved_at_ms: u64,
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Load the last saved state; empty when nothing was saved yet
    async fn load(&self) -> Result<StoredPositions, StoreError>;

    async fn save(&self, positions: &StoredPositions) -> Result<(), StoreError>;

    fn describe(&self) -> String;
}

// =============================================================================
// JSON file store
// =============================================================================

/// Pretty-printed JSON file, replaced atomically via a temp file + rename
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl PositionStore for JsonFileStore {
    async fn load(&self) -> Result<StoredPositions, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "[STORE] No saved positions");
                return Ok(StoredPositions::default());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, positions: &StoredPositions) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(positions)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Volatile store used when no file is configured, and by tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoredPositions>,
    /// Number of upcoming saves that fail
    pub fail_next_saves: AtomicU32,
    pub saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: StoredPositions) -> Self {
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> StoredPositions {
        self.state.lock().clone()
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn load(&self) -> Result<StoredPositions, StoreError> {
        Ok(self.state.lock().clone())
    }

    async fn save(&self, positions: &StoredPositions) -> Result<(), StoreError> {
        let failing = self
            .fail_next_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated save failure",
            )));
        }
        *self.state.lock() = positions.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// =============================================================================
// Writer task
// =============================================================================

/// Save every snapshot published on `snapshots` until cancelled, then flush
/// the latest one.
pub fn spawn_store_writer(
    store: Arc<dyn PositionStore>,
    mut snapshots: watch::Receiver<StoredPositions>,
    config: &StoreConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let retry_attempts = config.retry_attempts.max(1);
    let retry = ReconnectConfig {
        base_delay_ms: config.retry_delay_ms,
        max_delay_ms: config.retry_delay_ms.saturating_mul(16),
        jitter_ms: 0,
    };

    tokio::spawn(async move {
        info!(store = %store.describe(), "[STORE] Writer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let mut pending = snapshots.borrow_and_update().clone();
            let mut backoff = Backoff::new(retry.clone());
            loop {
                match store.save(&pending).await {
                    Ok(()) => {
                        debug!(
                            open = pending.open.len(),
                            closed = pending.closed.len(),
                            "[STORE] Positions saved"
                        );
                        break;
                    }
                    Err(e) if backoff.attempts() + 1 < retry_attempts => {
                        let delay = backoff.next_delay();
                        warn!(
                            error = %e,
                            attempt = backoff.attempts(),
                            retry_in_ms = delay.as_millis() as u64,
                            "[STORE] Save failed, retrying"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        if snapshots.has_changed().unwrap_or(false) {
                            pending = snapshots.borrow_and_update().clone();
                            backoff.reset();
                        }
                    }
                    Err(e) => {
                        error!(error = %e, attempts = retry_attempts, "[STORE] Save abandoned");
                        break;
                    }
                }
            }
        }

        let last = snapshots.borrow().clone();
        if let Err(e) = store.save(&last).await {
            error!(error = %e, "[STORE] Final flush failed");
        }
        info!("[STORE] Writer stopped");
    })
}
