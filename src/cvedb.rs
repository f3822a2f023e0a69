//! Local vulnerability database.
//!
//! The loader owns the current [`Snapshot`]. A reload parses the database and
//! swaps the snapshot while holding the update lock, so readers only ever see
//! a complete snapshot: version, create time and entries always belong
//! together.

use crate::constants::{CVE_DB_FILE_NAME, DB_RETRY_INTERVAL_SECS};
use crate::error::{Result, RetryPolicy, ScanError};
use crate::logging::ScanEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Opaque per-vulnerability record; its layout belongs to the matching engine.
pub type VulnerabilityRecord = serde_json::Value;

/// Immutable view of one loaded database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "CreateTime")]
    pub create_time: String,
    #[serde(rename = "Vulnerabilities", default)]
    pub vulnerabilities: HashMap<String, VulnerabilityRecord>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.vulnerabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vulnerabilities.is_empty()
    }

    /// Writes the snapshot as pretty JSON `{Version, CreateTime, Vulnerabilities}`.
    pub fn export_json(&self, output: &Path) -> Result<()> {
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(output, json)?;
        tracing::info!(output = %output.display(), entries = self.len(), "Database exported");
        Ok(())
    }
}

/// Decodes a database file into a snapshot.
pub trait DatabaseSource: Send + Sync {
    fn file_name(&self) -> &str {
        CVE_DB_FILE_NAME
    }

    fn read(&self, path: &Path) -> Result<Snapshot>;
}

/// Reads a plain JSON database in the export layout.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFileSource;

impl DatabaseSource for JsonFileSource {
    fn read(&self, path: &Path) -> Result<Snapshot> {
        let data = fs::read(path).map_err(|e| ScanError::Database {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let snapshot: Snapshot = serde_json::from_slice(&data).map_err(|e| ScanError::Database {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if snapshot.version.is_empty() {
            return Err(ScanError::Database {
                path: path.display().to_string(),
                reason: "database carries no version".to_string(),
            });
        }
        Ok(snapshot)
    }
}

/// Source plus the swap target, shared with blocking reload jobs.
struct Store {
    source: Box<dyn DatabaseSource>,
    update: Mutex<()>,
    current: Mutex<Option<Arc<Snapshot>>>,
}

impl Store {
    /// Parses under the update lock; `current` is only locked for the swap.
    fn reload(&self, path: &Path) -> Result<Arc<Snapshot>> {
        let _update = self.update.lock();
        let snapshot = Arc::new(self.source.read(path)?);
        *self.current.lock() = Some(snapshot.clone());
        Ok(snapshot)
    }
}

pub struct DatabaseLoader {
    store: Arc<Store>,
    retry_interval: Duration,
}

impl DatabaseLoader {
    pub fn new(source: Box<dyn DatabaseSource>) -> Self {
        Self {
            store: Arc::new(Store {
                source,
                update: Mutex::new(()),
                current: Mutex::new(None),
            }),
            retry_interval: Duration::from_secs(DB_RETRY_INTERVAL_SECS),
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// The most recently loaded snapshot, if any.
    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.store.current.lock().clone()
    }

    pub fn version(&self) -> Option<String> {
        self.store
            .current
            .lock()
            .as_ref()
            .map(|s| s.version.clone())
    }

    pub fn database_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.store.source.file_name())
    }

    fn existing_path(&self, dir: &Path) -> Result<PathBuf> {
        let path = self.database_path(dir);
        if !path.is_file() {
            return Err(ScanError::Database {
                path: path.display().to_string(),
                reason: "database file not found".to_string(),
            });
        }
        Ok(path)
    }

    /// One load attempt on the calling thread.
    pub fn reload(&self, dir: &Path) -> Result<Arc<Snapshot>> {
        let path = self.existing_path(dir)?;
        let snapshot = self.store.reload(&path)?;
        log_loaded(&snapshot);
        Ok(snapshot)
    }

    /// One load attempt on the blocking pool, so the runtime keeps serving
    /// readers while the file is parsed.
    async fn reload_blocking(&self, dir: &Path) -> Result<Arc<Snapshot>> {
        let path = self.existing_path(dir)?;
        let store = self.store.clone();
        let job_path = path.clone();
        let snapshot = tokio::task::spawn_blocking(move || store.reload(&job_path))
            .await
            .map_err(|e| ScanError::Database {
                path: path.display().to_string(),
                reason: e.to_string(),
            })??;
        log_loaded(&snapshot);
        Ok(snapshot)
    }

    /// Loads the database from `dir`, retrying every few seconds.
    ///
    /// `max_attempts == 0` retries until a load succeeds. With a positive
    /// bound, `None` means no database is available. When `output` is given
    /// the loaded snapshot is also exported there as JSON.
    pub async fn load(
        &self,
        dir: &Path,
        max_attempts: u32,
        output: Option<&Path>,
    ) -> Option<Arc<Snapshot>> {
        let policy = RetryPolicy::bounded(max_attempts, self.retry_interval);
        let mut attempts = 0u32;

        loop {
            match self.reload_blocking(dir).await {
                Ok(snapshot) => {
                    if let Some(output) = output {
                        if let Err(e) = snapshot.export_json(output) {
                            tracing::error!(error = %e, "Failed to export database");
                        }
                    }
                    return Some(snapshot);
                }
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(attempt = attempts, error = %e, "Database load failed");
                }
            }

            if !policy.should_retry(attempts) {
                tracing::error!(attempts, dir = %dir.display(), "Giving up on database load");
                return None;
            }
            tokio::time::sleep(policy.interval).await;
        }
    }
}

fn log_loaded(snapshot: &Snapshot) {
    tracing::info!(
        "{}",
        ScanEvent::DatabaseLoaded {
            version: snapshot.version.clone(),
            entries: snapshot.len(),
        }
    );
}

impl Default for DatabaseLoader {
    fn default() -> Self {
        Self::new(Box::new(JsonFileSource))
    }
}
