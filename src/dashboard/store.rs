//! Flat-file persistence for dashboard state.
//!
//! Every document (`projects.json`, `proxy-config.json`, `ngrok-config.json`)
//! is owned by a [`JsonDocument`]: the in-memory value sits behind a single
//! async mutex, each mutation is applied to a working copy, persisted with a
//! temp-file-then-rename, and only then committed to memory.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::models::{ProjectRecord, ProjectStatus};
use crate::errors::{DashboardError, DashboardResult};

/// Read a JSON document. Missing → `T::default()`. Corrupt → the bad file is
/// copied to `<name>.corrupt` and `T::default()` is returned.
pub fn read_json_or_default<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read state file");
            return T::default();
        }
    };
    if content.trim().is_empty() {
        return T::default();
    }
    match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            let backup = corrupt_backup_path(path);
            tracing::warn!(
                path = %path.display(),
                backup = %backup.display(),
                error = %e,
                "state file is corrupt; starting empty"
            );
            if let Err(copy_err) = std::fs::copy(path, &backup) {
                tracing::warn!(error = %copy_err, "failed to back up corrupt state file");
            }
            T::default()
        }
    }
}

fn corrupt_backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".corrupt");
    path.with_file_name(name)
}

/// Write bytes to `target` through a temp file in the same directory and an atomic rename.
pub fn write_atomic(target: &Path, data: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    temp.write_all(data)
        .with_context(|| format!("Failed to write temp file for {}", target.display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("Failed to sync temp file for {}", target.display()))?;
    temp.persist(target)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to rename temp file to {}", target.display()))?;
    Ok(())
}

/// A JSON file with a single-writer in-memory copy.
pub struct JsonDocument<T> {
    path: PathBuf,
    value: Mutex<T>,
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send + 'static,
{
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let value = read_json_or_default(&path);
        Self {
            path,
            value: Mutex::new(value),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> T {
        self.value.lock().await.clone()
    }

    /// Apply `f` to a working copy, persist it, then commit. If `f` or the
    /// write fails the in-memory value is left untouched.
    pub async fn update<F, R>(&self, f: F) -> DashboardResult<R>
    where
        F: FnOnce(&mut T) -> DashboardResult<R>,
    {
        let mut guard = self.value.lock().await;
        let mut working = guard.clone();
        let result = f(&mut working)?;

        let bytes = serde_json::to_vec_pretty(&working)
            .context("Failed to serialize state")
            .map_err(DashboardError::Other)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .context("State write task panicked")
            .map_err(DashboardError::Other)??;

        *guard = working;
        Ok(result)
    }
}

/// Registry of project records backed by `projects.json`.
pub struct ProjectStore {
    doc: JsonDocument<Vec<ProjectRecord>>,
}

impl ProjectStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let doc = JsonDocument::open(path);
        Self { doc }
    }

    /// Read the records file directly.
    pub fn load(path: &Path) -> Vec<ProjectRecord> {
        read_json_or_default(path)
    }

    /// Write the records file directly.
    pub fn save(path: &Path, records: &[ProjectRecord]) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(records).context("Failed to serialize projects")?;
        write_atomic(path, &bytes)
    }

    pub fn path(&self) -> &Path {
        self.doc.path()
    }

    pub async fn list(&self) -> Vec<ProjectRecord> {
        self.doc.snapshot().await
    }

    pub async fn get(&self, name: &str) -> Option<ProjectRecord> {
        self.doc
            .snapshot()
            .await
            .into_iter()
            .find(|p| p.name == name)
    }

    pub async fn require(&self, name: &str) -> DashboardResult<ProjectRecord> {
        self.get(name)
            .await
            .ok_or_else(|| DashboardError::ProjectNotFound(name.to_string()))
    }

    /// Run `f` under the writer lock with access to every record.
    pub async fn update<F, R>(&self, f: F) -> DashboardResult<R>
    where
        F: FnOnce(&mut Vec<ProjectRecord>) -> DashboardResult<R>,
    {
        self.doc.update(f).await
    }

    pub async fn insert(&self, record: ProjectRecord) -> DashboardResult<ProjectRecord> {
        self.update(move |records| {
            if records.iter().any(|p| p.name == record.name) {
                return Err(DashboardError::Conflict(format!(
                    "Project '{}' already exists",
                    record.name
                )));
            }
            records.push(record.clone());
            Ok(record)
        })
        .await
    }

    pub async fn update_status(
        &self,
        name: &str,
        status: ProjectStatus,
        error: Option<String>,
    ) -> DashboardResult<ProjectRecord> {
        let name = name.to_string();
        self.update(move |records| {
            let record = records
                .iter_mut()
                .find(|p| p.name == name)
                .ok_or_else(|| DashboardError::ProjectNotFound(name.clone()))?;
            record.status = status;
            record.error = error;
            record.last_activity = Utc::now();
            Ok(record.clone())
        })
        .await
    }

    /// Set status and error only if the record still holds `expected`.
    /// Returns `None` when the record moved on since it was read.
    pub async fn update_status_if(
        &self,
        expected: &ProjectRecord,
        status: ProjectStatus,
        error: Option<String>,
    ) -> DashboardResult<Option<ProjectRecord>> {
        let name = expected.name.clone();
        let (expected_status, expected_error) = (expected.status, expected.error.clone());
        self.update(move |records| {
            let record = records
                .iter_mut()
                .find(|p| p.name == name)
                .ok_or_else(|| DashboardError::ProjectNotFound(name.clone()))?;
            if record.status != expected_status || record.error != expected_error {
                return Ok(None);
            }
            record.status = status;
            record.error = error;
            record.last_activity = Utc::now();
            Ok(Some(record.clone()))
        })
        .await
    }

    /// Mark records left in `creating` or `stopping` by a previous process
    /// as `error`. Call once at startup, before any operation is launched.
    pub async fn recover_interrupted(&self) -> DashboardResult<Vec<ProjectRecord>> {
        let stale = self
            .list()
            .await
            .iter()
            .any(|p| p.status.is_transitional());
        if !stale {
            return Ok(Vec::new());
        }
        self.update(|records| {
            let mut recovered = Vec::new();
            for record in records.iter_mut().filter(|p| p.status.is_transitional()) {
                record.error = Some(format!(
                    "Interrupted while {}; the server stopped before it finished",
                    record.status
                ));
                record.status = ProjectStatus::Error;
                record.last_activity = Utc::now();
                recovered.push(record.clone());
            }
            Ok(recovered)
        })
        .await
    }

    pub async fn touch(&self, name: &str) -> DashboardResult<()> {
        let name = name.to_string();
        self.update(move |records| {
            let record = records
                .iter_mut()
                .find(|p| p.name == name)
                .ok_or_else(|| DashboardError::ProjectNotFound(name.clone()))?;
            record.last_activity = Utc::now();
            Ok(())
        })
        .await
    }

    /// Remove exactly the record named `name`.
    pub async fn remove(&self, name: &str) -> DashboardResult<ProjectRecord> {
        let name = name.to_string();
        self.update(move |records| {
            let index = records
                .iter()
                .position(|p| p.name == name)
                .ok_or_else(|| DashboardError::ProjectNotFound(name.clone()))?;
            Ok(records.remove(index))
        })
        .await
    }
}

/// Exclusive advisory lock on a data directory, held for the life of the server.
pub struct DataDirLock {
    _file: File,
    path: PathBuf,
}

impl DataDirLock {
    pub fn acquire(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;
        let path = data_dir.join(".lock");
        let file = File::create(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;
        file.try_lock_exclusive().with_context(|| {
            format!(
                "Another devdock instance is using {}",
                data_dir.display()
            )
        })?;
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
