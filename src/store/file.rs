use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tokio::runtime::{Handle, RuntimeFlavor};

use uuid::Uuid;

use super::migrate::{self, SnapshotFile, SCHEMA_VERSION};
use super::{Batch, Snapshot, Store};
use crate::error::{FleetError, Result};
use crate::registry::{JobRecord, WorkerRecord};

/// A store persisted as one JSON snapshot file.
///
/// Every commit rewrites the snapshot to a sibling temp file, fsyncs it and
/// renames it over the target, so a crash leaves either the previous or the
/// new snapshot on disk. The in-memory copy is only swapped once the write
/// has succeeded.
///
/// Heartbeat updates arrive through [`Store::touch`] and only mark the
/// snapshot dirty; they reach disk with the next commit or flush.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: RwLock<FileState>,
}

#[derive(Debug, Default)]
struct FileState {
    snapshot: Snapshot,
    dirty: bool,
}

impl FileStore {
    /// Open (or create) the snapshot at `path`, migrating older layouts.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let bytes = fs::read(&path)?;
            let raw: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
                FleetError::Store(format!("cannot parse {}: {}", path.display(), e))
            })?;
            let migrated = raw
                .get("schema_version")
                .and_then(|v| v.as_u64())
                .map_or(true, |v| v < SCHEMA_VERSION as u64);
            let file = migrate::upgrade(raw)?;
            tracing::info!(
                path = %path.display(),
                workers = file.workers.len(),
                jobs = file.jobs.len(),
                "Loaded state snapshot"
            );
            let snapshot = Snapshot::from_records(file.workers, file.jobs);
            if migrated {
                write_snapshot(&path, &snapshot)?;
            }
            snapshot
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            tracing::info!(path = %path.display(), "Starting with empty state snapshot");
            Snapshot::default()
        };

        Ok(Self {
            path,
            state: RwLock::new(FileState {
                snapshot,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether touched changes are waiting for a flush.
    pub fn is_dirty(&self) -> bool {
        self.state.read().unwrap_or_else(|e| e.into_inner()).dirty
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        let result = without_stalling_runtime(|| write_snapshot(&self.path, snapshot));
        if let Err(e) = &result {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to persist state snapshot");
        }
        result
    }
}

/// Run blocking file I/O without parking a multi-threaded runtime's worker.
fn without_stalling_runtime<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let mut workers: Vec<WorkerRecord> = snapshot.workers.values().cloned().collect();
    workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    let mut jobs: Vec<JobRecord> = snapshot.jobs.values().cloned().collect();
    jobs.sort_by_key(|j| (j.submitted_at, j.job_id));

    let file = SnapshotFile {
        schema_version: SCHEMA_VERSION,
        workers,
        jobs,
    };
    let bytes = serde_json::to_vec_pretty(&file)
        .map_err(|e| FleetError::Store(format!("cannot encode snapshot: {}", e)))?;

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    {
        let mut out = fs::File::create(&tmp)?;
        out.write_all(&bytes)?;
        out.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

impl Store for FileStore {
    fn worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.snapshot.workers.get(worker_id).cloned())
    }

    fn job(&self, job_id: &Uuid) -> Result<Option<JobRecord>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.snapshot.jobs.get(job_id).cloned())
    }

    fn workers(&self) -> Result<Vec<WorkerRecord>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.snapshot.workers.values().cloned().collect())
    }

    fn jobs(&self) -> Result<Vec<JobRecord>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.snapshot.jobs.values().cloned().collect())
    }

    fn commit(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mut next = state.snapshot.clone();
        next.apply(batch);
        self.persist(&next)?;
        state.snapshot = next;
        state.dirty = false;
        Ok(())
    }

    fn touch(&self, worker: WorkerRecord) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.snapshot.apply(Batch::new().worker(worker));
        state.dirty = true;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !state.dirty {
            return Ok(());
        }
        self.persist(&state.snapshot)?;
        state.dirty = false;
        Ok(())
    }
}
