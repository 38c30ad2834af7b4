//! Backing storage for worker and job records.
//!
//! The registry only talks to [`Store`]: keyed reads, full listings and an
//! atomic [`Batch`] commit. Whatever sits behind it must apply a batch
//! entirely or not at all.

mod file;
pub mod migrate;

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use uuid::Uuid;

use crate::error::Result;
use crate::registry::{JobRecord, WorkerRecord};

pub use file::FileStore;

/// Upserts applied together.
#[derive(Debug, Default, Clone)]
pub struct Batch {
    pub workers: Vec<WorkerRecord>,
    pub jobs: Vec<JobRecord>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker(mut self, worker: WorkerRecord) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn job(mut self, job: JobRecord) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty() && self.jobs.is_empty()
    }
}

pub trait Store: Send + Sync + std::fmt::Debug {
    fn worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>>;
    fn job(&self, job_id: &Uuid) -> Result<Option<JobRecord>>;
    fn workers(&self) -> Result<Vec<WorkerRecord>>;
    fn jobs(&self) -> Result<Vec<JobRecord>>;
    /// Apply every upsert in `batch`, or none of them.
    fn commit(&self, batch: Batch) -> Result<()>;

    /// Upsert a worker whose change is liveness or usage only.
    ///
    /// Durable stores may hold the change in memory until the next
    /// [`commit`](Store::commit) or [`flush`](Store::flush); losing it in a
    /// crash only makes the worker look older than it is.
    fn touch(&self, worker: WorkerRecord) -> Result<()> {
        self.commit(Batch::new().worker(worker))
    }

    /// Persist anything [`touch`](Store::touch) left pending.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// The full contents of a store.
#[derive(Debug, Default, Clone)]
pub(crate) struct Snapshot {
    pub workers: BTreeMap<String, WorkerRecord>,
    pub jobs: HashMap<Uuid, JobRecord>,
}

impl Snapshot {
    pub fn apply(&mut self, batch: Batch) {
        for worker in batch.workers {
            self.workers.insert(worker.worker_id.clone(), worker);
        }
        for job in batch.jobs {
            self.jobs.insert(job.job_id, job);
        }
    }

    fn from_records(workers: Vec<WorkerRecord>, jobs: Vec<JobRecord>) -> Self {
        Self {
            workers: workers
                .into_iter()
                .map(|w| (w.worker_id.clone(), w))
                .collect(),
            jobs: jobs.into_iter().map(|j| (j.job_id, j)).collect(),
        }
    }
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.workers.get(worker_id).cloned())
    }

    fn job(&self, job_id: &Uuid) -> Result<Option<JobRecord>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.jobs.get(job_id).cloned())
    }

    fn workers(&self) -> Result<Vec<WorkerRecord>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.workers.values().cloned().collect())
    }

    fn jobs(&self) -> Result<Vec<JobRecord>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.jobs.values().cloned().collect())
    }

    fn commit(&self, batch: Batch) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.apply(batch);
        Ok(())
    }
}
