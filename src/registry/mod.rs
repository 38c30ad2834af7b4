//! Worker and job records and every transition between their states.
//!
//! [`Registry`] is the only writer of both record kinds. Each mutating
//! operation runs under one writer lock as a read-modify-write against the
//! [`Store`] and commits all records it touched in a single [`Batch`], so
//! concurrent heartbeats, results, submissions and scheduler passes can
//! never interleave halfway through a transition.

mod invariants;
mod job;
mod worker;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{JobDefaults, RetryPolicy};
use crate::error::{FleetError, Result};
use crate::store::{Batch, Store};

pub use invariants::verify;
pub use job::{ExecutionReport, JobRecord, JobSpec, JobStatus, MAX_TIMEOUT_MS};
pub use worker::{HeartbeatReport, WorkerRecord, WorkerRegistration, WorkerStatus};

/// Answer to a heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatAck {
    pub status: WorkerStatus,
    /// Jobs the agent reported running that it no longer owns.
    pub revoked_job_ids: Vec<Uuid>,
}

/// Why an in-flight job is being taken back from its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The job overran its timeout. The worker is put in cooldown.
    Timeout,
    /// The worker stopped answering.
    WorkerLost,
}

pub struct Registry {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    job_defaults: JobDefaults,
    writer: Mutex<()>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("store", &self.store)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Open a registry over `store`, repairing whatever a previous process
    /// left inconsistent.
    pub fn open(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        job_defaults: JobDefaults,
    ) -> Result<Self> {
        let registry = Self {
            store,
            clock,
            retry,
            job_defaults,
            writer: Mutex::new(()),
        };
        registry.repair()?;
        Ok(registry)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Write out heartbeat state the store is still holding in memory.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.lock();
        self.store.flush()
    }

    /// Rebuild reservations from the in-flight jobs and requeue jobs whose
    /// owner is gone.
    fn repair(&self) -> Result<()> {
        let _guard = self.lock();
        let now = self.now();

        let original: BTreeMap<String, WorkerRecord> = self
            .store
            .workers()?
            .into_iter()
            .map(|w| (w.worker_id.clone(), w))
            .collect();
        let mut workers = original.clone();
        for w in workers.values_mut() {
            w.reserved_cpu = 0;
            w.reserved_ram_mb = 0;
            w.current_job_ids.clear();
        }

        let mut jobs = self.store.jobs()?;
        jobs.sort_by_key(|j| (j.assigned_at, j.job_id));
        let mut batch = Batch::new();
        for mut job in jobs {
            let before = job.clone();
            if job.status == JobStatus::Submitted {
                job.enqueue(now);
            } else if job.status.is_in_flight() {
                let owner = job
                    .assigned_worker_id
                    .as_ref()
                    .and_then(|id| workers.get_mut(id));
                match owner {
                    Some(w) => {
                        w.reserved_cpu += job.required_cpu;
                        w.reserved_ram_mb += job.required_ram_mb;
                        w.current_job_ids.insert(job.job_id);
                    }
                    None => {
                        tracing::error!(
                            job_id = %job.job_id,
                            worker_id = ?job.assigned_worker_id,
                            "In-flight job owned by unknown worker, requeueing"
                        );
                        job.enqueue(now);
                    }
                }
            } else if job.assigned_worker_id.is_some() {
                job.detach();
            }
            if job != before {
                batch = batch.job(job);
            }
        }

        for (id, mut w) in workers {
            w.max_parallel_jobs = w.max_parallel_jobs.max(w.current_job_ids.len() as u32);
            w.cpu_count = w.cpu_count.max(w.reserved_cpu);
            w.ram_total_mb = w.ram_total_mb.max(w.reserved_ram_mb);
            w.refresh_status();
            if original.get(&id) != Some(&w) {
                tracing::warn!(worker_id = %id, "Repaired worker reservations on load");
                batch = batch.worker(w);
            }
        }

        if !batch.is_empty() {
            tracing::info!(
                workers = batch.workers.len(),
                jobs = batch.jobs.len(),
                "Registry repaired on load"
            );
            self.store.commit(batch)?;
        }
        Ok(())
    }

    fn load_worker(&self, worker_id: &str) -> Result<WorkerRecord> {
        self.store
            .worker(worker_id)?
            .ok_or_else(|| FleetError::UnknownWorker(worker_id.to_string()))
    }

    fn load_job(&self, job_id: &Uuid) -> Result<JobRecord> {
        self.store
            .job(job_id)?
            .ok_or(FleetError::UnknownJob(*job_id))
    }

    // ========================================================================
    // Workers
    // ========================================================================

    /// Register a worker, or refresh a known one. Re-registering never
    /// touches reservations; an OFFLINE worker comes back online.
    pub fn register_worker(&self, reg: WorkerRegistration) -> Result<WorkerRecord> {
        if reg.cpu_count == 0 {
            return Err(FleetError::InvalidArgument(
                "cpu_count must be at least 1".to_string(),
            ));
        }
        let _guard = self.lock();
        let now = self.now();
        let requested_id = reg.worker_id.clone().filter(|id| !id.trim().is_empty());

        if let Some(id) = &requested_id {
            if let Some(mut w) = self.store.worker(id)? {
                w.hostname = reg.hostname.clone();
                w.os = reg.os.clone();
                w.set_capacity(reg.cpu_count, reg.ram_total_mb);
                w.max_parallel_jobs = reg
                    .max_parallel_jobs
                    .max(w.current_job_ids.len() as u32)
                    .max(1);
                w.last_heartbeat_at = now;
                let revived = w.status == WorkerStatus::Offline;
                if revived {
                    w.revive();
                }
                self.store.commit(Batch::new().worker(w.clone()))?;
                tracing::info!(
                    worker_id = %w.worker_id,
                    revived,
                    reserved_cpu = w.reserved_cpu,
                    "Worker re-registered"
                );
                return Ok(w);
            }
        }

        let id = requested_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let w = WorkerRecord::new(id, &reg, now);
        self.store.commit(Batch::new().worker(w.clone()))?;
        tracing::info!(
            worker_id = %w.worker_id,
            hostname = %w.hostname,
            cpu_count = w.cpu_count,
            ram_total_mb = w.ram_total_mb,
            max_parallel_jobs = w.max_parallel_jobs,
            "Worker registered"
        );
        Ok(w)
    }

    pub fn record_heartbeat(&self, worker_id: &str, report: HeartbeatReport) -> Result<HeartbeatAck> {
        let _guard = self.lock();
        let now = self.now();
        let mut w = self.load_worker(worker_id)?;

        w.last_heartbeat_at = now;
        w.cpu_usage_percent = report.cpu_usage_percent.clamp(0.0, 100.0);
        w.ram_free_mb = report.ram_free_mb;
        if report.ram_total_mb > 0 {
            w.set_capacity(w.cpu_count, report.ram_total_mb);
        }

        // OFFLINE sticks until the agent registers again.
        if w.status != WorkerStatus::Offline {
            let previous = w.status;
            if report.status == WorkerStatus::Unhealthy {
                w.status = WorkerStatus::Unhealthy;
            } else {
                w.revive();
            }
            if previous != w.status
                && (previous == WorkerStatus::Unhealthy || w.status == WorkerStatus::Unhealthy)
            {
                tracing::warn!(worker_id, from = %previous, to = %w.status, "Worker health changed");
            }
        }

        let revoked_job_ids: Vec<Uuid> = report
            .running_job_ids
            .iter()
            .filter(|id| !w.current_job_ids.contains(id))
            .copied()
            .collect();
        if !revoked_job_ids.is_empty() {
            tracing::info!(worker_id, revoked = revoked_job_ids.len(), "Revoking stale executions");
        }

        let status = w.status;
        self.store.touch(w)?;
        tracing::debug!(worker_id, status = %status, "Heartbeat recorded");
        Ok(HeartbeatAck {
            status,
            revoked_job_ids,
        })
    }

    /// Graceful exit of a worker. Its in-flight jobs are reclaimed.
    pub fn deregister_worker(&self, worker_id: &str) -> Result<Vec<JobRecord>> {
        self.retire_worker(worker_id, format!("Worker {} deregistered", worker_id))
    }

    /// Heartbeat loss: OFFLINE, reservations zeroed, jobs reclaimed.
    pub fn mark_offline(&self, worker_id: &str) -> Result<Vec<JobRecord>> {
        let message = FleetError::AgentUnreachable {
            worker_id: worker_id.to_string(),
        }
        .to_string();
        self.retire_worker(worker_id, message)
    }

    fn retire_worker(&self, worker_id: &str, message: String) -> Result<Vec<JobRecord>> {
        let _guard = self.lock();
        let now = self.now();
        let mut w = self.load_worker(worker_id)?;
        let retry_at = now + self.retry.retry_delay();

        let mut batch = Batch::new();
        let mut reclaimed = Vec::new();
        for job_id in std::mem::take(&mut w.current_job_ids) {
            match self.store.job(&job_id)? {
                Some(mut job) if job.is_owned_by(worker_id) => {
                    job.detach();
                    job.settle_failure(message.clone(), now, retry_at);
                    tracing::warn!(
                        job_id = %job.job_id,
                        worker_id,
                        attempts = job.attempts,
                        status = %job.status,
                        "Job reclaimed from departed worker"
                    );
                    reclaimed.push(job.clone());
                    batch = batch.job(job);
                }
                _ => tracing::error!(worker_id, job_id = %job_id, "Dropping stale job reference"),
            }
        }
        w.reserved_cpu = 0;
        w.reserved_ram_mb = 0;
        w.status = WorkerStatus::Offline;
        self.store.commit(batch.worker(w))?;
        tracing::info!(worker_id, reclaimed = reclaimed.len(), "Worker marked OFFLINE");
        Ok(reclaimed)
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Validate and enqueue a job (SUBMITTED then QUEUED, `attempts = 0`).
    pub fn submit_job(&self, spec: JobSpec) -> Result<JobRecord> {
        let now = self.now();
        let mut job = JobRecord::new(spec, &self.job_defaults, now)?;
        job.enqueue(now);
        let _guard = self.lock();
        self.store.commit(Batch::new().job(job.clone()))?;
        tracing::info!(
            job_id = %job.job_id,
            required_cpu = job.required_cpu,
            required_ram_mb = job.required_ram_mb,
            timeout_ms = job.timeout_ms,
            "Job submitted"
        );
        Ok(job)
    }

    /// Atomically check headroom on `worker_id`, reserve it and move the job
    /// to ASSIGNED. Fails with `Conflict` if the job is no longer QUEUED or
    /// the worker can no longer take it.
    pub fn reserve(&self, job_id: &Uuid, worker_id: &str) -> Result<JobRecord> {
        let _guard = self.lock();
        let now = self.now();
        let mut job = self.load_job(job_id)?;
        if job.status != JobStatus::Queued {
            return Err(FleetError::Conflict(format!(
                "job {} is {}, not QUEUED",
                job_id, job.status
            )));
        }
        let mut w = self.load_worker(worker_id)?;
        if !w.accepts_work(now) {
            return Err(FleetError::Conflict(format!(
                "worker {} is {} and not accepting work",
                worker_id, w.status
            )));
        }
        w.reserve(job.job_id, job.required_cpu, job.required_ram_mb)?;

        job.status = JobStatus::Assigned;
        job.assigned_worker_id = Some(worker_id.to_string());
        job.assigned_at = Some(now);
        job.started_at = None;
        self.store.commit(Batch::new().worker(w).job(job.clone()))?;
        tracing::info!(job_id = %job_id, worker_id, attempt = job.current_attempt(), "Job assigned");
        Ok(job)
    }

    /// Hand the oldest job ASSIGNED to `worker_id` over to it, marking it
    /// RUNNING. Never assigns anything new.
    pub fn poll_for_job(&self, worker_id: &str) -> Result<Option<JobRecord>> {
        let _guard = self.lock();
        let w = self.load_worker(worker_id)?;

        let mut next: Option<JobRecord> = None;
        for job_id in &w.current_job_ids {
            if let Some(job) = self.store.job(job_id)? {
                if job.status == JobStatus::Assigned && job.is_owned_by(worker_id) {
                    let older = next
                        .as_ref()
                        .map_or(true, |n| (job.assigned_at, job.job_id) < (n.assigned_at, n.job_id));
                    if older {
                        next = Some(job);
                    }
                }
            }
        }

        match next {
            Some(job) => self.mark_running_locked(job).map(Some),
            None => Ok(None),
        }
    }

    /// ASSIGNED to RUNNING.
    pub fn mark_running(&self, job_id: &Uuid) -> Result<JobRecord> {
        let _guard = self.lock();
        let job = self.load_job(job_id)?;
        self.mark_running_locked(job)
    }

    fn mark_running_locked(&self, mut job: JobRecord) -> Result<JobRecord> {
        match job.status {
            JobStatus::Running => return Ok(job),
            JobStatus::Assigned => {}
            other => {
                return Err(FleetError::InvalidState(format!(
                    "job {} is {}, not ASSIGNED",
                    job.job_id, other
                )))
            }
        }
        job.status = JobStatus::Running;
        job.started_at = Some(self.now());
        self.store.commit(Batch::new().job(job.clone()))?;
        tracing::info!(
            job_id = %job.job_id,
            worker_id = ?job.assigned_worker_id,
            attempt = job.current_attempt(),
            "Job running"
        );
        Ok(job)
    }

    /// Result reported by an agent. Only the owning worker may report, and
    /// only while the job is ASSIGNED or RUNNING.
    pub fn submit_result(
        &self,
        job_id: &Uuid,
        worker_id: &str,
        report: ExecutionReport,
    ) -> Result<JobRecord> {
        let _guard = self.lock();
        let job = self.load_job(job_id)?;
        if !job.is_owned_by(worker_id) {
            return Err(FleetError::Conflict(format!(
                "job {} is {} and not owned by worker {}",
                job_id, job.status, worker_id
            )));
        }
        let success = report.succeeded();
        self.settle(job, report, success)
    }

    /// Record a successful run and release its reservation.
    pub fn complete(&self, job_id: &Uuid, report: ExecutionReport) -> Result<JobRecord> {
        let _guard = self.lock();
        let job = self.in_flight_job(job_id)?;
        self.settle(job, report, true)
    }

    /// Record a failed run: release, cooldown the worker, retry or give up.
    pub fn fail(&self, job_id: &Uuid, report: ExecutionReport) -> Result<JobRecord> {
        let _guard = self.lock();
        let job = self.in_flight_job(job_id)?;
        self.settle(job, report, false)
    }

    fn in_flight_job(&self, job_id: &Uuid) -> Result<JobRecord> {
        let job = self.load_job(job_id)?;
        if !job.status.is_in_flight() {
            return Err(FleetError::Conflict(format!(
                "job {} is {}, not in flight",
                job_id, job.status
            )));
        }
        Ok(job)
    }

    fn settle(&self, mut job: JobRecord, report: ExecutionReport, success: bool) -> Result<JobRecord> {
        let now = self.now();
        let worker_id = job.detach();
        job.record_output(&report);
        if success {
            job.status = JobStatus::Completed;
            job.completed_at = Some(now);
            job.error_message = None;
            job.retry_at = None;
        } else {
            let message = report.failure_message(job.timeout_ms);
            job.settle_failure(message, now, now + self.retry.retry_delay());
        }

        let mut batch = Batch::new();
        if let Some(worker_id) = &worker_id {
            if let Some(mut w) = self.store.worker(worker_id)? {
                w.release(&job.job_id, job.required_cpu, job.required_ram_mb);
                if !success {
                    self.apply_cooldown(&mut w, now);
                }
                batch = batch.worker(w);
            }
        }
        self.store.commit(batch.job(job.clone()))?;

        if success {
            tracing::info!(
                job_id = %job.job_id,
                worker_id = ?worker_id,
                elapsed_ms = report.elapsed_ms,
                "Job completed"
            );
        } else {
            tracing::warn!(
                job_id = %job.job_id,
                worker_id = ?worker_id,
                exit_code = report.exit_code,
                timed_out = report.timed_out,
                attempts = job.attempts,
                status = %job.status,
                error = ?job.error_message,
                "Job attempt failed"
            );
        }
        Ok(job)
    }

    fn apply_cooldown(&self, w: &mut WorkerRecord, now: DateTime<Utc>) {
        if w.status == WorkerStatus::Offline {
            return;
        }
        let until = now + self.retry.agent_cooldown();
        w.cooldown_until = Some(until);
        tracing::info!(worker_id = %w.worker_id, cooldown_until = %until, "Worker in cooldown");
    }

    /// Take an in-flight job back from its worker. Counts as a failed
    /// attempt.
    pub fn release(&self, job_id: &Uuid, reason: ReleaseReason) -> Result<JobRecord> {
        let _guard = self.lock();
        let now = self.now();
        let mut job = self.in_flight_job(job_id)?;

        let worker_id = job.detach();
        let message = match reason {
            ReleaseReason::Timeout => {
                job.timed_out = true;
                FleetError::ExecutionTimeout {
                    timeout_ms: job.timeout_ms,
                }
                .to_string()
            }
            ReleaseReason::WorkerLost => FleetError::AgentUnreachable {
                worker_id: worker_id.clone().unwrap_or_default(),
            }
            .to_string(),
        };
        job.settle_failure(message, now, now + self.retry.retry_delay());

        let mut batch = Batch::new();
        if let Some(worker_id) = &worker_id {
            if let Some(mut w) = self.store.worker(worker_id)? {
                w.release(&job.job_id, job.required_cpu, job.required_ram_mb);
                if reason == ReleaseReason::Timeout {
                    self.apply_cooldown(&mut w, now);
                }
                batch = batch.worker(w);
            }
        }
        self.store.commit(batch.job(job.clone()))?;
        tracing::warn!(
            job_id = %job_id,
            worker_id = ?worker_id,
            reason = ?reason,
            attempts = job.attempts,
            status = %job.status,
            "Job reclaimed"
        );
        Ok(job)
    }

    /// Move retry-pending jobs whose `retry_at` has passed back to QUEUED.
    pub fn promote_due_retries(&self) -> Result<Vec<Uuid>> {
        let _guard = self.lock();
        let now = self.now();
        let mut batch = Batch::new();
        let mut promoted = Vec::new();
        for mut job in self.store.jobs()? {
            if job.status == JobStatus::TimedOutRetrying && job.retry_at.map_or(true, |at| at <= now) {
                job.enqueue(now);
                promoted.push(job.job_id);
                batch = batch.job(job);
            }
        }
        self.store.commit(batch)?;
        for job_id in &promoted {
            tracing::debug!(job_id = %job_id, "Retry promoted to QUEUED");
        }
        Ok(promoted)
    }

    /// Cancel any non-terminal job, releasing its reservation at once.
    pub fn cancel_job(&self, job_id: &Uuid) -> Result<JobRecord> {
        let _guard = self.lock();
        let now = self.now();
        let mut job = self.load_job(job_id)?;
        if job.status.is_terminal() {
            return Err(FleetError::InvalidState(format!(
                "job {} is already {}",
                job_id, job.status
            )));
        }

        let worker_id = job.detach();
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(now);
        job.retry_at = None;
        job.error_message = Some("Cancelled by request".to_string());

        let mut batch = Batch::new();
        if let Some(worker_id) = &worker_id {
            if let Some(mut w) = self.store.worker(worker_id)? {
                w.release(&job.job_id, job.required_cpu, job.required_ram_mb);
                batch = batch.worker(w);
            }
        }
        self.store.commit(batch.job(job.clone()))?;
        tracing::info!(job_id = %job_id, worker_id = ?worker_id, "Job cancelled");
        Ok(job)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn job(&self, job_id: &Uuid) -> Result<JobRecord> {
        self.load_job(job_id)
    }

    pub fn worker(&self, worker_id: &str) -> Result<WorkerRecord> {
        self.load_worker(worker_id)
    }

    /// All jobs, oldest submission first.
    pub fn jobs(&self) -> Result<Vec<JobRecord>> {
        let mut jobs = self.store.jobs()?;
        jobs.sort_by_key(|j| (j.submitted_at, j.job_id));
        Ok(jobs)
    }

    /// All workers, earliest registration first.
    pub fn workers(&self) -> Result<Vec<WorkerRecord>> {
        let mut workers = self.store.workers()?;
        workers.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        Ok(workers)
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
        Ok(self
            .jobs()?
            .into_iter()
            .filter(|j| j.status == status)
            .collect())
    }

    /// ASSIGNED and RUNNING jobs.
    pub fn in_flight_jobs(&self) -> Result<Vec<JobRecord>> {
        Ok(self
            .jobs()?
            .into_iter()
            .filter(|j| j.status.is_in_flight())
            .collect())
    }

    /// Current invariant violations, empty when the registry is consistent.
    pub fn check_invariants(&self) -> Result<Vec<String>> {
        let _guard = self.lock();
        Ok(verify(&self.store.workers()?, &self.store.jobs()?))
    }
}
