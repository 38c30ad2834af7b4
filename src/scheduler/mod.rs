//! The decision loop: failure detection, timeout reclamation and
//! resource-aware assignment.
//!
//! A pass runs on a fixed tick and whenever a [`SchedulerHandle`] triggers
//! it. Passes never overlap; triggers that arrive while one is running
//! collapse into a single follow-up pass.

pub mod placement;

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{FleetError, Result};
use crate::registry::{JobRecord, JobStatus, Registry, ReleaseReason, WorkerRecord, WorkerStatus};

pub use placement::{best_fit, candidates, load_score, LoadWeights};

/// What one pass changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub offline_workers: Vec<String>,
    /// Jobs taken back that will be retried.
    pub reclaimed: Vec<Uuid>,
    /// Jobs that ran out of retries during the sweeps.
    pub failed: Vec<Uuid>,
    pub promoted: Vec<Uuid>,
    pub assigned: Vec<(Uuid, String)>,
    /// QUEUED jobs no worker could take this pass.
    pub unplaced: usize,
}

impl PassReport {
    pub fn changed_anything(&self) -> bool {
        !(self.offline_workers.is_empty()
            && self.reclaimed.is_empty()
            && self.failed.is_empty()
            && self.promoted.is_empty()
            && self.assigned.is_empty())
    }

    fn record_reclaimed(&mut self, job: &JobRecord) {
        if job.status == JobStatus::Failed {
            self.failed.push(job.job_id);
        } else {
            self.reclaimed.push(job.job_id);
        }
    }
}

/// Requests an extra pass.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    notify: Arc<Notify>,
}

impl SchedulerHandle {
    /// Ask for a pass as soon as the current one (if any) finishes.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

#[derive(Debug)]
pub struct Scheduler {
    registry: Arc<Registry>,
    config: SchedulerConfig,
    weights: LoadWeights,
    notify: Arc<Notify>,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>, config: SchedulerConfig) -> Self {
        let weights = LoadWeights::from(&config);
        Self {
            registry,
            config,
            weights,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            notify: self.notify.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run passes until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flush_ticker = tokio::time::interval(self.config.flush_interval());
        flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            tick_interval_ms = self.config.tick_interval_ms,
            heartbeat_timeout_ms = self.config.heartbeat_timeout_ms,
            "Scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {}
                _ = flush_ticker.tick() => {
                    self.flush();
                    continue;
                }
            }

            match self.run_pass() {
                Ok(report) if report.changed_anything() => tracing::info!(
                    offline = report.offline_workers.len(),
                    reclaimed = report.reclaimed.len(),
                    failed = report.failed.len(),
                    promoted = report.promoted.len(),
                    assigned = report.assigned.len(),
                    unplaced = report.unplaced,
                    "Scheduler pass"
                ),
                Ok(report) => tracing::debug!(unplaced = report.unplaced, "Scheduler pass"),
                Err(e) => tracing::error!(error = %e, "Scheduler pass failed"),
            }
        }
        self.flush();
        tracing::info!("Scheduler loop stopped");
    }

    fn flush(&self) {
        if let Err(e) = self.registry.flush() {
            tracing::error!(error = %e, "Failed to flush registry state");
        }
    }

    /// One full pass: heartbeat sweep, timeout sweep, retry promotion and
    /// assignment, in that order.
    pub fn run_pass(&self) -> Result<PassReport> {
        let mut report = PassReport::default();
        self.sweep_heartbeats(&mut report)?;
        self.sweep_timeouts(&mut report)?;
        report.promoted = self.registry.promote_due_retries()?;
        self.assign_queued(&mut report)?;
        Ok(report)
    }

    fn sweep_heartbeats(&self, report: &mut PassReport) -> Result<()> {
        let now = self.registry.now();
        let timeout = self.config.heartbeat_timeout();
        for worker in self.registry.workers()? {
            if worker.status == WorkerStatus::Offline || !worker.is_stale(now, timeout) {
                continue;
            }
            tracing::warn!(
                worker_id = %worker.worker_id,
                last_heartbeat_at = %worker.last_heartbeat_at,
                "Worker missed heartbeats"
            );
            for job in self.registry.mark_offline(&worker.worker_id)? {
                report.record_reclaimed(&job);
            }
            report.offline_workers.push(worker.worker_id);
        }
        Ok(())
    }

    fn sweep_timeouts(&self, report: &mut PassReport) -> Result<()> {
        let now = self.registry.now();
        let grace = self.config.timeout_grace();
        for job in self.registry.in_flight_jobs()? {
            let since = match job.status {
                JobStatus::Running => job.started_at,
                _ => job.assigned_at,
            };
            let Some(since) = since else { continue };
            // An unrepresentable deadline never expires.
            let Some(limit) = job.timeout().checked_add(&grace) else {
                continue;
            };
            if now - since <= limit {
                continue;
            }
            match self.registry.release(&job.job_id, ReleaseReason::Timeout) {
                Ok(job) => report.record_reclaimed(&job),
                // Finished between the listing and the release.
                Err(FleetError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn assign_queued(&self, report: &mut PassReport) -> Result<()> {
        let queued = self.registry.jobs_with_status(JobStatus::Queued)?;
        if queued.is_empty() {
            return Ok(());
        }
        let now = self.registry.now();
        let mut workers = self.registry.workers()?;

        for job in queued {
            match self.place(&job, &mut workers, now)? {
                Some(worker_id) => report.assigned.push((job.job_id, worker_id)),
                None => {
                    report.unplaced += 1;
                    tracing::debug!(
                        job_id = %job.job_id,
                        required_cpu = job.required_cpu,
                        required_ram_mb = job.required_ram_mb,
                        "No eligible worker, job stays QUEUED"
                    );
                }
            }
        }
        Ok(())
    }

    /// Try candidates in order until one reservation sticks.
    fn place(
        &self,
        job: &JobRecord,
        workers: &mut [WorkerRecord],
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<String>> {
        let order: Vec<String> = candidates(job, workers, now, self.weights)
            .into_iter()
            .map(|w| w.worker_id.clone())
            .collect();

        for worker_id in order {
            let outcome = self.registry.reserve(&job.job_id, &worker_id);
            // Keep the local view in step with the registry either way.
            if let Some(slot) = workers.iter_mut().find(|w| w.worker_id == worker_id) {
                *slot = self.registry.worker(&worker_id)?;
            }
            match outcome {
                Ok(_) => return Ok(Some(worker_id)),
                Err(FleetError::Conflict(reason)) => {
                    tracing::debug!(job_id = %job.job_id, worker_id = %worker_id, %reason, "Reservation lost, trying next worker");
                    // The job itself may have moved on (cancelled).
                    if self.registry.job(&job.job_id)?.status != JobStatus::Queued {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}
