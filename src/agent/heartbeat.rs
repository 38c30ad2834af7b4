use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::client::CoordinatorClient;
use crate::agent::metrics::HostMetrics;
use crate::error::FleetError;
use crate::registry::{HeartbeatReport, WorkerRegistration, WorkerStatus};
use crate::sandbox::SandboxRunner;

/// Executions currently in progress on this agent, each with the token
/// that cancels it.
#[derive(Debug, Default)]
pub struct RunningJobs {
    inner: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl RunningJobs {
    pub fn start(&self, job_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock().insert(job_id, token.clone());
        token
    }

    pub fn finish(&self, job_id: &Uuid) {
        self.lock().remove(job_id);
    }

    /// Returns false if the job is not running here.
    pub fn cancel(&self, job_id: &Uuid) -> bool {
        match self.lock().get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for token in self.lock().values() {
            token.cancel();
        }
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Periodic liveness report.
///
/// Each beat probes the sandbox (UNHEALTHY while it fails), cancels the
/// executions the coordinator revoked, and re-registers when the
/// coordinator has marked this worker OFFLINE or forgotten it.
pub struct HeartbeatLoop {
    interval: Duration,
    client: Arc<dyn CoordinatorClient>,
    sandbox: Arc<dyn SandboxRunner>,
    running: Arc<RunningJobs>,
    registration: WorkerRegistration,
    worker_id: String,
    metrics: HostMetrics,
}

impl HeartbeatLoop {
    pub fn new(
        interval: Duration,
        client: Arc<dyn CoordinatorClient>,
        sandbox: Arc<dyn SandboxRunner>,
        running: Arc<RunningJobs>,
        registration: WorkerRegistration,
        worker_id: String,
        configured_ram_mb: Option<u64>,
    ) -> Self {
        Self {
            interval,
            client,
            sandbox,
            running,
            registration,
            worker_id,
            metrics: HostMetrics::new(configured_ram_mb),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.beat().await,
            }
        }
        tracing::debug!(worker_id = %self.worker_id, "Heartbeat loop stopped");
    }

    async fn beat(&mut self) {
        let status = match self.sandbox.probe().await {
            Ok(()) => local_status(self.running.len()),
            Err(e) => {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "Sandbox probe failed");
                WorkerStatus::Unhealthy
            }
        };
        let host = self.metrics.sample();
        let report = HeartbeatReport {
            cpu_usage_percent: host.cpu_usage_percent,
            ram_free_mb: host.ram_free_mb,
            ram_total_mb: host.ram_total_mb,
            status,
            running_job_ids: self.running.ids(),
        };

        match self.client.heartbeat(&self.worker_id, &report).await {
            Ok(ack) => {
                for job_id in &ack.revoked_job_ids {
                    if self.running.cancel(job_id) {
                        tracing::info!(worker_id = %self.worker_id, job_id = %job_id, "Cancelling revoked job");
                    }
                }
                if ack.status == WorkerStatus::Offline {
                    tracing::warn!(worker_id = %self.worker_id, "Coordinator reports this worker OFFLINE");
                    self.reregister().await;
                }
            }
            Err(FleetError::UnknownWorker(_)) => {
                tracing::warn!(worker_id = %self.worker_id, "Coordinator does not know this worker");
                self.reregister().await;
            }
            Err(e) => {
                // The next tick is the retry.
                tracing::warn!(worker_id = %self.worker_id, error = %e, "Heartbeat failed");
            }
        }
    }

    async fn reregister(&self) {
        let mut registration = self.registration.clone();
        registration.worker_id = Some(self.worker_id.clone());
        match self.client.register(&registration).await {
            Ok(id) if id == self.worker_id => {
                tracing::info!(worker_id = %id, "Re-registered with coordinator");
            }
            Ok(id) => {
                tracing::error!(expected = %self.worker_id, assigned = %id, "Coordinator re-registered this agent under another id");
            }
            Err(e) => {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "Re-registration failed");
            }
        }
    }
}

/// IDLE or BUSY by local load; the coordinator recomputes it anyway.
fn local_status(running: usize) -> WorkerStatus {
    if running == 0 {
        WorkerStatus::Idle
    } else {
        WorkerStatus::Busy
    }
}
