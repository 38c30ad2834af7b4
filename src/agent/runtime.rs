use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::agent::artifact::ArtifactFetcher;
use crate::agent::backoff::Backoff;
use crate::agent::client::{CoordinatorClient, GrpcCoordinatorClient};
use crate::agent::execute::JobRunner;
use crate::agent::heartbeat::{HeartbeatLoop, RunningJobs};
use crate::agent::metrics::{self, HostMetrics};
use crate::config::AgentConfig;
use crate::error::{FleetError, Result};
use crate::registry::WorkerRegistration;
use crate::sandbox::{self, SandboxRunner};

const WORKER_ID_FILE: &str = "worker_id";
const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const ARTIFACT_TIMEOUT: Duration = Duration::from_secs(300);
/// Time left for reporting after in-flight jobs are killed at shutdown.
const REPORT_GRACE: Duration = Duration::from_secs(10);

/// A worker agent: registers, heartbeats, polls for assignments while it
/// has a free slot, and runs them in the sandbox.
#[derive(Debug)]
pub struct AgentRuntime {
    config: AgentConfig,
    client: Arc<dyn CoordinatorClient>,
    sandbox: Arc<dyn SandboxRunner>,
    fetcher: ArtifactFetcher,
    backoff: Backoff,
    running: Arc<RunningJobs>,
}

impl AgentRuntime {
    pub fn new(
        config: AgentConfig,
        client: Arc<dyn CoordinatorClient>,
        sandbox: Arc<dyn SandboxRunner>,
    ) -> Result<Self> {
        let fetcher = ArtifactFetcher::new(ARTIFACT_TIMEOUT, config.artifacts.clone())
            .map_err(|e| FleetError::Internal(format!("failed to build HTTP client: {e}")))?;
        let backoff = Backoff::from_millis(config.backoff_base_ms, config.backoff_max_ms);
        Ok(Self {
            config,
            client,
            sandbox,
            fetcher,
            backoff,
            running: Arc::new(RunningJobs::default()),
        })
    }

    /// Runtime talking gRPC to `config.coordinator_addr` with the
    /// configured sandbox backend.
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        let client = Arc::new(GrpcCoordinatorClient::new(
            &config.coordinator_addr,
            RPC_TIMEOUT,
        )?);
        let sandbox = sandbox::from_config(&config.sandbox);
        Self::new(config, client, sandbox)
    }

    /// Run until `shutdown` fires, then drain and deregister.
    ///
    /// Fails only when registration is rejected or runs out of attempts.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let registration = self.registration().await?;
        let Some(worker_id) = self.register(&registration, &shutdown).await? else {
            tracing::info!("Shutdown requested before registration completed");
            return Ok(());
        };
        save_worker_id(&self.config.state_dir, &worker_id).await;
        if let Err(e) = tokio::fs::create_dir_all(&self.config.work_dir).await {
            tracing::warn!(path = %self.config.work_dir.display(), error = %e, "Failed to create work directory");
        }

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(
            HeartbeatLoop::new(
                self.config.heartbeat_interval(),
                self.client.clone(),
                self.sandbox.clone(),
                self.running.clone(),
                registration,
                worker_id.clone(),
                self.config.ram_total_mb,
            )
            .run(heartbeat_stop.clone()),
        );

        let runner = Arc::new(JobRunner {
            worker_id: worker_id.clone(),
            client: self.client.clone(),
            sandbox: self.sandbox.clone(),
            fetcher: self.fetcher.clone(),
            work_dir: self.config.work_dir.clone(),
            backoff: self.backoff,
        });
        let abandon = CancellationToken::new();
        let mut tasks = self.poll_loop(&worker_id, runner, &abandon, &shutdown).await;

        self.drain(&mut tasks, &abandon).await;
        heartbeat_stop.cancel();
        if let Err(e) = heartbeat.await {
            tracing::error!(error = %e, "Heartbeat task panicked");
        }

        match self.client.deregister(&worker_id).await {
            Ok(reclaimed) => tracing::info!(worker_id = %worker_id, reclaimed, "Deregistered"),
            Err(e) => tracing::warn!(worker_id = %worker_id, error = %e, "Failed to deregister"),
        }
        Ok(())
    }

    /// Refuses to describe a host whose memory is unknown: the coordinator
    /// would never place a job on it.
    async fn registration(&self) -> Result<WorkerRegistration> {
        let host = HostMetrics::new(self.config.ram_total_mb).sample();
        if host.ram_total_mb == 0 {
            return Err(FleetError::InvalidArgument(
                "host memory cannot be measured; set --ram-total-mb".to_string(),
            ));
        }
        if !host.memory_measured {
            tracing::warn!(
                ram_total_mb = host.ram_total_mb,
                "Host memory not measurable, advertising the configured size"
            );
        }
        Ok(WorkerRegistration {
            worker_id: match &self.config.worker_id {
                Some(id) => Some(id.clone()),
                None => load_worker_id(&self.config.state_dir).await,
            },
            hostname: metrics::hostname(),
            os: metrics::os(),
            cpu_count: metrics::cpu_count(),
            ram_total_mb: host.ram_total_mb,
            max_parallel_jobs: self.config.max_parallel_jobs.max(1) as u32,
        })
    }

    /// Register with backoff. Returns `None` if shut down first.
    async fn register(
        &self,
        registration: &WorkerRegistration,
        shutdown: &CancellationToken,
    ) -> Result<Option<String>> {
        let mut failures = 0u32;
        loop {
            match self.client.register(registration).await {
                Ok(worker_id) => {
                    tracing::info!(
                        worker_id = %worker_id,
                        max_parallel_jobs = registration.max_parallel_jobs,
                        "Registered with coordinator"
                    );
                    return Ok(Some(worker_id));
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    failures = failures.saturating_add(1);
                    if let Some(max) = self.config.register_max_attempts {
                        if failures >= max {
                            tracing::error!(attempts = failures, error = %e, "Giving up on registration");
                            return Err(e);
                        }
                    }
                    let delay = self.backoff.delay(failures - 1);
                    tracing::warn!(
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Registration failed, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Poll while a slot is free. A slot's permit travels with its job task
    /// and is released only after the result is reported.
    async fn poll_loop(
        &self,
        worker_id: &str,
        runner: Arc<JobRunner>,
        abandon: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> JoinSet<()> {
        let slots = Arc::new(Semaphore::new(self.config.max_parallel_jobs.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Job task panicked");
                }
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.client.poll(worker_id).await {
                Ok(Some(assignment)) => {
                    let cancel = self.running.start(assignment.job_id);
                    let running = self.running.clone();
                    let runner = runner.clone();
                    let abandon = abandon.clone();
                    tasks.spawn(async move {
                        runner.run(&assignment, &cancel, &abandon).await;
                        running.finish(&assignment.job_id);
                        drop(permit);
                    });
                    // Another slot may be free and more work may be waiting.
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    tracing::warn!(worker_id, error = %e, "Poll failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
        tasks
    }

    /// Let in-flight jobs finish within the shutdown timeout, then kill the
    /// rest and give their reports a short grace period.
    async fn drain(&self, tasks: &mut JoinSet<()>, abandon: &CancellationToken) {
        if tasks.is_empty() {
            return;
        }
        tracing::info!(
            in_flight = tasks.len(),
            timeout_ms = self.config.shutdown_timeout_ms,
            "Waiting for in-flight jobs"
        );
        let finished = tokio::time::timeout(self.config.shutdown_timeout(), join_all(tasks)).await;
        if finished.is_ok() {
            return;
        }

        tracing::warn!(in_flight = tasks.len(), "Shutdown timeout reached, cancelling jobs");
        self.running.cancel_all();
        if tokio::time::timeout(REPORT_GRACE, join_all(tasks)).await.is_err() {
            abandon.cancel();
            join_all(tasks).await;
        }
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Job task panicked");
        }
    }
}

fn worker_id_path(state_dir: &Path) -> PathBuf {
    state_dir.join(WORKER_ID_FILE)
}

async fn load_worker_id(state_dir: &Path) -> Option<String> {
    let id = tokio::fs::read_to_string(worker_id_path(state_dir)).await.ok()?;
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

async fn save_worker_id(state_dir: &Path, worker_id: &str) {
    let result = async {
        tokio::fs::create_dir_all(state_dir).await?;
        tokio::fs::write(worker_id_path(state_dir), format!("{worker_id}\n")).await
    }
    .await;
    if let Err(e) = result {
        tracing::warn!(path = %state_dir.display(), error = %e, "Failed to persist worker id");
    }
}
