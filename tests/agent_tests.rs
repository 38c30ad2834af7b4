//! Agent runtime against a real coordinator and against a scripted fake.


use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use uuid::Uuid;

use taskfleet::agent::{AgentRuntime, Assignment, CoordinatorClient};
use taskfleet::config::{ArtifactConfig, SandboxBackend, SandboxConfig};
use taskfleet::error::{FleetError, Result};
use taskfleet::proto::{CancelJobRequest, SubmitJobRequest};
use taskfleet::registry::{
    ExecutionReport, HeartbeatAck, HeartbeatReport, JobStatus, Registry, WorkerRegistration,
    WorkerStatus,
};
use taskfleet::sandbox;
use test_harness::{assert_eventually, test_agent_config, wait_for, TestCoordinator};

fn job(command: &str) -> SubmitJobRequest {
    SubmitJobRequest {
        command: command.to_string(),
        required_cpu: Some(1),
        required_ram_mb: Some(256),
        timeout_ms: Some(30_000),
        ..Default::default()
    }
}

async fn submit(coordinator: &TestCoordinator, request: SubmitJobRequest) -> Uuid {
    let mut client = coordinator.job_client().await;
    let resp = client.submit_job(request).await.unwrap().into_inner();
    Uuid::parse_str(&resp.job_id).unwrap()
}

async fn wait_for_status(registry: &Arc<Registry>, job_id: Uuid, status: JobStatus, timeout: Duration) {
    let r = registry.clone();
    assert_eventually(
        || {
            let r = r.clone();
            async move { r.job(&job_id).map(|j| j.status == status).unwrap_or(false) }
        },
        timeout,
        &format!("job {} should reach {}", job_id, status),
    )
    .await;
}

fn spawn_agent(
    runtime: AgentRuntime,
) -> (CancellationToken, tokio::task::JoinHandle<Result<()>>) {
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(shutdown.clone()));
    (shutdown, handle)
}

async fn stop_agent(shutdown: CancellationToken, handle: tokio::task::JoinHandle<Result<()>>) {
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(15), handle)
        .await
        .expect("agent should stop")
        .expect("agent task should not panic")
        .expect("agent should exit cleanly");
}

// ============================================================================
// Against a real coordinator
// ============================================================================

#[tokio::test]
async fn test_job_completes_and_workspace_is_removed() {
    let coordinator = TestCoordinator::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_agent_config(&coordinator.url(), dir.path(), 2);
    let work_dir = config.work_dir.clone();
    let (shutdown, handle) = spawn_agent(AgentRuntime::from_config(config).unwrap());

    let job_id = submit(&coordinator, job("echo hello > out.txt; cat out.txt; pwd")).await;
    wait_for_status(&coordinator.registry, job_id, JobStatus::Completed, Duration::from_secs(10)).await;

    let done = coordinator.registry.job(&job_id).unwrap();
    let mut lines = done.stdout.lines();
    assert_eq!(lines.next(), Some("hello"));
    let workspace = lines.next().unwrap().to_string();
    assert!(workspace.starts_with(&work_dir.display().to_string()));
    assert_eq!(done.exit_code, Some(0));
    assert!(done.executed_by.is_some());
    assert!(done.assigned_worker_id.is_none());

    assert!(!std::path::Path::new(&workspace).exists());
    let w = coordinator
        .registry
        .worker(done.executed_by.as_deref().unwrap())
        .unwrap();
    assert_eq!(w.reserved_cpu, 0);

    stop_agent(shutdown, handle).await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_artifact_is_fetched_into_workspace() {
    let coordinator = TestCoordinator::start().await;
    let dir = TempDir::new().unwrap();
    let artifact = dir.path().join("payload.txt");
    std::fs::write(&artifact, "from artifact\n").unwrap();

    let config = test_agent_config(&coordinator.url(), dir.path(), 1);
    let (shutdown, handle) = spawn_agent(AgentRuntime::from_config(config).unwrap());

    let job_id = submit(
        &coordinator,
        SubmitJobRequest {
            file_url: format!("file://{}", artifact.display()),
            filename: "input.txt".to_string(),
            ..job("cat input.txt")
        },
    )
    .await;
    wait_for_status(&coordinator.registry, job_id, JobStatus::Completed, Duration::from_secs(10)).await;
    assert_eq!(
        coordinator.registry.job(&job_id).unwrap().stdout,
        "from artifact\n"
    );

    stop_agent(shutdown, handle).await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_missing_artifact_fails_attempt() {
    let coordinator = TestCoordinator::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_agent_config(&coordinator.url(), dir.path(), 1);
    let (shutdown, handle) = spawn_agent(AgentRuntime::from_config(config).unwrap());

    let job_id = submit(
        &coordinator,
        SubmitJobRequest {
            file_url: format!("file://{}/missing.zip", dir.path().display()),
            max_retries: Some(0),
            ..job("true")
        },
    )
    .await;
    wait_for_status(&coordinator.registry, job_id, JobStatus::Failed, Duration::from_secs(10)).await;

    let failed = coordinator.registry.job(&job_id).unwrap();
    assert_eq!(failed.exit_code, Some(-1));
    assert!(failed.error_message.is_some());

    stop_agent(shutdown, handle).await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_file_artifacts_need_opt_in() {
    let coordinator = TestCoordinator::start().await;
    let dir = TempDir::new().unwrap();
    let secret = dir.path().join("secret.txt");
    std::fs::write(&secret, "do not leak\n").unwrap();

    let mut config = test_agent_config(&coordinator.url(), dir.path(), 1);
    config.artifacts = ArtifactConfig::default();
    let (shutdown, handle) = spawn_agent(AgentRuntime::from_config(config).unwrap());

    let job_id = submit(
        &coordinator,
        SubmitJobRequest {
            file_url: format!("file://{}", secret.display()),
            filename: "x".to_string(),
            max_retries: Some(0),
            ..job("cat x")
        },
    )
    .await;
    wait_for_status(&coordinator.registry, job_id, JobStatus::Failed, Duration::from_secs(10)).await;

    let failed = coordinator.registry.job(&job_id).unwrap();
    assert_eq!(failed.exit_code, Some(-1));
    assert!(!failed.stdout.contains("do not leak"));
    assert!(failed
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("file://"));

    stop_agent(shutdown, handle).await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_timed_out_job_is_recorded_and_workspace_removed() {
    let coordinator = TestCoordinator::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_agent_config(&coordinator.url(), dir.path(), 1);
    let work_dir = config.work_dir.clone();
    let (shutdown, handle) = spawn_agent(AgentRuntime::from_config(config).unwrap());

    let job_id = submit(
        &coordinator,
        SubmitJobRequest {
            timeout_ms: Some(300),
            max_retries: Some(0),
            ..job("pwd; sleep 30")
        },
    )
    .await;
    wait_for_status(&coordinator.registry, job_id, JobStatus::Failed, Duration::from_secs(10)).await;

    let failed = coordinator.registry.job(&job_id).unwrap();
    assert!(failed.timed_out);
    assert_eq!(failed.exit_code, Some(sandbox::TIMEOUT_EXIT_CODE));
    assert_eq!(failed.attempts, 1);
    assert!(failed.error_message.is_some());
    assert!(failed.elapsed_ms.unwrap() >= 300);

    let workspace = failed.stdout.lines().next().unwrap().to_string();
    assert!(workspace.starts_with(&work_dir.display().to_string()));
    assert!(!std::path::Path::new(&workspace).exists());
    let leftovers = std::fs::read_dir(&work_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);

    stop_agent(shutdown, handle).await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_parallelism_ceiling_is_respected() {
    let coordinator = TestCoordinator::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_agent_config(&coordinator.url(), dir.path(), 1);
    let (shutdown, handle) = spawn_agent(AgentRuntime::from_config(config).unwrap());

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(submit(&coordinator, job(&format!("sleep 0.3; echo {}", i))).await);
    }

    let registry = coordinator.registry.clone();
    let peak = Arc::new(Mutex::new(0usize));
    let observed = peak.clone();
    let all_done = wait_for(
        || {
            let registry = registry.clone();
            let observed = observed.clone();
            let ids = ids.clone();
            async move {
                let in_flight = registry.in_flight_jobs().unwrap().len();
                let mut peak = observed.lock().unwrap();
                *peak = (*peak).max(in_flight);
                ids.iter()
                    .all(|id| registry.job(id).unwrap().status == JobStatus::Completed)
            }
        },
        Duration::from_secs(20),
        Duration::from_millis(20),
    )
    .await;

    assert!(all_done, "all jobs should complete");
    assert_eq!(*peak.lock().unwrap(), 1);

    stop_agent(shutdown, handle).await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_job_is_killed_and_slot_freed() {
    let coordinator = TestCoordinator::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_agent_config(&coordinator.url(), dir.path(), 1);
    let (shutdown, handle) = spawn_agent(AgentRuntime::from_config(config).unwrap());

    let long = submit(&coordinator, job("sleep 30")).await;
    wait_for_status(&coordinator.registry, long, JobStatus::Running, Duration::from_secs(10)).await;

    let mut client = coordinator.job_client().await;
    client
        .cancel_job(CancelJobRequest {
            job_id: long.to_string(),
        })
        .await
        .unwrap();

    // The only slot must come back once the heartbeat revokes the job.
    let next = submit(&coordinator, job("echo next")).await;
    wait_for_status(&coordinator.registry, next, JobStatus::Completed, Duration::from_secs(10)).await;
    assert_eq!(
        coordinator.registry.job(&long).unwrap().status,
        JobStatus::Cancelled
    );

    stop_agent(shutdown, handle).await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_graceful_shutdown_finishes_job_and_deregisters() {
    let coordinator = TestCoordinator::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_agent_config(&coordinator.url(), dir.path(), 1);
    let state_dir = config.state_dir.clone();
    let (shutdown, handle) = spawn_agent(AgentRuntime::from_config(config.clone()).unwrap());

    let job_id = submit(&coordinator, job("sleep 0.5; echo finished")).await;
    wait_for_status(&coordinator.registry, job_id, JobStatus::Running, Duration::from_secs(10)).await;

    stop_agent(shutdown, handle).await;

    let done = coordinator.registry.job(&job_id).unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.stdout, "finished\n");

    let worker_id = std::fs::read_to_string(state_dir.join("worker_id"))
        .unwrap()
        .trim()
        .to_string();
    let w = coordinator.registry.worker(&worker_id).unwrap();
    assert_eq!(w.status, WorkerStatus::Offline);
    assert_eq!(w.reserved_cpu, 0);

    // A restarted agent comes back under the same id.
    let (shutdown, handle) = spawn_agent(AgentRuntime::from_config(config).unwrap());
    let registry = coordinator.registry.clone();
    let id = worker_id.clone();
    assert_eventually(
        || {
            let registry = registry.clone();
            let id = id.clone();
            async move { registry.worker(&id).unwrap().status == WorkerStatus::Idle }
        },
        Duration::from_secs(5),
        "Restarted agent should re-register",
    )
    .await;
    assert_eq!(coordinator.registry.workers().unwrap().len(), 1);

    stop_agent(shutdown, handle).await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_timeout_cancels_running_job() {
    let coordinator = TestCoordinator::start().await;
    let dir = TempDir::new().unwrap();
    let mut config = test_agent_config(&coordinator.url(), dir.path(), 1);
    config.shutdown_timeout_ms = 300;
    let (shutdown, handle) = spawn_agent(AgentRuntime::from_config(config).unwrap());

    let job_id = submit(&coordinator, job("sleep 30")).await;
    wait_for_status(&coordinator.registry, job_id, JobStatus::Running, Duration::from_secs(10)).await;

    stop_agent(shutdown, handle).await;

    let job = coordinator.registry.job(&job_id).unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(
        job.error_message.as_deref(),
        Some("Execution cancelled on the agent")
    );
    assert!(!job.status.is_in_flight());

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_registration_gives_up_after_max_attempts() {
    let dir = TempDir::new().unwrap();
    let mut config = test_agent_config("http://127.0.0.1:1", dir.path(), 1);
    config.register_max_attempts = Some(2);

    let result = tokio::time::timeout(
        Duration::from_secs(20),
        AgentRuntime::from_config(config)
            .unwrap()
            .run(CancellationToken::new()),
    )
    .await
    .expect("registration should give up");

    let err = result.unwrap_err();
    assert!(err.is_transient(), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_hung_sandbox_runtime_reports_unhealthy_not_silence() {
    use std::os::unix::fs::PermissionsExt;

    let coordinator = TestCoordinator::start().await;
    let dir = TempDir::new().unwrap();
    let runtime_bin = dir.path().join("docker");
    std::fs::write(&runtime_bin, "#!/bin/sh\nexec sleep 60\n").unwrap();
    std::fs::set_permissions(&runtime_bin, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = test_agent_config(&coordinator.url(), dir.path(), 1);
    config.sandbox = SandboxConfig {
        backend: SandboxBackend::Docker,
        docker_binary: runtime_bin.display().to_string(),
        health_check_timeout_ms: 100,
        ..SandboxConfig::default()
    };
    let (shutdown, handle) = spawn_agent(AgentRuntime::from_config(config).unwrap());

    let registry = coordinator.registry.clone();
    assert_eventually(
        || {
            let registry = registry.clone();
            async move {
                registry
                    .workers()
                    .map(|ws| ws.len() == 1 && ws[0].status == WorkerStatus::Unhealthy)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(10),
        "worker should be reported unhealthy",
    )
    .await;

    // Heartbeats keep arriving while the health check keeps failing.
    let first = registry.workers().unwrap()[0].last_heartbeat_at;
    let r = registry.clone();
    assert_eventually(
        || {
            let r = r.clone();
            async move { r.workers().map(|ws| ws[0].last_heartbeat_at > first).unwrap_or(false) }
        },
        Duration::from_secs(5),
        "heartbeats should continue",
    )
    .await;
    assert_eq!(registry.workers().unwrap()[0].status, WorkerStatus::Unhealthy);

    stop_agent(shutdown, handle).await;
    coordinator.shutdown().await;
}

// ============================================================================
// Against a scripted coordinator
// ============================================================================

#[derive(Debug, Default)]
struct Script {
    assignments: VecDeque<Assignment>,
    /// Errors returned by the next `submit_result` calls, in order.
    submit_errors: VecDeque<FleetError>,
    submits: Vec<(Uuid, ExecutionReport)>,
    polls_after_empty: usize,
    deregistered: bool,
}

#[derive(Debug, Default)]
struct FakeCoordinator {
    script: Mutex<Script>,
}

impl FakeCoordinator {
    fn with(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
        })
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }
}

#[tonic::async_trait]
impl CoordinatorClient for FakeCoordinator {
    async fn register(&self, _registration: &WorkerRegistration) -> Result<String> {
        Ok("w-fake".to_string())
    }

    async fn heartbeat(&self, _worker_id: &str, _report: &HeartbeatReport) -> Result<HeartbeatAck> {
        Ok(HeartbeatAck {
            status: WorkerStatus::Idle,
            revoked_job_ids: Vec::new(),
        })
    }

    async fn poll(&self, _worker_id: &str) -> Result<Option<Assignment>> {
        let mut script = self.script();
        let next = script.assignments.pop_front();
        if next.is_none() {
            script.polls_after_empty += 1;
        }
        Ok(next)
    }

    async fn submit_result(
        &self,
        _worker_id: &str,
        job_id: Uuid,
        report: &ExecutionReport,
    ) -> Result<JobStatus> {
        let mut script = self.script();
        script.submits.push((job_id, report.clone()));
        match script.submit_errors.pop_front() {
            Some(err) => Err(err),
            None => Ok(JobStatus::Completed),
        }
    }

    async fn deregister(&self, _worker_id: &str) -> Result<u32> {
        self.script().deregistered = true;
        Ok(0)
    }
}

fn assignment(command: &str) -> Assignment {
    Assignment {
        job_id: Uuid::new_v4(),
        command: command.to_string(),
        file_url: String::new(),
        filename: String::new(),
        required_cpu: 1,
        required_ram_mb: 256,
        timeout_ms: 10_000,
        attempt: 1,
    }
}

fn fake_runtime(fake: &Arc<FakeCoordinator>, dir: &std::path::Path) -> AgentRuntime {
    let config = test_agent_config("http://unused", dir, 1);
    let sandbox = sandbox::from_config(&config.sandbox);
    AgentRuntime::new(config, fake.clone(), sandbox).unwrap()
}

#[tokio::test]
async fn test_result_submission_is_retried_on_outage() {
    let dir = TempDir::new().unwrap();
    let flaky = assignment("echo flaky");
    let fake = FakeCoordinator::with(Script {
        assignments: VecDeque::from([flaky.clone()]),
        submit_errors: VecDeque::from([
            FleetError::Grpc(Status::unavailable("coordinator restarting")),
            FleetError::Grpc(Status::unavailable("coordinator restarting")),
        ]),
        ..Default::default()
    });
    let (shutdown, handle) = spawn_agent(fake_runtime(&fake, dir.path()));

    let f = fake.clone();
    assert_eventually(
        || {
            let f = f.clone();
            async move {
                let script = f.script();
                script.submits.len() == 3 && script.polls_after_empty > 0
            }
        },
        Duration::from_secs(10),
        "Result should be resubmitted until accepted",
    )
    .await;
    stop_agent(shutdown, handle).await;

    let script = fake.script();
    assert!(script.submits.iter().all(|(id, _)| *id == flaky.job_id));
    assert_eq!(script.submits[2].1.stdout, "flaky\n");
    assert_eq!(script.submits[2].1.exit_code, 0);
    assert!(script.deregistered);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("state").join("worker_id")).unwrap(),
        "w-fake\n"
    );
}

#[tokio::test]
async fn test_rejected_result_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let first = assignment("echo one");
    let second = assignment("echo two");
    let fake = FakeCoordinator::with(Script {
        assignments: VecDeque::from([first.clone(), second.clone()]),
        submit_errors: VecDeque::from([FleetError::Conflict("job was reclaimed".to_string())]),
        ..Default::default()
    });
    let (shutdown, handle) = spawn_agent(fake_runtime(&fake, dir.path()));

    let f = fake.clone();
    assert_eventually(
        || {
            let f = f.clone();
            async move { f.script().submits.len() == 2 }
        },
        Duration::from_secs(10),
        "Both assignments should run on the single slot",
    )
    .await;
    // Give a wrongly retried submit a chance to show up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    stop_agent(shutdown, handle).await;

    let script = fake.script();
    let ids: Vec<Uuid> = script.submits.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![first.job_id, second.job_id]);
    assert_eq!(script.submits[1].1.stdout, "two\n");
}
