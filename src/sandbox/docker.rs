use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::supervise::Supervisor;
use super::{ExecutionOutcome, SandboxError, SandboxRequest, SandboxRunner};
use crate::config::SandboxConfig;

/// Exit code `docker run` uses when the daemon could not start the container.
const DOCKER_RUN_ERROR: i32 = 125;
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs each command in its own throwaway container.
///
/// Containers are created with:
/// - Network isolation (disabled by default)
/// - All capabilities dropped and no privilege escalation
/// - Read-only root filesystem; only `/workspace` and a capped `/tmp` are writable
/// - Memory, CPU and process-count limits
///
/// The container is force-removed on every exit path.
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    config: SandboxConfig,
}

impl DockerSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Arguments for `docker run`.
    pub fn run_args(&self, name: &str, request: &SandboxRequest) -> Vec<String> {
        let limits = &request.limits;
        let mut args = vec!["run".to_string(), "--name".to_string(), name.to_string()];

        // Network isolation
        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }

        // Memory limit, no swap on top
        if limits.memory_mb > 0 {
            args.push(format!("--memory={}m", limits.memory_mb));
            args.push(format!("--memory-swap={}m", limits.memory_mb));
        }

        // CPU limit
        if limits.cpus > 0 {
            args.push(format!("--cpus={}", limits.cpus));
        }

        if self.config.pids_limit > 0 {
            args.push(format!("--pids-limit={}", self.config.pids_limit));
        }

        // Security: drop all capabilities, no new privileges
        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());

        // Read-only root filesystem with explicit scratch areas
        args.push("--read-only".to_string());
        args.push("--tmpfs".to_string());
        args.push(format!(
            "/tmp:rw,noexec,nosuid,size={}m",
            self.config.tmpfs_size_mb
        ));
        args.push("-v".to_string());
        args.push(format!("{}:/workspace:rw", request.workspace.display()));
        args.push("-w".to_string());
        args.push("/workspace".to_string());

        if let Some(user) = &self.config.user {
            args.push(format!("--user={}", user));
        }

        // Add image and command
        args.push(self.config.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(request.command.clone());
        args
    }

    async fn remove_container(&self, name: &str) {
        let removal = Command::new(&self.config.docker_binary)
            .args(["rm", "-f", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(REMOVE_TIMEOUT, removal).await {
            Ok(Ok(output)) if output.status.success() => {
                tracing::debug!(container = name, "Container removed");
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                // Already gone is fine.
                if !stderr.contains("No such container") {
                    tracing::warn!(container = name, stderr = %stderr.trim(), "Container removal failed");
                }
            }
            Ok(Err(e)) => tracing::warn!(container = name, error = %e, "Container removal failed"),
            Err(_) => tracing::warn!(container = name, "Container removal timed out"),
        }
    }
}

#[tonic::async_trait]
impl SandboxRunner for DockerSandbox {
    async fn run(
        &self,
        request: &SandboxRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("taskfleet-{}-{}", request.job_id.simple(), &suffix[..8]);
        tracing::info!(
            job_id = %request.job_id,
            container = %name,
            image = %self.config.image,
            "Starting sandboxed job"
        );

        let child = Command::new(&self.config.docker_binary)
            .args(self.run_args(&name, request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SandboxError::Unavailable(format!(
                    "container runtime {:?} not found",
                    self.config.docker_binary
                )))
            }
            Err(e) => return Err(SandboxError::Io(e)),
        };

        let mut supervisor = Supervisor::start(child, self.config.max_output_bytes);
        let ending = supervisor.wait(request.limits.timeout, cancel).await;

        // Teardown on every path, including a failed wait.
        self.remove_container(&name).await;

        let ending = ending?;
        let outcome = supervisor.finish(ending).await;
        if outcome.exit_code == DOCKER_RUN_ERROR && !outcome.timed_out && !outcome.cancelled {
            return Err(SandboxError::Unavailable(format!(
                "container failed to start: {}",
                outcome.stderr.trim()
            )));
        }

        tracing::info!(
            job_id = %request.job_id,
            exit_code = outcome.exit_code,
            elapsed_ms = outcome.elapsed_ms,
            timed_out = outcome.timed_out,
            "Sandboxed job finished"
        );
        Ok(outcome)
    }

    async fn probe(&self) -> Result<(), SandboxError> {
        let version = Command::new(&self.config.docker_binary)
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let limit = self.config.health_check_timeout();
        let Ok(output) = tokio::time::timeout(limit, version).await else {
            return Err(SandboxError::Unavailable(format!(
                "container runtime did not answer within {}ms",
                self.config.health_check_timeout_ms
            )));
        };
        match output {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(SandboxError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(SandboxError::Unavailable(format!(
                "container runtime {:?} not found",
                self.config.docker_binary
            ))),
            Err(e) => Err(SandboxError::Io(e)),
        }
    }
}
