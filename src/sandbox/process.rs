use std::io::ErrorKind;
use std::process::Stdio;

use nix::errno::Errno;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setpgid, Pid};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::supervise::Supervisor;
use super::{ExecutionOutcome, SandboxError, SandboxRequest, SandboxRunner};
use crate::config::SandboxConfig;

const SAFE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const MIB: u64 = 1024 * 1024;

/// Runs each command as a host process in its own process group.
///
/// Weaker than the container backend: there is no filesystem or network
/// isolation. The command gets a scrubbed environment, the workspace as its
/// working and home directory, and rlimits on address space, process count
/// and file size. The whole group is SIGKILLed once the command ends, times
/// out or is cancelled, so background children cannot outlive the job.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &SandboxRequest) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&request.workspace)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("HOME", &request.workspace)
            .env("TMPDIR", &request.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let memory = request.limits.memory_mb.saturating_mul(MIB);
        let processes = self.config.pids_limit;
        let file_size = self.config.tmpfs_size_mb.saturating_mul(MIB);
        // SAFETY: the hook only makes async-signal-safe syscalls between
        // fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
                setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
                if memory > 0 {
                    setrlimit(Resource::RLIMIT_AS, memory, memory)?;
                }
                if processes > 0 {
                    setrlimit(Resource::RLIMIT_NPROC, processes, processes)?;
                }
                if file_size > 0 {
                    setrlimit(Resource::RLIMIT_FSIZE, file_size, file_size)?;
                }
                Ok(())
            });
        }
        cmd
    }
}

/// SIGKILL the group led by `pid`. A group that is already gone is fine.
fn kill_group(pid: u32) {
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "Failed to kill process group"),
    }
}

#[tonic::async_trait]
impl SandboxRunner for ProcessSandbox {
    async fn run(
        &self,
        request: &SandboxRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, SandboxError> {
        tracing::info!(job_id = %request.job_id, workspace = %request.workspace.display(), "Starting sandboxed job");

        let child = match self.command(request).spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SandboxError::Unavailable(format!(
                    "cannot start shell in {}: {}",
                    request.workspace.display(),
                    e
                )))
            }
            Err(e) => return Err(SandboxError::Io(e)),
        };

        let mut supervisor = Supervisor::start(child, self.config.max_output_bytes);
        let pid = supervisor.pid();
        let ending = supervisor.wait(request.limits.timeout, cancel).await;

        // The group outlives its leader if the command backgrounded anything.
        if let Some(pid) = pid {
            kill_group(pid);
        }

        let outcome = supervisor.finish(ending?).await;
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
        let shell = Command::new("sh")
            .args(["-c", "true"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        let limit = self.config.health_check_timeout();
        let Ok(status) = tokio::time::timeout(limit, shell).await else {
            return Err(SandboxError::Unavailable(
                "shell health check timed out".to_string(),
            ));
        };
        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(SandboxError::Unavailable(format!(
                "shell probe exited with {}",
                status
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(SandboxError::Unavailable("sh not found".to_string()))
            }
            Err(e) => Err(SandboxError::Io(e)),
        }
    }
}
