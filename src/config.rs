use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Scheduler loop tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between scheduler passes (triggers may run one sooner).
    pub tick_interval_ms: u64,
    /// A worker with no heartbeat for this long is marked OFFLINE.
    pub heartbeat_timeout_ms: u64,
    /// Slack added to a job's own `timeout_ms` before the scheduler reclaims
    /// it. The agent's sandbox kills at exactly `timeout_ms`; this leaves it
    /// room to report first.
    pub timeout_grace_ms: u64,
    /// Weight of live CPU usage in the placement load score.
    pub cpu_usage_weight: f64,
    /// Weight of reservation saturation in the placement load score.
    pub saturation_weight: f64,
    /// How often heartbeat-only changes are flushed to a durable store.
    pub flush_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            heartbeat_timeout_ms: 30_000,
            timeout_grace_ms: 10_000,
            cpu_usage_weight: 0.5,
            saturation_weight: 0.5,
            flush_interval_ms: 30_000,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.heartbeat_timeout_ms as i64)
    }

    pub fn timeout_grace(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.timeout_grace_ms as i64)
    }
}

/// What happens to a worker and a job after a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Window during which a worker implicated in a failure gets no new jobs.
    pub agent_cooldown_ms: u64,
    /// Delay before a retry-pending job becomes QUEUED again.
    pub retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            agent_cooldown_ms: 30_000,
            retry_delay_ms: 0,
        }
    }
}

impl RetryPolicy {
    pub fn agent_cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.agent_cooldown_ms as i64)
    }

    pub fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.retry_delay_ms as i64)
    }
}

/// Values used for fields a job submission leaves out.
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub required_cpu: u32,
    pub required_ram_mb: u64,
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            required_cpu: 1,
            required_ram_mb: 256,
            timeout_ms: 600_000,
            max_retries: 2,
        }
    }
}

/// Configuration of the central coordinator process.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub listen_addr: SocketAddr,
    /// Snapshot file for worker and job records. `None` keeps state in memory.
    pub state_file: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
    pub job_defaults: JobDefaults,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:50051"
                .parse()
                .expect("default listen address is valid"),
            state_file: None,
            scheduler: SchedulerConfig::default(),
            retry: RetryPolicy::default(),
            job_defaults: JobDefaults::default(),
        }
    }
}

/// Which isolation mechanism runs job commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SandboxBackend {
    /// One locked-down container per job.
    #[default]
    Docker,
    /// A host process in its own process group with rlimits.
    Process,
}

/// Configuration for sandboxed job execution.
///
/// Per-job memory and CPU limits come from the job's own requirements; the
/// fields here are the agent-wide hardening knobs.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    /// Container runtime binary (docker backend)
    pub docker_binary: String,
    /// Image used for job containers (docker backend)
    pub image: String,
    /// Disable network access in the sandbox
    pub network_disabled: bool,
    /// Maximum number of processes inside the sandbox
    pub pids_limit: u64,
    /// Size of the writable /tmp area in MB
    pub tmpfs_size_mb: u64,
    /// Bytes of stdout/stderr kept per stream
    pub max_output_bytes: usize,
    /// Optional `uid[:gid]` to run the command as (docker backend)
    pub user: Option<String>,
    /// A health check slower than this counts as a failure
    pub health_check_timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Docker,
            docker_binary: "docker".to_string(),
            image: "alpine:latest".to_string(),
            network_disabled: true,
            pids_limit: 256,
            tmpfs_size_mb: 64,
            max_output_bytes: 1024 * 1024,
            user: None,
            health_check_timeout_ms: 5_000,
        }
    }
}

impl SandboxConfig {
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms.max(1))
    }
}

/// Limits on job input artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    /// Accept `file://` artifact URLs. These read from the agent's own
    /// filesystem, so leave this off outside local development.
    pub allow_file_urls: bool,
    /// Largest artifact accepted, in bytes
    pub max_download_bytes: u64,
    /// Total bytes an archive may expand to in the workspace
    pub max_extracted_bytes: u64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            allow_file_urls: false,
            max_download_bytes: 512 * 1024 * 1024,
            max_extracted_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

/// Configuration of a worker agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Coordinator endpoint, e.g. `http://10.0.0.5:50051`
    pub coordinator_addr: String,
    /// Fixed worker id. When unset, the id persisted under `state_dir` is
    /// reused, or the coordinator assigns one.
    pub worker_id: Option<String>,
    /// Directory holding the persisted worker id
    pub state_dir: PathBuf,
    /// Parent directory for per-job workspaces
    pub work_dir: PathBuf,
    pub heartbeat_interval_ms: u64,
    pub poll_interval_ms: u64,
    /// Ceiling on concurrently executing jobs
    pub max_parallel_jobs: usize,
    /// RAM to advertise when the host cannot report its memory
    pub ram_total_mb: Option<u64>,
    /// Registration attempts before giving up. `None` retries forever.
    pub register_max_attempts: Option<u32>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How long in-flight jobs may keep running after shutdown is requested
    pub shutdown_timeout_ms: u64,
    pub sandbox: SandboxConfig,
    pub artifacts: ArtifactConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            coordinator_addr: "http://127.0.0.1:50051".to_string(),
            worker_id: None,
            state_dir: PathBuf::from(".taskfleet-agent"),
            work_dir: std::env::temp_dir().join("taskfleet-work"),
            heartbeat_interval_ms: 10_000,
            poll_interval_ms: 5_000,
            max_parallel_jobs: default_parallelism(),
            ram_total_mb: None,
            register_max_attempts: None,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            shutdown_timeout_ms: 30_000,
            sandbox: SandboxConfig::default(),
            artifacts: ArtifactConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Half the local cores, at least one.
pub fn default_parallelism() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores / 2).max(1)
}
