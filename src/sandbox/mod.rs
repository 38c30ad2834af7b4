//! Isolated, resource-limited execution of a single command.
//!
//! A [`SandboxRunner`] knows nothing about jobs or scheduling: it gets a
//! command, a workspace directory and limits, and returns an
//! [`ExecutionOutcome`]. Every backend guarantees:
//! - a hard wall-clock kill at the timeout, reported as `timed_out` with
//!   exit code [`TIMEOUT_EXIT_CODE`]
//! - teardown of the container or process group on every exit path
//! - stdout/stderr capped at `max_output_bytes` each

mod docker;
mod process;
mod supervise;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{SandboxBackend, SandboxConfig};
use crate::error::FleetError;

pub use docker::DockerSandbox;
pub use process::ProcessSandbox;

/// Exit code reported when the wall-clock timeout killed the command.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when the run was cancelled from outside.
pub const CANCELLED_EXIT_CODE: i32 = 137;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpus: u32,
    pub memory_mb: u64,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub job_id: Uuid,
    pub command: String,
    /// The only writable directory the command sees besides scratch space.
    pub workspace: PathBuf,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    pub cancelled: bool,
    /// At least one stream hit the output cap.
    pub truncated: bool,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),

    #[error("Sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SandboxError> for FleetError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Unavailable(msg) => FleetError::SandboxUnavailable(msg),
            SandboxError::Io(e) => FleetError::Io(e),
        }
    }
}

#[tonic::async_trait]
pub trait SandboxRunner: Send + Sync + std::fmt::Debug {
    /// Run `request` to completion, timeout or cancellation.
    async fn run(
        &self,
        request: &SandboxRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, SandboxError>;

    /// Cheap check that the backend can start commands at all.
    async fn probe(&self) -> Result<(), SandboxError>;
}

/// Build the runner selected by `config.backend`.
pub fn from_config(config: &SandboxConfig) -> Arc<dyn SandboxRunner> {
    match config.backend {
        SandboxBackend::Docker => Arc::new(DockerSandbox::new(config.clone())),
        SandboxBackend::Process => Arc::new(ProcessSandbox::new(config.clone())),
    }
}
