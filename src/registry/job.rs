use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::JobDefaults;
use crate::error::{FleetError, Result};

/// Longest per-job timeout accepted at submission (30 days).
pub const MAX_TIMEOUT_MS: u64 = 30 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// A failed attempt waiting for `retry_at` before it is QUEUED again.
    TimedOutRetrying,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Holding a reservation on some worker.
    pub fn is_in_flight(self) -> bool {
        matches!(self, JobStatus::Assigned | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Submitted => write!(f, "SUBMITTED"),
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::Assigned => write!(f, "ASSIGNED"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Cancelled => write!(f, "CANCELLED"),
            JobStatus::TimedOutRetrying => write!(f, "TIMED_OUT_RETRYING"),
        }
    }
}

/// A job as submitted. Unset requirements fall back to [`JobDefaults`].
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub command: String,
    pub file_url: String,
    pub filename: String,
    pub required_cpu: Option<u32>,
    pub required_ram_mb: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

impl JobSpec {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

/// What an agent reports after running (or failing to run) a job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionReport {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    /// Set when the command could not be run at all.
    pub error_message: Option<String>,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && self.error_message.is_none()
    }

    /// Message stored on the job when this attempt counts as a failure.
    pub fn failure_message(&self, timeout_ms: u64) -> String {
        if let Some(message) = &self.error_message {
            message.clone()
        } else if self.timed_out {
            FleetError::ExecutionTimeout { timeout_ms }.to_string()
        } else {
            format!("Command exited with code {}", self.exit_code)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub command: String,
    pub file_url: String,
    pub filename: String,
    pub required_cpu: u32,
    pub required_ram_mb: u64,
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// Failed attempts so far.
    pub attempts: u32,
    pub status: JobStatus,
    pub assigned_worker_id: Option<String>,
    /// Last worker that ran the job, kept after it leaves ASSIGNED/RUNNING.
    pub executed_by: Option<String>,
    /// Workers that failed this job; placement avoids them when it can.
    pub failed_workers: BTreeSet<String>,
    pub submitted_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub timed_out: bool,
}

impl JobRecord {
    /// Validate a submission and build its SUBMITTED record.
    pub fn new(spec: JobSpec, defaults: &JobDefaults, now: DateTime<Utc>) -> Result<Self> {
        if spec.command.trim().is_empty() {
            return Err(FleetError::InvalidArgument(
                "command must not be empty".to_string(),
            ));
        }
        let required_cpu = spec.required_cpu.unwrap_or(defaults.required_cpu);
        if required_cpu == 0 {
            return Err(FleetError::InvalidArgument(
                "required_cpu must be at least 1".to_string(),
            ));
        }
        let timeout_ms = spec.timeout_ms.unwrap_or(defaults.timeout_ms);
        if timeout_ms == 0 {
            return Err(FleetError::InvalidArgument(
                "timeout_ms must be positive".to_string(),
            ));
        }
        if timeout_ms > MAX_TIMEOUT_MS {
            return Err(FleetError::InvalidArgument(format!(
                "timeout_ms must be at most {}",
                MAX_TIMEOUT_MS
            )));
        }
        if !spec.file_url.is_empty() && spec.filename.contains(['/', '\\']) {
            return Err(FleetError::InvalidArgument(format!(
                "filename {:?} must not contain path separators",
                spec.filename
            )));
        }

        Ok(Self {
            job_id: Uuid::new_v4(),
            command: spec.command,
            file_url: spec.file_url,
            filename: spec.filename,
            required_cpu,
            required_ram_mb: spec.required_ram_mb.unwrap_or(defaults.required_ram_mb),
            timeout_ms,
            max_retries: spec.max_retries.unwrap_or(defaults.max_retries),
            attempts: 0,
            status: JobStatus::Submitted,
            assigned_worker_id: None,
            executed_by: None,
            failed_workers: BTreeSet::new(),
            submitted_at: now,
            queued_at: None,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            retry_at: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            error_message: None,
            elapsed_ms: None,
            timed_out: false,
        })
    }

    /// Records loaded from disk are not validated, so clamp here.
    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.timeout_ms.min(MAX_TIMEOUT_MS) as i64)
    }

    /// The attempt number an agent is about to run, starting at 1.
    pub fn current_attempt(&self) -> u32 {
        self.attempts + 1
    }

    /// Whether `worker_id` currently owns this job.
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.status.is_in_flight() && self.assigned_worker_id.as_deref() == Some(worker_id)
    }

    /// Back to the queue for a fresh placement.
    pub(crate) fn enqueue(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.queued_at = Some(now);
        self.assigned_worker_id = None;
        self.assigned_at = None;
        self.started_at = None;
        self.retry_at = None;
    }

    pub(crate) fn record_output(&mut self, report: &ExecutionReport) {
        self.stdout = report.stdout.clone();
        self.stderr = report.stderr.clone();
        self.exit_code = Some(report.exit_code);
        self.elapsed_ms = Some(report.elapsed_ms);
        self.timed_out = report.timed_out;
    }

    /// Leave ASSIGNED/RUNNING: the owner becomes `executed_by`.
    pub(crate) fn detach(&mut self) -> Option<String> {
        let worker_id = self.assigned_worker_id.take();
        if worker_id.is_some() {
            self.executed_by = worker_id.clone();
        }
        worker_id
    }

    /// Count a failed attempt and pick retry-pending or FAILED.
    pub(crate) fn settle_failure(
        &mut self,
        message: String,
        now: DateTime<Utc>,
        retry_at: DateTime<Utc>,
    ) {
        self.attempts += 1;
        if let Some(worker_id) = &self.executed_by {
            self.failed_workers.insert(worker_id.clone());
        }
        self.error_message = Some(message);
        self.assigned_at = None;
        if self.attempts <= self.max_retries {
            self.status = JobStatus::TimedOutRetrying;
            self.retry_at = Some(retry_at);
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
            self.retry_at = None;
        }
    }
}
