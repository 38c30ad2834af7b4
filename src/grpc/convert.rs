use tonic::Status;
use uuid::Uuid;

use crate::proto::{
    JobAssignment, JobInfo, JobStatus as ProtoJobStatus, SubmitJobRequest, SubmitResultRequest,
    WorkerInfo, WorkerStatus as ProtoWorkerStatus,
};
use crate::registry::{ExecutionReport, JobRecord, JobSpec, JobStatus, WorkerRecord, WorkerStatus};

pub fn job_status_to_proto(status: JobStatus) -> ProtoJobStatus {
    match status {
        JobStatus::Submitted => ProtoJobStatus::Submitted,
        JobStatus::Queued => ProtoJobStatus::Queued,
        JobStatus::Assigned => ProtoJobStatus::Assigned,
        JobStatus::Running => ProtoJobStatus::Running,
        JobStatus::Completed => ProtoJobStatus::Completed,
        JobStatus::Failed => ProtoJobStatus::Failed,
        JobStatus::Cancelled => ProtoJobStatus::Cancelled,
        JobStatus::TimedOutRetrying => ProtoJobStatus::TimedOutRetrying,
    }
}

/// `None` for UNSPECIFIED or unknown values.
pub fn job_status_from_proto(value: i32) -> Option<JobStatus> {
    match ProtoJobStatus::try_from(value).ok()? {
        ProtoJobStatus::Unspecified => None,
        ProtoJobStatus::Submitted => Some(JobStatus::Submitted),
        ProtoJobStatus::Queued => Some(JobStatus::Queued),
        ProtoJobStatus::Assigned => Some(JobStatus::Assigned),
        ProtoJobStatus::Running => Some(JobStatus::Running),
        ProtoJobStatus::Completed => Some(JobStatus::Completed),
        ProtoJobStatus::Failed => Some(JobStatus::Failed),
        ProtoJobStatus::Cancelled => Some(JobStatus::Cancelled),
        ProtoJobStatus::TimedOutRetrying => Some(JobStatus::TimedOutRetrying),
    }
}

pub fn worker_status_to_proto(status: WorkerStatus) -> ProtoWorkerStatus {
    match status {
        WorkerStatus::Idle => ProtoWorkerStatus::Idle,
        WorkerStatus::Busy => ProtoWorkerStatus::Busy,
        WorkerStatus::Unhealthy => ProtoWorkerStatus::Unhealthy,
        WorkerStatus::Offline => ProtoWorkerStatus::Offline,
    }
}

pub fn worker_status_from_proto(value: i32) -> Option<WorkerStatus> {
    match ProtoWorkerStatus::try_from(value).ok()? {
        ProtoWorkerStatus::Unspecified => None,
        ProtoWorkerStatus::Idle => Some(WorkerStatus::Idle),
        ProtoWorkerStatus::Busy => Some(WorkerStatus::Busy),
        ProtoWorkerStatus::Unhealthy => Some(WorkerStatus::Unhealthy),
        ProtoWorkerStatus::Offline => Some(WorkerStatus::Offline),
    }
}

pub fn parse_job_id(raw: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(raw).map_err(|_| Status::invalid_argument(format!("Invalid job ID: {:?}", raw)))
}

pub fn job_to_info(job: &JobRecord) -> JobInfo {
    JobInfo {
        job_id: job.job_id.to_string(),
        command: job.command.clone(),
        file_url: job.file_url.clone(),
        filename: job.filename.clone(),
        required_cpu: job.required_cpu,
        required_ram_mb: job.required_ram_mb,
        timeout_ms: job.timeout_ms,
        max_retries: job.max_retries,
        attempts: job.attempts,
        status: job_status_to_proto(job.status) as i32,
        assigned_worker_id: job.assigned_worker_id.clone(),
        executed_by: job.executed_by.clone(),
        submitted_at_ms: job.submitted_at.timestamp_millis(),
        queued_at_ms: job.queued_at.map(|t| t.timestamp_millis()),
        assigned_at_ms: job.assigned_at.map(|t| t.timestamp_millis()),
        started_at_ms: job.started_at.map(|t| t.timestamp_millis()),
        completed_at_ms: job.completed_at.map(|t| t.timestamp_millis()),
        stdout: job.stdout.clone(),
        stderr: job.stderr.clone(),
        exit_code: job.exit_code,
        error_message: job.error_message.clone(),
        elapsed_ms: job.elapsed_ms,
        timed_out: job.timed_out,
    }
}

pub fn job_to_assignment(job: &JobRecord) -> JobAssignment {
    JobAssignment {
        job_id: job.job_id.to_string(),
        command: job.command.clone(),
        file_url: job.file_url.clone(),
        filename: job.filename.clone(),
        required_cpu: job.required_cpu,
        required_ram_mb: job.required_ram_mb,
        timeout_ms: job.timeout_ms,
        attempt: job.current_attempt(),
    }
}

pub fn worker_to_info(worker: &WorkerRecord) -> WorkerInfo {
    WorkerInfo {
        worker_id: worker.worker_id.clone(),
        hostname: worker.hostname.clone(),
        os: worker.os.clone(),
        cpu_count: worker.cpu_count,
        ram_total_mb: worker.ram_total_mb,
        status: worker_status_to_proto(worker.status) as i32,
        last_heartbeat_at_ms: worker.last_heartbeat_at.timestamp_millis(),
        cpu_usage_percent: worker.cpu_usage_percent,
        ram_free_mb: worker.ram_free_mb,
        reserved_cpu: worker.reserved_cpu,
        reserved_ram_mb: worker.reserved_ram_mb,
        current_job_ids: worker.current_job_ids.iter().map(Uuid::to_string).collect(),
        cooldown_until_ms: worker.cooldown_until.map(|t| t.timestamp_millis()),
        max_parallel_jobs: worker.max_parallel_jobs,
        registered_at_ms: worker.registered_at.timestamp_millis(),
    }
}

pub fn spec_from_request(req: SubmitJobRequest) -> JobSpec {
    JobSpec {
        command: req.command,
        file_url: req.file_url,
        filename: req.filename,
        required_cpu: req.required_cpu,
        required_ram_mb: req.required_ram_mb,
        timeout_ms: req.timeout_ms,
        max_retries: req.max_retries,
    }
}

pub fn report_from_request(req: &SubmitResultRequest) -> ExecutionReport {
    ExecutionReport {
        stdout: req.stdout.clone(),
        stderr: req.stderr.clone(),
        exit_code: req.exit_code,
        elapsed_ms: req.elapsed_ms,
        timed_out: req.timed_out,
        error_message: Some(req.error_message.clone()).filter(|m| !m.is_empty()),
    }
}
