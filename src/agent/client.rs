use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::grpc::convert::{job_status_from_proto, worker_status_from_proto, worker_status_to_proto};
use crate::proto::agent_service_client::AgentServiceClient;
use crate::proto::{
    DeregisterWorkerRequest, HeartbeatRequest, PollForJobRequest, RegisterWorkerRequest,
    SubmitResultRequest,
};
use crate::registry::{
    ExecutionReport, HeartbeatAck, HeartbeatReport, JobStatus, WorkerRegistration, WorkerStatus,
};

/// A job handed to this agent by `PollForJob`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub job_id: Uuid,
    pub command: String,
    pub file_url: String,
    pub filename: String,
    pub required_cpu: u32,
    pub required_ram_mb: u64,
    pub timeout_ms: u64,
    pub attempt: u32,
}

/// The coordinator calls an agent makes.
#[tonic::async_trait]
pub trait CoordinatorClient: Send + Sync + std::fmt::Debug {
    /// Returns the worker id the coordinator registered this agent under.
    async fn register(&self, registration: &WorkerRegistration) -> Result<String>;

    async fn heartbeat(&self, worker_id: &str, report: &HeartbeatReport) -> Result<HeartbeatAck>;

    async fn poll(&self, worker_id: &str) -> Result<Option<Assignment>>;

    /// Returns the status the job moved to.
    async fn submit_result(
        &self,
        worker_id: &str,
        job_id: Uuid,
        report: &ExecutionReport,
    ) -> Result<JobStatus>;

    /// Returns how many jobs the coordinator took back.
    async fn deregister(&self, worker_id: &str) -> Result<u32>;
}

/// [`CoordinatorClient`] over the `AgentService` gRPC API.
///
/// The channel connects lazily, so an unreachable coordinator surfaces as
/// an `UNAVAILABLE` status on each call instead of failing construction.
#[derive(Debug, Clone)]
pub struct GrpcCoordinatorClient {
    inner: AgentServiceClient<Channel>,
}

impl GrpcCoordinatorClient {
    pub fn new(addr: &str, request_timeout: Duration) -> Result<Self> {
        let endpoint = Endpoint::from_shared(addr.to_string())
            .map_err(|e| FleetError::InvalidArgument(format!("coordinator address {addr}: {e}")))?
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout);
        Ok(Self {
            inner: AgentServiceClient::new(endpoint.connect_lazy()),
        })
    }
}

#[tonic::async_trait]
impl CoordinatorClient for GrpcCoordinatorClient {
    async fn register(&self, registration: &WorkerRegistration) -> Result<String> {
        let response = self
            .inner
            .clone()
            .register_worker(RegisterWorkerRequest {
                worker_id: registration.worker_id.clone(),
                hostname: registration.hostname.clone(),
                os: registration.os.clone(),
                cpu_count: registration.cpu_count,
                ram_total_mb: registration.ram_total_mb,
                max_parallel_jobs: registration.max_parallel_jobs,
            })
            .await
            .map_err(FleetError::from_status)?;
        Ok(response.into_inner().worker_id)
    }

    async fn heartbeat(&self, worker_id: &str, report: &HeartbeatReport) -> Result<HeartbeatAck> {
        let response = self
            .inner
            .clone()
            .heartbeat(HeartbeatRequest {
                worker_id: worker_id.to_string(),
                cpu_usage_percent: report.cpu_usage_percent,
                ram_free_mb: report.ram_free_mb,
                ram_total_mb: report.ram_total_mb,
                status: worker_status_to_proto(report.status) as i32,
                running_job_ids: report.running_job_ids.iter().map(Uuid::to_string).collect(),
            })
            .await
            .map_err(FleetError::from_status)?
            .into_inner();

        Ok(HeartbeatAck {
            status: worker_status_from_proto(response.status).unwrap_or(WorkerStatus::Idle),
            revoked_job_ids: response
                .revoked_job_ids
                .iter()
                .filter_map(|id| Uuid::parse_str(id).ok())
                .collect(),
        })
    }

    async fn poll(&self, worker_id: &str) -> Result<Option<Assignment>> {
        let response = self
            .inner
            .clone()
            .poll_for_job(PollForJobRequest {
                worker_id: worker_id.to_string(),
            })
            .await
            .map_err(FleetError::from_status)?
            .into_inner();

        let Some(job) = response.job else {
            return Ok(None);
        };
        let job_id = Uuid::parse_str(&job.job_id).map_err(|e| {
            FleetError::Internal(format!("coordinator sent malformed job id {}: {e}", job.job_id))
        })?;
        Ok(Some(Assignment {
            job_id,
            command: job.command,
            file_url: job.file_url,
            filename: job.filename,
            required_cpu: job.required_cpu,
            required_ram_mb: job.required_ram_mb,
            timeout_ms: job.timeout_ms,
            attempt: job.attempt,
        }))
    }

    async fn submit_result(
        &self,
        worker_id: &str,
        job_id: Uuid,
        report: &ExecutionReport,
    ) -> Result<JobStatus> {
        let response = self
            .inner
            .clone()
            .submit_result(SubmitResultRequest {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
                stdout: report.stdout.clone(),
                stderr: report.stderr.clone(),
                exit_code: report.exit_code,
                elapsed_ms: report.elapsed_ms,
                timed_out: report.timed_out,
                error_message: report.error_message.clone().unwrap_or_default(),
            })
            .await
            .map_err(FleetError::from_status)?
            .into_inner();

        job_status_from_proto(response.status)
            .ok_or_else(|| FleetError::Internal("coordinator sent no job status".to_string()))
    }

    async fn deregister(&self, worker_id: &str) -> Result<u32> {
        let response = self
            .inner
            .clone()
            .deregister_worker(DeregisterWorkerRequest {
                worker_id: worker_id.to_string(),
            })
            .await
            .map_err(FleetError::from_status)?;
        Ok(response.into_inner().reclaimed_jobs)
    }
}
