use std::sync::Arc;

use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::grpc::convert::{
    job_status_to_proto, job_to_assignment, parse_job_id, report_from_request,
    worker_status_from_proto, worker_status_to_proto,
};
use crate::proto::agent_service_server::AgentService;
use crate::proto::{
    DeregisterWorkerRequest, DeregisterWorkerResponse, HeartbeatRequest, HeartbeatResponse,
    PollForJobRequest, PollForJobResponse, RegisterWorkerRequest, RegisterWorkerResponse,
    SubmitResultRequest, SubmitResultResponse,
};
use crate::registry::{HeartbeatReport, Registry, WorkerRegistration, WorkerStatus};
use crate::scheduler::SchedulerHandle;

/// gRPC service called by worker agents
pub struct WorkerService {
    registry: Arc<Registry>,
    scheduler: SchedulerHandle,
}

impl WorkerService {
    pub fn new(registry: Arc<Registry>, scheduler: SchedulerHandle) -> Self {
        Self {
            registry,
            scheduler,
        }
    }
}

fn require_worker_id(worker_id: &str) -> Result<(), Status> {
    if worker_id.trim().is_empty() {
        return Err(Status::invalid_argument("worker_id is required"));
    }
    Ok(())
}

#[tonic::async_trait]
impl AgentService for WorkerService {
    async fn register_worker(
        &self,
        request: Request<RegisterWorkerRequest>,
    ) -> Result<Response<RegisterWorkerResponse>, Status> {
        let req = request.into_inner();
        let worker = self.registry.register_worker(WorkerRegistration {
            worker_id: req.worker_id,
            hostname: req.hostname,
            os: req.os,
            cpu_count: req.cpu_count,
            ram_total_mb: req.ram_total_mb,
            max_parallel_jobs: req.max_parallel_jobs,
        })?;
        self.scheduler.trigger();

        Ok(Response::new(RegisterWorkerResponse {
            worker_id: worker.worker_id,
            status: worker_status_to_proto(worker.status) as i32,
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        require_worker_id(&req.worker_id)?;

        let running_job_ids: Vec<Uuid> = req
            .running_job_ids
            .iter()
            .filter_map(|id| match Uuid::parse_str(id) {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::warn!(worker_id = %req.worker_id, job_id = %id, "Ignoring malformed running job id");
                    None
                }
            })
            .collect();

        let ack = self.registry.record_heartbeat(
            &req.worker_id,
            HeartbeatReport {
                cpu_usage_percent: req.cpu_usage_percent,
                ram_free_mb: req.ram_free_mb,
                ram_total_mb: req.ram_total_mb,
                status: worker_status_from_proto(req.status).unwrap_or(WorkerStatus::Idle),
                running_job_ids,
            },
        )?;
        self.scheduler.trigger();

        Ok(Response::new(HeartbeatResponse {
            status: worker_status_to_proto(ack.status) as i32,
            revoked_job_ids: ack.revoked_job_ids.iter().map(Uuid::to_string).collect(),
        }))
    }

    async fn poll_for_job(
        &self,
        request: Request<PollForJobRequest>,
    ) -> Result<Response<PollForJobResponse>, Status> {
        let req = request.into_inner();
        require_worker_id(&req.worker_id)?;

        let job = self.registry.poll_for_job(&req.worker_id)?;
        Ok(Response::new(PollForJobResponse {
            job: job.as_ref().map(job_to_assignment),
        }))
    }

    async fn submit_result(
        &self,
        request: Request<SubmitResultRequest>,
    ) -> Result<Response<SubmitResultResponse>, Status> {
        let req = request.into_inner();
        require_worker_id(&req.worker_id)?;
        let job_id = parse_job_id(&req.job_id)?;

        let job = self
            .registry
            .submit_result(&job_id, &req.worker_id, report_from_request(&req))?;
        self.scheduler.trigger();

        Ok(Response::new(SubmitResultResponse {
            status: job_status_to_proto(job.status) as i32,
        }))
    }

    async fn deregister_worker(
        &self,
        request: Request<DeregisterWorkerRequest>,
    ) -> Result<Response<DeregisterWorkerResponse>, Status> {
        let req = request.into_inner();
        require_worker_id(&req.worker_id)?;

        let reclaimed = self.registry.deregister_worker(&req.worker_id)?;
        self.scheduler.trigger();

        Ok(Response::new(DeregisterWorkerResponse {
            reclaimed_jobs: reclaimed.len() as u32,
        }))
    }
}
