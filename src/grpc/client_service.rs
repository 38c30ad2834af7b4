use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::grpc::convert::{
    job_status_from_proto, job_status_to_proto, job_to_info, parse_job_id, spec_from_request,
    worker_to_info,
};
use crate::proto::job_service_server::JobService;
use crate::proto::{
    CancelJobRequest, CancelJobResponse, GetJobStatusRequest, JobInfo, ListJobsRequest,
    ListJobsResponse, ListWorkersRequest, ListWorkersResponse, SubmitJobRequest,
    SubmitJobResponse,
};
use crate::registry::Registry;
use crate::scheduler::SchedulerHandle;

const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_PAGE_SIZE: usize = 1000;

/// gRPC service for client-facing API
pub struct ClientService {
    registry: Arc<Registry>,
    scheduler: SchedulerHandle,
}

impl ClientService {
    pub fn new(registry: Arc<Registry>, scheduler: SchedulerHandle) -> Self {
        Self {
            registry,
            scheduler,
        }
    }
}

#[tonic::async_trait]
impl JobService for ClientService {
    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<SubmitJobResponse>, Status> {
        let job = self
            .registry
            .submit_job(spec_from_request(request.into_inner()))?;
        self.scheduler.trigger();

        Ok(Response::new(SubmitJobResponse {
            job_id: job.job_id.to_string(),
            submitted_at_ms: job.submitted_at.timestamp_millis(),
        }))
    }

    async fn get_job_status(
        &self,
        request: Request<GetJobStatusRequest>,
    ) -> Result<Response<JobInfo>, Status> {
        let job_id = parse_job_id(&request.into_inner().job_id)?;
        let job = self.registry.job(&job_id)?;
        Ok(Response::new(job_to_info(&job)))
    }

    async fn cancel_job(
        &self,
        request: Request<CancelJobRequest>,
    ) -> Result<Response<CancelJobResponse>, Status> {
        let job_id = parse_job_id(&request.into_inner().job_id)?;
        let job = self.registry.cancel_job(&job_id)?;
        self.scheduler.trigger();

        Ok(Response::new(CancelJobResponse {
            status: job_status_to_proto(job.status) as i32,
        }))
    }

    async fn list_jobs(
        &self,
        request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let req = request.into_inner();

        // Parse pagination parameters
        let page_size = if req.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            (req.page_size as usize).min(MAX_PAGE_SIZE)
        };

        // Parse page token (offset-based: token is the starting index)
        let offset: usize = if req.page_token.is_empty() {
            0
        } else {
            req.page_token
                .parse()
                .map_err(|_| Status::invalid_argument("Invalid page token"))?
        };

        let all_jobs = match job_status_from_proto(req.status_filter) {
            Some(status) => self.registry.jobs_with_status(status)?,
            None => self.registry.jobs()?,
        };
        let total_count = all_jobs.len() as u32;

        // Apply pagination
        let jobs: Vec<JobInfo> = all_jobs
            .iter()
            .skip(offset)
            .take(page_size)
            .map(job_to_info)
            .collect();

        // Calculate next page token
        let next_offset = offset + jobs.len();
        let next_page_token = if next_offset < total_count as usize {
            next_offset.to_string()
        } else {
            String::new()
        };

        Ok(Response::new(ListJobsResponse {
            jobs,
            next_page_token,
            total_count,
        }))
    }

    async fn list_workers(
        &self,
        _request: Request<ListWorkersRequest>,
    ) -> Result<Response<ListWorkersResponse>, Status> {
        let workers = self.registry.workers()?;
        Ok(Response::new(ListWorkersResponse {
            workers: workers.iter().map(worker_to_info).collect(),
        }))
    }
}
