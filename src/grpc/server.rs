use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Router;
use tonic::transport::Server;

use crate::grpc::client_service::ClientService;
use crate::grpc::worker_service::WorkerService;
use crate::proto::agent_service_server::AgentServiceServer;
use crate::proto::job_service_server::JobServiceServer;
use crate::registry::Registry;
use crate::scheduler::SchedulerHandle;

pub struct GrpcServer {
    registry: Arc<Registry>,
    scheduler: SchedulerHandle,
}

impl GrpcServer {
    pub fn new(registry: Arc<Registry>, scheduler: SchedulerHandle) -> Self {
        Self {
            registry,
            scheduler,
        }
    }

    fn router(self) -> Router {
        let worker_service = WorkerService::new(self.registry.clone(), self.scheduler.clone());
        let client_service = ClientService::new(self.registry, self.scheduler);

        Server::builder()
            .add_service(AgentServiceServer::new(worker_service))
            .add_service(JobServiceServer::new(client_service))
    }

    /// Serve on `addr` until `shutdown` fires.
    pub async fn run(
        self,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        tracing::info!(addr = %addr, "Starting gRPC server");
        self.router()
            .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
            .await
    }

    /// Serve on an already bound listener (port 0 in tests).
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "Starting gRPC server");
        }
        self.router()
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await
    }
}
