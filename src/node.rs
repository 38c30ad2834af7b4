use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::grpc::GrpcServer;
use crate::registry::Registry;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::store::{FileStore, MemoryStore, Store};

/// The central coordinator: registry over the configured store, the
/// scheduler loop, and the gRPC API for agents and clients.
pub struct CoordinatorNode {
    config: CoordinatorConfig,
    registry: Arc<Registry>,
    scheduler: Scheduler,
}

impl CoordinatorNode {
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CoordinatorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let store: Arc<dyn Store> = match &config.state_file {
            Some(path) => {
                let store = FileStore::open(path)?;
                tracing::info!(path = %path.display(), "Using file store");
                Arc::new(store)
            }
            None => {
                tracing::warn!("No state file configured, state is kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Self::with_store(config, store, clock)
    }

    pub fn with_store(
        config: CoordinatorConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let registry = Arc::new(Registry::open(
            store,
            clock,
            config.retry.clone(),
            config.job_defaults.clone(),
        )?);
        let scheduler = Scheduler::new(registry.clone(), config.scheduler.clone());
        Ok(Self {
            config,
            registry,
            scheduler,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn scheduler_handle(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    /// Serve on the configured address until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` fires.
    ///
    /// The scheduler loop runs alongside the server and stops with it.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let server = GrpcServer::new(self.registry.clone(), self.scheduler.handle());
        let scheduler_shutdown = shutdown.child_token();
        let scheduler = tokio::spawn(self.scheduler.run(scheduler_shutdown.clone()));

        let served = server.run_with_listener(listener, shutdown).await;

        scheduler_shutdown.cancel();
        if let Err(e) = scheduler.await {
            tracing::error!(error = %e, "Scheduler task panicked");
        }
        served?;
        tracing::info!("Coordinator stopped");
        Ok(())
    }
}
