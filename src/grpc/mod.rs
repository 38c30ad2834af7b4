pub mod client_service;
pub mod convert;
pub mod server;
pub mod worker_service;

pub use client_service::ClientService;
pub use server::GrpcServer;
pub use worker_service::WorkerService;
