pub mod agent;
pub mod clock;
pub mod config;
pub mod error;
pub mod grpc;
pub mod node;
pub mod registry;
pub mod sandbox;
pub mod scheduler;
pub mod shutdown;
pub mod store;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("taskfleet");
}
