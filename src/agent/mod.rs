//! Worker agent runtime.
//!
//! An agent offers its host's CPU and RAM to the coordinator:
//! - **Registration**: once at startup, retried with backoff; the assigned
//!   worker id is persisted under the state directory
//! - **Heartbeat**: host metrics and sandbox health on a fixed interval
//! - **Polling**: only while a parallelism slot is free; a slot stays taken
//!   until the job's result has been accepted
//! - **Execution**: fresh workspace, artifact fetch, sandboxed run,
//!   unconditional workspace removal, result report retried with backoff
//!
//! [`AgentRuntime::run`] drives all of it until shutdown, then drains
//! in-flight jobs and deregisters.

pub mod artifact;
pub mod backoff;
pub mod client;
pub mod execute;
pub mod heartbeat;
pub mod metrics;
pub mod runtime;
pub mod workspace;

pub use artifact::{ArtifactError, ArtifactFetcher};
pub use backoff::Backoff;
pub use client::{Assignment, CoordinatorClient, GrpcCoordinatorClient};
pub use execute::JobRunner;
pub use runtime::AgentRuntime;
pub use workspace::Workspace;
