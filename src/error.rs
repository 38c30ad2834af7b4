use thiserror::Error;
use tonic::{Code, Status};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Unknown job: {0}")]
    UnknownJob(Uuid),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Execution timed out after {timeout_ms} ms")]
    ExecutionTimeout { timeout_ms: u64 },

    #[error("Worker {worker_id} unreachable (heartbeat timeout)")]
    AgentUnreachable { worker_id: String },

    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Whether an agent should retry the call that produced this error.
    ///
    /// Conflicts and unknown records are answers, not outages: the caller has
    /// to re-read the current state instead of repeating the request.
    pub fn is_transient(&self) -> bool {
        match self {
            FleetError::Transport(_) | FleetError::Io(_) => true,
            FleetError::Grpc(status) => matches!(
                status.code(),
                Code::Unavailable
                    | Code::DeadlineExceeded
                    | Code::ResourceExhausted
                    | Code::Internal
                    | Code::Unknown
                    | Code::Cancelled
            ),
            _ => false,
        }
    }

    /// Rebuild a domain error from a status returned by the coordinator.
    pub fn from_status(status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::NotFound if message.starts_with("Unknown worker: ") => {
                FleetError::UnknownWorker(strip(&message, "Unknown worker: "))
            }
            Code::NotFound => match message
                .strip_prefix("Unknown job: ")
                .and_then(|id| Uuid::parse_str(id).ok())
            {
                Some(job_id) => FleetError::UnknownJob(job_id),
                None => FleetError::Grpc(status),
            },
            Code::Aborted => FleetError::Conflict(strip(&message, "Conflict: ")),
            Code::FailedPrecondition => {
                FleetError::InvalidState(strip(&message, "Invalid state: "))
            }
            Code::InvalidArgument => {
                FleetError::InvalidArgument(strip(&message, "Invalid argument: "))
            }
            _ => FleetError::Grpc(status),
        }
    }
}

fn strip(message: &str, prefix: &str) -> String {
    message.strip_prefix(prefix).unwrap_or(message).to_string()
}

impl From<FleetError> for Status {
    fn from(err: FleetError) -> Self {
        let message = err.to_string();
        match err {
            FleetError::UnknownWorker(_) | FleetError::UnknownJob(_) => Status::not_found(message),
            FleetError::Conflict(_) => Status::aborted(message),
            FleetError::InvalidState(_) => Status::failed_precondition(message),
            FleetError::InvalidArgument(_) => Status::invalid_argument(message),
            FleetError::SandboxUnavailable(_) | FleetError::Transport(_) => {
                Status::unavailable(message)
            }
            FleetError::Grpc(status) => status,
            _ => Status::internal(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
