pub mod ledger;
pub mod manager;
pub mod queue;

pub use ledger::*;
pub use manager::*;
pub use queue::*;

use atelier_types::{ErrorCode, ErrorDetails, ErrorPayload, WorkerType};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is at capacity ({max} workers)")]
    AtCapacity { max: usize },
    #[error("insufficient resources for {worker_type:?} worker")]
    InsufficientResources { worker_type: WorkerType },
    #[error("failed to start worker {worker_id}: {reason}")]
    SpawnFailed { worker_id: String, reason: String },
    #[error("unknown worker '{worker_id}'")]
    UnknownWorker { worker_id: String },
    #[error(transparent)]
    Store(#[from] atelier_store::StoreError),
}

impl PoolError {
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            PoolError::InsufficientResources { worker_type } => {
                ErrorPayload::new(ErrorCode::InsufficientResources, self.to_string()).with_details(
                    ErrorDetails {
                        resource_type: Some(worker_type.as_str().to_string()),
                        ..ErrorDetails::default()
                    },
                )
            }
            other => ErrorPayload::new(ErrorCode::DispatchError, other.to_string()),
        }
    }
}
