pub mod eta;
pub mod model;
pub mod preview;
pub mod stages;
pub mod tracker;

pub use eta::*;
pub use model::*;
pub use preview::*;
pub use stages::*;
pub use tracker::*;

use atelier_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("no progress record for task '{task_id}'")]
    NotFound { task_id: String },
    #[error("invalid stage {index} for task '{task_id}' ({total} stages)")]
    InvalidStage {
        task_id: String,
        index: usize,
        total: usize,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}
