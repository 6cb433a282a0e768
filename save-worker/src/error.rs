use save_common::pgqueue;
use save_common::store::StoreError;
use thiserror::Error;

/// Errors surfaced while running one save event through the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Whether the failed step could succeed if attempted again later.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Store(error) => error.is_transient(),
        }
    }
}

/// Enumeration of errors related to initialization and consumption of save jobs.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred when interacting with the queue")]
    QueueError(#[from] pgqueue::DatabaseError),
}
