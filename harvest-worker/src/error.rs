use thiserror::Error;

/// Enumeration of errors related to running a worker loop against a
/// Coordinator.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("coordinator error: {0}")]
    Coordinator(#[from] harvest_core::coordinator::CoordinatorError),
}
