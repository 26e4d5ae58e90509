use thiserror::Error;

/// Top-level CLI error taxonomy, mapped to the process exit codes in `main`.
#[derive(Error, Debug)]
pub enum CliError {
    #[error("usage error: {0}")]
    Usage(String),
    #[error(transparent)]
    Coordinator(#[from] harvest_core::coordinator::CoordinatorError),
    #[error(transparent)]
    Checkpoint(#[from] harvest_core::checkpoint::CheckpointError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse schema: {0}")]
    BadSchema(String),
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Usage(_) | CliError::BadSchema(_) => 1,
            CliError::Checkpoint(_) => 3,
            CliError::Coordinator(harvest_core::coordinator::CoordinatorError::CheckpointCorrupt(_)) => 3,
            CliError::Coordinator(_) | CliError::Io(_) => 2,
        }
    }
}
