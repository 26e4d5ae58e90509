use harvest_common::model::JobStatus;
use harvest_core::checkpoint::CheckpointStore;
use tracing::info;

use crate::commands::raw_checkpoint_store;
use crate::config::Config;
use crate::error::CliError;

pub struct DrainArgs {
    pub job_id: String,
}

/// Mark a job as paused on disk. `submit`/`resume` each own a Coordinator
/// for the lifetime of one process and drain it themselves before
/// exiting, so a standalone `drain` has no live Coordinator to signal;
/// it records operator intent in the checkpoint so the next `resume`
/// starts from a known state.
pub async fn run(config: &Config, args: DrainArgs) -> Result<(), CliError> {
    let store = raw_checkpoint_store(config);
    store.set_status(&args.job_id, JobStatus::Paused).await?;
    store.snapshot(&args.job_id).await?;
    info!("job {} marked paused", args.job_id);
    Ok(())
}
