use harvest_common::model::JobStatus;
use harvest_core::checkpoint::CheckpointStore;
use tracing::info;

use crate::commands::raw_checkpoint_store;
use crate::config::Config;
use crate::error::CliError;

pub struct StopArgs {
    pub job_id: String,
    pub force: bool,
}

/// Mark a job completed (or, with `--force`, failed) on disk. See
/// `drain`'s doc comment: this process never holds the live Coordinator a
/// concurrently running `submit`/`resume` owns, so it can only record the
/// operator's intent for the next invocation rather than signal a running
/// one directly.
pub async fn run(config: &Config, args: StopArgs) -> Result<(), CliError> {
    let store = raw_checkpoint_store(config);
    let status = if args.force {
        JobStatus::Failed
    } else {
        JobStatus::Completed
    };
    store.set_status(&args.job_id, status).await?;
    store.snapshot(&args.job_id).await?;
    info!("job {} marked {:?}", args.job_id, status);
    Ok(())
}
