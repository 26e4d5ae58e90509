use harvest_core::checkpoint::CheckpointStore;

use crate::commands::raw_checkpoint_store;
use crate::config::Config;
use crate::error::CliError;

pub struct StatusArgs {
    pub job_id: String,
}

/// Report a job's on-disk checkpoint state. The priority queue is not
/// durable across invocations, so outside of a live `submit`/`resume` run,
/// status is reported from the checkpoint alone: completed/failed counts
/// and the last known job status, without pending/leased counts.
pub async fn run(config: &Config, args: StatusArgs) -> Result<(), CliError> {
    let store = raw_checkpoint_store(config);
    let snapshot = store.load(&args.job_id).await?;

    #[derive(serde::Serialize)]
    struct CheckpointView {
        job_id: String,
        completed: usize,
        failed: usize,
        total_requests: u64,
        last_persisted_at: chrono::DateTime<chrono::Utc>,
        job_status: String,
    }

    let view = CheckpointView {
        job_id: snapshot.job_id,
        completed: snapshot.completed.len(),
        failed: snapshot.failed.len(),
        total_requests: snapshot.total_requests,
        last_persisted_at: snapshot.last_persisted_at,
        job_status: format!("{:?}", snapshot.status),
    };
    println!("{}", serde_json::to_string_pretty(&view).expect("status serializes"));
    Ok(())
}
