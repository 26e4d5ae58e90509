use std::time::Duration;

use tracing::info;

use crate::commands::{build_coordinator, read_schema_file, read_url_file, spawn_workers, StatusView};
use crate::config::Config;
use crate::error::CliError;

pub struct ResumeArgs {
    pub job_id: String,
    pub file: String,
    pub schema: Option<String>,
}

/// Resume a job: restore its fingerprint registry from the checkpoint, then
/// re-submit `file`. Fingerprints already marked complete are deduped away
/// silently, so only the work that did not finish before the previous
/// invocation stopped is actually re-enqueued. The queue itself is not
/// durable, so resuming means re-submitting against the restored dedup
/// state, not reattaching to an in-flight queue.
pub async fn run(config: &Config, args: ResumeArgs) -> Result<(), CliError> {
    let coordinator = build_coordinator(config, &args.job_id);
    coordinator.resume().await?;

    if let Some(schema_path) = &args.schema {
        let schema = read_schema_file(schema_path).await?;
        coordinator.set_schema(schema);
    }

    let requests = read_url_file(&args.file).await?;
    if requests.is_empty() {
        return Err(CliError::Usage(format!("{} contains no URLs", args.file)));
    }

    let workers = spawn_workers(config, coordinator.clone());
    let handles: Vec<_> = workers
        .into_iter()
        .map(|w| tokio::spawn(async move { w.run().await }))
        .collect();

    let ids = coordinator.submit_batch(requests).await?;
    info!(
        "resumed job {}: {} request(s) considered, duplicates already-completed skipped",
        args.job_id,
        ids.len()
    );

    coordinator.drain().await?;
    coordinator.stop(false).await?;

    coordinator.cancellation_token().cancel();
    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }

    let status = coordinator.status().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&StatusView::from(&status)).expect("status serializes")
    );
    Ok(())
}
