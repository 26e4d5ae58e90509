use std::time::Duration;

use tracing::info;

use crate::commands::{build_coordinator, read_schema_file, read_url_file, spawn_workers, StatusView};
use crate::config::Config;
use crate::error::CliError;

pub struct SubmitArgs {
    pub job_id: String,
    pub file: String,
    pub schema: Option<String>,
}

/// Run one submission to completion: build a Coordinator and worker pool,
/// submit every URL in `file`, drain, then stop. Exits only once every
/// submitted task has reached a terminal state.
pub async fn run(config: &Config, args: SubmitArgs) -> Result<(), CliError> {
    let coordinator = build_coordinator(config, &args.job_id);

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
    info!("submitted {} request(s) for job {}", ids.len(), args.job_id);

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
