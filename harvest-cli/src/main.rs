//! Reference process hosting a Coordinator plus one or more in-process
//! `WorkerLoop`s for one invocation's worth of work, the same
//! "construct from env config, spawn a metrics server alongside, run" shape
//! `hook-worker`'s own `main` uses.

mod commands;
mod config;
mod error;
mod fetcher;
mod sink;

use std::future::ready;
use std::process::ExitCode;

use axum::routing::get;
use axum::Router;
use clap::{Parser, Subcommand};
use envconfig::Envconfig;
use harvest_common::health::HealthRegistry;
use harvest_common::metrics::{serve, setup_metrics_router};

use crate::commands::{drain, resume, status, stop, submit};
use crate::config::Config;
use crate::error::CliError;

#[derive(Parser)]
#[command(name = "harvest", about = "Distributed crawl execution substrate")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a batch of URLs to a job and run it to completion.
    Submit {
        #[arg(long)]
        job: String,
        #[arg(long)]
        file: String,
        #[arg(long)]
        schema: Option<String>,
    },
    /// Report a job's checkpointed progress.
    Status {
        #[arg(long)]
        job: String,
    },
    /// Resume a job from its checkpoint, re-submitting a URL file.
    Resume {
        #[arg(long)]
        job: String,
        #[arg(long)]
        file: String,
        #[arg(long)]
        schema: Option<String>,
    },
    /// Mark a job paused.
    Drain {
        #[arg(long)]
        job: String,
    },
    /// Mark a job stopped.
    Stop {
        #[arg(long)]
        job: String,
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = match Config::init_from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };

    let liveness = HealthRegistry::new("liveness");
    let handle = liveness
        .register("cli".to_owned(), time::Duration::seconds(60))
        .await;
    handle.report_healthy().await;

    let router = Router::new().route("/_readiness", get(|| ready("ok")));
    let router = setup_metrics_router().merge(router);
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            tracing::warn!("metrics server stopped: {e}");
        }
    });

    match run(&config, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(config: &Config, command: Command) -> Result<(), CliError> {
    match command {
        Command::Submit { job, file, schema } => {
            submit::run(config, submit::SubmitArgs { job_id: job, file, schema }).await
        }
        Command::Status { job } => status::run(config, status::StatusArgs { job_id: job }).await,
        Command::Resume { job, file, schema } => {
            resume::run(config, resume::ResumeArgs { job_id: job, file, schema }).await
        }
        Command::Drain { job } => drain::run(config, drain::DrainArgs { job_id: job }).await,
        Command::Stop { job, force } => {
            stop::run(config, stop::StopArgs { job_id: job, force }).await
        }
    }
}
