//! `tidewatch`: tails a MySQL binlog and projects row changes into an
//! Elasticsearch cluster through a configurable chain of enrichment stages.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use mimalloc_rust::GlobalMiMalloc;
use tracing::info;
use tracing_subscriber::EnvFilter;

// Recommended global allocator to get the best performance out of the
// pipeline's steady-state allocation pattern (one `IntermediateRow` clone per
// stage per row).
#[global_allocator]
static GLOBAL_MIMALLOC: GlobalMiMalloc = GlobalMiMalloc;

#[derive(Parser)]
#[command(name = "tidewatch", about = "CDC pipeline: MySQL binlog -> Elasticsearch")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reads both config files, runs until signaled, and exits.
    Run {
        /// Path to the program config (YAML: mysql/es/sources/data_dir).
        #[arg(long, default_value = "config.yaml")]
        config: PathBuf,

        /// Path to the projection config (JSON array of stage pipelines).
        #[arg(long, default_value = "projections.json")]
        projections: PathBuf,

        /// Maximum tracing log level.
        #[arg(long, default_value = "info")]
        log_level: String,
    },
}

fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let Command::Run {
        config,
        projections,
        log_level,
    } = cli.command;

    init_tracing(&log_level)?;

    let runtime = tokio::runtime::Runtime::new().wrap_err("failed to start the tokio runtime")?;
    let exit_code = runtime.block_on(run(config, projections))?;

    Ok(ExitCode::from(exit_code as u8))
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).wrap_err("invalid --log-level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn run(config_path: PathBuf, projections_path: PathBuf) -> Result<i32> {
    let config = config::Config::load(&config_path).wrap_err("failed to load program config")?;

    let supervisor = engine::Supervisor::wire(&config, &projections_path)
        .await
        .wrap_err("failed to wire the pipeline")?;

    let cancellation = supervisor.cancellation_token();
    let _ = tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining");
        cancellation.cancel();
    });

    let final_state = supervisor.run().await;
    info!(?final_state, "pipeline exited");

    Ok(final_state.exit_code())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
