use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use genserve::logging::{setup_logging, setup_worker_logging};
use genserve::{DispatcherHandle, Services, StopReason};
use genserve_config::AppConfig;
use log::{error, info};

/// Image and video generation service
#[derive(Parser)]
#[command(name = "genserve")]
#[command(version, about, long_about = None)]
struct Cli {
    /// JSON config file (default: $GENSERVE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// HTTP API, task dispatcher and model scheduler in one process
    Serve,
    /// HTTP API only; tasks are run by a separate `dispatch` process
    Api,
    /// Task dispatcher and model scheduler only
    Dispatch,
    /// Model worker process (spawned by the scheduler)
    #[command(hide = true)]
    Worker,
}

fn main() {
    let cli = Cli::parse();

    // The worker speaks frames on stdout and must not start a runtime.
    if matches!(cli.command, Commands::Worker) {
        let level = std::env::var("GENSERVE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        if let Err(e) = setup_worker_logging(&level) {
            eprintln!("[WORKER] failed to set up logging: {e}");
        }
        std::process::exit(genserve_worker::run_worker());
    }

    if let Err(e) = run(cli) {
        error!("{e:#}");
        eprintln!("genserve: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .or_else(|| std::env::var_os("GENSERVE_CONFIG").map(PathBuf::from));
    let config = AppConfig::load(config_path.as_deref()).context("cannot load configuration")?;

    if let Err(e) = setup_logging(&config.log_dir, &config.log_level) {
        eprintln!("Failed to set up logging: {e:#}");
    }
    info!(
        "[CONFIG] genserve {} starting ({})",
        env!("CARGO_PKG_VERSION"),
        config_path
            .as_deref()
            .map_or_else(|| "defaults + environment".to_string(), |p| p.display().to_string())
    );

    let services = Services::open(config)?;
    let runtime = tokio::runtime::Runtime::new().context("cannot start async runtime")?;

    match cli.command {
        Commands::Serve => {
            let scheduler = services.scheduler()?;
            let dispatcher = services.dispatcher(scheduler.clone())?.start()?;
            let state = services.api_state(Some(scheduler));
            // the API goes down with the consumer so a supervisor can restart both
            let served = runtime.block_on(serve_api(
                &services,
                state,
                stop_reason(dispatcher.until_stopped(shutdown_signal())),
            ));
            let stopped = stop_dispatcher(&runtime, dispatcher);
            served.and(stopped)
        }
        Commands::Api => {
            let state = services.api_state(None);
            runtime.block_on(serve_api(&services, state, shutdown_signal()))
        }
        Commands::Dispatch => {
            let scheduler = services.scheduler()?;
            let dispatcher = services.dispatcher(scheduler)?.start()?;
            runtime.block_on(stop_reason(dispatcher.until_stopped(shutdown_signal())));
            stop_dispatcher(&runtime, dispatcher)
        }
        Commands::Worker => Ok(()),
    }
}

async fn serve_api<F>(services: &Services, state: Arc<genserve_web::AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let addr: SocketAddr = services
        .config
        .bind_address()
        .parse()
        .with_context(|| format!("invalid bind address {}", services.config.bind_address()))?;
    genserve_web::serve(state, addr, shutdown)
        .await
        .context("HTTP server failed")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn stop_reason(wait: impl Future<Output = StopReason>) {
    if wait.await == StopReason::ConsumerExited {
        info!("[DISPATCHER] shutting down after consumer exit");
    }
}

/// Joining waits for the in-flight task, so keep it off the runtime.
fn stop_dispatcher(runtime: &tokio::runtime::Runtime, dispatcher: DispatcherHandle) -> Result<()> {
    runtime
        .block_on(tokio::task::spawn_blocking(move || dispatcher.stop()))
        .context("dispatcher shutdown task failed")?
}
