//! Meshcap command-line client.
//!
//! Drives a headless session: a local video file stands in for the camera and
//! the converted mesh is either logged or downloaded to a directory.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/meshcap.toml, /etc/meshcap/client, `--config`)
//! 2. Environment variables (prefixed with MESHCAP__)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use meshcap_client::config::LoggingConfig;
use meshcap_client::job::JobStatus;
use meshcap_client::upload::http_client;
use meshcap_client::{
    ClientConfig, Command, DownloadViewer, HeadlessBackend, JobId, JobPoller, LogViewer,
    ModelFetcher, Recording, Session, Stage, Viewer, ViewerModel,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "meshcap", version, about = "Convert short videos into 3D meshes")]
struct Cli {
    /// Extra configuration file
    #[arg(short, long, env = "MESHCAP_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Upload a video file and wait for its mesh
    Convert {
        file: PathBuf,

        /// Session password
        #[arg(short, long, env = "MESHCAP_PASSWORD", default_value = "")]
        password: String,

        /// Download the mesh into this directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Wait for an existing conversion job
    Status {
        job_id: String,

        /// Download the mesh into this directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ClientConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    init_logging(&config.logging)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        api = %config.api.base_url,
        protocol = config.api.protocol.as_str(),
        "Starting meshcap client"
    );

    config.validate()?;

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let result = tokio::select! {
        result = run(cli.command, &config) => result,
        _ = shutdown_signal() => {
            warn!("Interrupted, abandoning conversion");
            Ok(())
        }
    };

    if let Err(e) = &result {
        error!(error = %e, "meshcap failed");
    }
    result
}

async fn run(command: CliCommand, config: &ClientConfig) -> Result<()> {
    match command {
        CliCommand::Convert {
            file,
            password,
            output,
        } => convert(config, &file, &password, output).await,
        CliCommand::Status { job_id, output } => status(config, JobId::new(job_id), output).await,
    }
}

/// Run a full session for a local video file.
async fn convert(config: &ClientConfig, file: &Path, password: &str, output: Option<PathBuf>) -> Result<()> {
    let video = Recording::from_file(file).await?;

    let viewer: Arc<dyn Viewer> = match output {
        Some(dir) => {
            let http = http_client(&config.api).context("Failed to build HTTP client")?;
            Arc::new(DownloadViewer::new(ModelFetcher::new(http), dir))
        }
        None => Arc::new(LogViewer),
    };

    let mut session = Session::from_config(config, Arc::new(HeadlessBackend), viewer)
        .context("Failed to build HTTP client")?;

    session.handle(Command::Unlock(password.to_string())).await?;
    session.handle(Command::SelectFile(video)).await?;
    session.handle(Command::Confirm).await?;

    // The download viewer never signals on failure; bound the wait once the job is done.
    let download_grace = config.api.request_timeout() + Duration::from_secs(5);

    loop {
        let snapshot = session.snapshot();
        if snapshot.model_loaded {
            break;
        }
        if snapshot.stage == Stage::Capturing {
            let reason = snapshot
                .notice
                .map(|n| n.message)
                .unwrap_or_else(|| "conversion aborted".to_string());
            bail!(reason);
        }

        let completed = snapshot
            .job
            .as_ref()
            .is_some_and(|job| job.status == JobStatus::Completed);
        if completed {
            tokio::time::timeout(download_grace, session.pump())
                .await
                .context("Model was converted but could not be loaded")?;
        } else {
            session.pump().await;
        }
    }

    if let Some(model) = session.model() {
        println!("{}", model.resolved_url);
    }
    session.close();
    Ok(())
}

/// Poll a job submitted earlier.
async fn status(config: &ClientConfig, job_id: JobId, output: Option<PathBuf>) -> Result<()> {
    let http = http_client(&config.api).context("Failed to build HTTP client")?;
    let poller = JobPoller::new(http.clone(), config.api.clone(), &config.polling);

    let model = poller.wait_for_result(&job_id, &CancellationToken::new()).await?;
    println!("{}", model.resolved_url);

    if let Some(dir) = output {
        let path = ModelFetcher::new(http)
            .download_to(&ViewerModel::from(&model), &dir)
            .await?;
        println!("{}", path.display());
    }
    Ok(())
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("meshcap={}", level).parse()?)
        .add_directive(format!("meshcap_client={}", level).parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=info".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port, "Prometheus metrics exporter started");
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
