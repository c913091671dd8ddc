//! The HTTP frontend of the worker ingest/export services.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use tracing::info;

use worker::config::WorkerConfig;
use worker::db::DatabaseServices;
use worker::http_svc::WorkerHttpSvc;

#[derive(Parser)]
#[command(about = "The HTTP-based frontend of the worker ingest and export services.")]
struct Args {
    /// The configuration file.
    #[arg(long, default_value = "/config-etc/qserv-worker.toml")]
    config: Utf8PathBuf,

    /// HTTP port of the REST API.
    #[arg(long, default_value_t = 25004)]
    port: u16,

    /// The number of the request processing threads in the REST service.
    /// Zero value is not allowed.
    #[arg(long, default_value_t = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))]
    threads: usize,

    /// Override the temporary directory of the loader and the exporter.
    #[arg(long)]
    tmp_dir: Option<Utf8PathBuf>,

    /// Request processing timeout.
    #[arg(long, default_value_t = 300)]
    request_timeout_sec: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    anyhow::ensure!(args.threads > 0, "the number of threads must be greater than zero");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config: WorkerConfig = toml::from_str(
        &std::fs::read_to_string(&args.config)
            .with_context(|| format!("failed to read the configuration file '{}'", args.config))?,
    )
    .with_context(|| format!("failed to parse the configuration file '{}'", args.config))?;
    if let Some(tmp_dir) = &args.tmp_dir {
        config.loader_tmp_dir = tmp_dir.clone();
        config.exporter_tmp_dir = tmp_dir.clone();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.threads)
        .enable_all()
        .build()
        .context("failed to initialize the runtime")?;
    runtime.block_on(serve(args, config))
}

async fn serve(args: Args, config: WorkerConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let db = Arc::new(
        DatabaseServices::new(&config.db_url, &config.replica_db)
            .context("failed to initialize the database services")?,
    );

    let svc = WorkerHttpSvc::new(
        config.clone(),
        db.clone(),
        qhttp::ServerConfig {
            bind_addr: "0.0.0.0".to_owned(),
            port: args.port,
            request_timeout: Duration::from_secs(args.request_timeout_sec.max(1)),
            ..qhttp::ServerConfig::default()
        },
    )
    .context("failed to configure the HTTP service")?;

    svc.start().await.context("failed to start the HTTP service")?;
    info!(
        worker = %config.name,
        port = svc.port(),
        "the worker ingest service is ready"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for the shutdown signal")?;
    info!("shutting down");
    svc.stop();
    Ok(())
}
