//! The HTTP-based frontend for the czar.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use tracing::{info, warn};

use czar::config::CzarConfig;
use czar::http_svc::CzarHttpSvc;

#[derive(Parser)]
#[command(about = "The HTTP-based czar frontend.")]
struct Args {
    /// The name of this czar frontend. Assign a unique name to each czar.
    #[arg(long, default_value = "http")]
    czar_name: String,

    /// The configuration file.
    #[arg(long, default_value = "/config-etc/qserv-czar.toml")]
    config: Utf8PathBuf,

    /// HTTP/HTTPS port of the REST API.
    #[arg(long, default_value_t = 4048)]
    port: u16,

    /// The number of the request processing threads in the REST service.
    /// Zero value is not allowed.
    #[arg(long, default_value_t = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))]
    threads: usize,

    /// A size of a thread pool for pushing table contributions to workers
    /// over the synchronous HTTP protocol. Zero value is not allowed.
    #[arg(long, default_value_t = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))]
    worker_ingest_threads: usize,

    /// The SSL/TLS certificate file.
    #[arg(long, default_value = "/config-etc/ssl/czar-cert.pem")]
    ssl_cert_file: Utf8PathBuf,

    /// The SSL/TLS private key file.
    #[arg(long, default_value = "/config-etc/ssl/czar-key.pem")]
    ssl_private_key_file: Utf8PathBuf,

    /// The temporary directory for the service.
    #[arg(long)]
    tmp_dir: Option<Utf8PathBuf>,

    /// A size of the database connection pool serving the query result
    /// extraction. The default value 0 leaves the pool sizing to the
    /// driver.
    #[arg(long, default_value_t = 0)]
    conn_pool_size: u32,

    /// Produce verbose output.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    anyhow::ensure!(args.threads > 0, "the number of threads must be greater than zero");
    anyhow::ensure!(
        args.worker_ingest_threads > 0,
        "the number of worker ingest threads must be greater than zero"
    );

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let mut config: CzarConfig = toml::from_str(
        &std::fs::read_to_string(&args.config)
            .with_context(|| format!("failed to read the configuration file '{}'", args.config))?,
    )
    .with_context(|| format!("failed to parse the configuration file '{}'", args.config))?;
    if let Some(tmp_dir) = &args.tmp_dir {
        config.tmp_dir = tmp_dir.clone();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.threads)
        .enable_all()
        .build()
        .context("failed to initialize the runtime")?;
    runtime.block_on(serve(args, config))
}

async fn serve(args: Args, config: CzarConfig) -> anyhow::Result<()> {
    // TLS is terminated in front of the service in the current
    // deployment model; the certificate options are accepted for
    // compatibility with the production launcher.
    if args.ssl_cert_file.exists() || args.ssl_private_key_file.exists() {
        warn!("TLS termination is delegated to the ingress; the SSL options are not used");
    }

    let config = Arc::new(config);
    let svc = CzarHttpSvc::new(
        config.clone(),
        &args.czar_name,
        args.worker_ingest_threads,
        args.conn_pool_size as usize,
        qhttp::ServerConfig {
            bind_addr: "0.0.0.0".to_owned(),
            port: args.port,
            request_timeout: Duration::from_secs(config.request_timeout_sec.max(1) as u64),
            ..qhttp::ServerConfig::default()
        },
    )
    .context("failed to configure the HTTP service")?;

    svc.start().await.context("failed to start the HTTP service")?;
    info!(
        czar = %args.czar_name,
        port = svc.port(),
        "the query processing service of the czar is ready"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for the shutdown signal")?;
    info!("shutting down");
    svc.stop();
    Ok(())
}
