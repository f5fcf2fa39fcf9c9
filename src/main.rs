//! bucketproxy -- HTTP front end for an S3-compatible object store.
//!
//! Configuration comes from an optional YAML file, then the environment,
//! then the command line. On SIGTERM/SIGINT the server stops accepting,
//! waits up to the shutdown timeout for in-flight requests, then exits.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use bucketproxy::config::{Config, StorageKind};
use bucketproxy::lifecycle::{self, ShutdownOutcome};
use bucketproxy::storage::aws::S3Store;
use bucketproxy::storage::backend::ObjectStore;
use bucketproxy::storage::memory::MemoryStore;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "bucketproxy",
    version,
    about = "HTTP proxy for S3-compatible object storage"
)]
struct Cli {
    /// Path to a YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = bucketproxy::config::load_config(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.server.addr = bind;
    }

    init_tracing(&config);
    match &cli.config {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("No configuration file given, using defaults and environment"),
    }

    if config.observability.metrics {
        bucketproxy::metrics::init_metrics()?;
        info!("Prometheus metrics initialized");
    }

    let store = build_store(&config).await?;
    let addr = config.server.addr.clone();
    let idle_timeout = config.server.idle_timeout;
    let grace = config.server.shutdown_timeout;

    let state = Arc::new(bucketproxy::AppState { config, store });
    let app = bucketproxy::server::app(state);

    let handle = lifecycle::start(&addr, app, idle_timeout).await?;

    let unexpected = tokio::select! {
        _ = lifecycle::shutdown_signal() => false,
        _ = handle.stopped() => {
            error!("Server stopped unexpectedly");
            true
        }
    };

    match handle.shutdown(grace).await? {
        ShutdownOutcome::Drained => info!("bucketproxy shut down"),
        ShutdownOutcome::Forced => info!("bucketproxy shut down, open connections were closed"),
    }

    if unexpected {
        anyhow::bail!("accept loop exited before shutdown was requested");
    }
    Ok(())
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let storage = &config.storage;
    match storage.backend {
        StorageKind::S3 => Ok(Arc::new(S3Store::new(storage).await?)),
        StorageKind::Memory => {
            let store = MemoryStore::with_buckets([storage.default_bucket.as_str()]).await;
            info!(
                "In-memory backend initialized with bucket {}",
                storage.default_bucket
            );
            Ok(Arc::new(store))
        }
    }
}
