//! Order-book loader service
//!
//! Runs one instrument instance: consumes its Kafka topic partition and
//! loads every snapshot into Postgres until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use orderbook_loader::IngestionLoop;
use orderbook_loader::queue::kafka::KafkaConsumer;
use orderbook_loader::store::postgres::PgSession;
use services_common::{DEFAULT_CONFIG_PATH, LoaderConfig};
use std::path::Path;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "orderbook-loader";

/// Order-book snapshot loader
#[derive(Parser)]
#[clap(name = "orderbook-loader")]
#[clap(about = "Loads streamed order-book snapshots into day-partitioned Postgres tables")]
struct Cli {
    /// Instance section of the config file (e.g. upbit_btc)
    instance: String,

    /// Config file
    #[clap(long, short = 'c', default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Also write logs to <DIR>/<INSTANCE>.log
    #[clap(long)]
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli.instance, cli.log_dir.as_deref().map(Path::new))?;

    info!("Starting {} v{} for {}", SERVICE_NAME, env!("CARGO_PKG_VERSION"), cli.instance);

    let config = LoaderConfig::from_file(&cli.config, &cli.instance)
        .with_context(|| format!("loading instance '{}' from {}", cli.instance, cli.config))?;
    info!("Configuration: {:?}", config);

    let session = PgSession::connect(&config.database_url)
        .await
        .context("connecting to Postgres")?;
    let consumer = KafkaConsumer::new(&config).context("creating Kafka consumer")?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, stopping after the current cycle");
                let _ = signal_tx.send(());
            }
            Err(e) => error!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    let mut pipeline = IngestionLoop::new(&config, consumer, session);
    pipeline.run(shutdown_rx).await;
    drop(shutdown_tx);

    info!("{} shut down", SERVICE_NAME);
    Ok(())
}

/// Initialize tracing; the returned guard flushes the log file on drop
fn init_tracing(instance: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, format!("{instance}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let default_filter = format!(
        "{}=info,services_common=info",
        SERVICE_NAME.replace('-', "_")
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_thread_ids(true),
        )
        .with(file_layer)
        .init();

    Ok(guard)
}
