//! CLI for qrelay
//!
//! Subcommands:
//! - `produce`: read names from stdin and publish them to RabbitMQ
//! - `consume`: print names from RabbitMQ as they arrive
//! - `loopback`: both at once over the in-process broker (no RabbitMQ needed)

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use qrelay::broker::{AmqpConnector, Connector, MemoryBroker};
use qrelay::config::{Settings, load_config};
use qrelay::connection::ConnectionManager;
use qrelay::consumer::{ConsumerConfig, ConsumerLoop, PrintHandler};
use qrelay::publisher::{PromptedInput, Publisher, PublisherConfig};
use qrelay::utils::logging;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "qrelay", version, about = "Durable first-name relay over a broker queue")]
struct Cli {
    /// Extra configuration file layered over config/default.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set (overrides log.level)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish names typed on stdin until the stop word is entered
    Produce,
    /// Consume and print names until Ctrl-C
    Consume,
    /// Run producer and consumer in one process over the in-process broker
    Loopback,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let settings = match load_config(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Logging is not configured yet.
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(cli.log_level.as_deref().unwrap_or(&settings.log.level));

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received. Exiting gracefully.");
            on_signal.cancel();
        }
    });

    let result = match cli.command {
        Command::Produce => run_producer(&settings, amqp(&settings), shutdown).await,
        Command::Consume => run_consumer(&settings, amqp(&settings), shutdown).await,
        Command::Loopback => run_loopback(&settings, shutdown).await,
    };

    if let Err(e) = result {
        error!("qrelay failed: {}", e);
        std::process::exit(1);
    }
}

fn amqp(settings: &Settings) -> Arc<dyn Connector> {
    Arc::new(AmqpConnector::new(settings.broker.connect_timeout()))
}

fn manager(settings: &Settings, connector: Arc<dyn Connector>) -> ConnectionManager {
    ConnectionManager::new(
        connector,
        settings.broker.endpoint(),
        settings.retry.policy(),
    )
}

async fn run_producer(
    settings: &Settings,
    connector: Arc<dyn Connector>,
    shutdown: CancellationToken,
) -> Result<(), BoxError> {
    let publisher = Publisher::new(manager(settings, connector), PublisherConfig::from(settings));
    let mut input = PromptedInput::stdio(settings.publisher.stop_word.clone());

    let report = publisher.run(&mut input, shutdown).await?;
    info!(
        published = report.published,
        rejected = report.rejected,
        lost = report.lost,
        "Publisher finished"
    );
    Ok(())
}

async fn run_consumer(
    settings: &Settings,
    connector: Arc<dyn Connector>,
    shutdown: CancellationToken,
) -> Result<(), BoxError> {
    let consumer = ConsumerLoop::new(
        manager(settings, connector),
        ConsumerConfig::from(settings),
        Arc::new(PrintHandler),
    );

    let report = consumer.run(shutdown).await?;
    info!(
        acknowledged = report.acknowledged,
        dropped = report.dropped,
        rejected = report.rejected,
        "Consumer finished"
    );
    Ok(())
}

async fn run_loopback(
    settings: &Settings,
    shutdown: CancellationToken,
) -> Result<(), BoxError> {
    let broker: Arc<dyn Connector> = Arc::new(MemoryBroker::new());

    let consumer_stop = shutdown.child_token();
    let consumer = {
        let settings = settings.clone();
        let connector = broker.clone();
        let stop = consumer_stop.clone();
        tokio::spawn(async move { run_consumer(&settings, connector, stop).await })
    };

    let produced = run_producer(settings, broker, shutdown).await;

    // Whatever was published is already in flight to the consumer; let it
    // settle before stopping.
    consumer_stop.cancel();
    match consumer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Consumer failed: {}", e),
        Err(e) => warn!("Consumer task failed: {}", e),
    }
    produced
}
