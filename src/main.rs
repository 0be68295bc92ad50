//! rustrabbit: command-line front end for the queue client layer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rustrabbit::config::{self, RabbitConfig};
use rustrabbit::env::EnvOverrides;
use rustrabbit::rabbitmq::{
    dedup_queue, empty_queue, BatchConsumer, BatchOptions, ConnectionFactory, DedupOptions,
    Disposition, LogErrorSink, MemoryBroker, NoopStats, PublishRequest, Publisher,
    StatsRecorder, StreamConsumer, TracingStats, Worker,
};
use rustrabbit::{DeliveryMode, Message};

#[derive(Parser)]
#[command(name = "rustrabbit", about = "Publish, consume and maintain AMQP queues")]
struct Cli {
    /// Config file (defaults to ./rustrabbit.json, ./config/ or ~/.rustrabbit.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Run against an in-process broker instead of connection.uri
    #[arg(long, global = true)]
    memory: bool,
    /// Emit logs as JSON
    #[arg(long, global = true, env = "RUSTRABBIT_JSON_LOGS")]
    json_logs: bool,
    /// Record publish and consume counts as tracing events
    #[arg(long, global = true)]
    stats: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish a message to the exchange
    Publish {
        routing_key: String,
        body: String,
        /// Number of copies, each with its own message id
        #[arg(long, default_value_t = 1)]
        count: usize,
        #[arg(long)]
        transient: bool,
        /// Publish to this exchange instead of the configured one
        #[arg(long)]
        exchange: Option<String>,
        /// Publish on this task and wait for each confirmation
        #[arg(long)]
        sync: bool,
    },
    /// Stream-consume a queue until interrupted
    Consume {
        queue: String,
        /// Requeue messages whose body equals this value
        #[arg(long)]
        requeue_body: Option<String>,
    },
    /// Process a queue in batches
    Handle {
        queue: String,
        #[arg(long, default_value_t = 1)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        min_size: usize,
        /// Stop once the queue is empty
        #[arg(long)]
        drain: bool,
        #[arg(long, default_value_t = 1000)]
        sleep_ms: u64,
        /// Leave processed messages unacknowledged
        #[arg(long)]
        no_ack: bool,
    },
    /// Remove every ready message from a queue
    Purge { queue: String },
    /// Republish the distinct bodies of a queue and drop the rest
    Dedup {
        queue: String,
        #[arg(long)]
        routing_key: Option<String>,
        #[arg(long, default_value_t = 100_000)]
        limit: usize,
        #[arg(long)]
        transient: bool,
    },
    /// Acknowledge and discard everything arriving on a queue
    BlackHole { queue: String },
    /// Write a default config file
    InitConfig {
        #[arg(default_value = config::CONFIG_FILE_NAME)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    if let Command::InitConfig { path } = &cli.command {
        return config::create_default_config_file(path);
    }

    let config = load_config(cli.config.as_deref())?;
    let factory = if cli.memory {
        info!("using_memory_broker");
        ConnectionFactory::new(MemoryBroker::new().connector(), config.topology()?)
            .with_retry_delay(config.retry_delay())
    } else {
        config.connection_factory()?
    };
    let stats: Arc<dyn StatsRecorder> = if cli.stats {
        Arc::new(TracingStats)
    } else {
        Arc::new(NoopStats)
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown_requested");
            ctrl_c.cancel();
        }
    });

    run(cli.command, &config, &factory, stats, cancel).await
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().flatten_event(true)).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<RabbitConfig> {
    let mut config = match path {
        Some(path) => RabbitConfig::load_from(path)?,
        None => match config::find_config_file() {
            Ok(path) => RabbitConfig::load_from(&path)?,
            Err(e) => {
                warn!(error = %e, "config_file_missing_using_defaults");
                RabbitConfig::default()
            }
        },
    };
    let overrides = EnvOverrides::load().context("Invalid AMQP_* environment variable")?;
    overrides.apply(&mut config);
    config.validate()?;
    info!(
        exchange = %config.exchange.name,
        queues = config.queues.len(),
        worker_capacity = config.worker.capacity,
        prefetch_count = config.consumer.prefetch_count,
        "config_loaded"
    );
    Ok(config)
}

fn spawn_publisher(
    config: &RabbitConfig,
    factory: &ConnectionFactory,
    stats: Arc<dyn StatsRecorder>,
) -> Publisher {
    let worker = Worker::spawn(factory.manager(), config.worker_config(), Arc::new(LogErrorSink));
    Publisher::new(worker, config.exchange.name.clone()).with_stats(stats)
}

async fn run(
    command: Command,
    config: &RabbitConfig,
    factory: &ConnectionFactory,
    stats: Arc<dyn StatsRecorder>,
    cancel: CancellationToken,
) -> Result<()> {
    match command {
        Command::Publish {
            routing_key,
            body,
            count,
            transient,
            exchange,
            sync,
        } => {
            let publisher = spawn_publisher(config, factory, stats);
            let mode = if transient {
                DeliveryMode::Transient
            } else {
                DeliveryMode::Durable
            };
            let mut manager = factory.manager();
            for _ in 0..count {
                let message = Message::new(routing_key.as_str(), body.as_bytes())
                    .with_generated_id()
                    .with_delivery_mode(mode);
                let mut request = PublishRequest::new(message);
                if let Some(exchange) = &exchange {
                    request = request.to_exchange(exchange.as_str());
                }
                if sync {
                    let outcome = publisher.publish(&mut manager, request).await?;
                    info!(outcome = ?outcome, "publish_result");
                } else {
                    publisher.add_item(request).await?;
                }
            }
            publisher.worker().shutdown().await?;
            manager.close().await?;
            info!(count, routing_key = %routing_key, "publish_done");
        }
        Command::Consume {
            queue,
            requeue_body,
        } => {
            let mut consumer = StreamConsumer::new(factory.manager())
                .with_options(config.consume_options())
                .with_cancellation(cancel)
                .with_stats(stats);
            let summary = consumer
                .consume_items(&queue, |delivery| {
                    let requeue = requeue_body
                        .as_deref()
                        .is_some_and(|body| delivery.body == body.as_bytes());
                    async move {
                        println!("{}", delivery.body_str());
                        Ok(if requeue {
                            Disposition::Requeue
                        } else {
                            Disposition::Ack
                        })
                    }
                })
                .await?;
            consumer.close().await?;
            info!(acked = summary.acked, requeued = summary.requeued, "consume_done");
        }
        Command::Handle {
            queue,
            limit,
            min_size,
            drain,
            sleep_ms,
            no_ack,
        } => {
            let options = BatchOptions {
                ack: !no_ack,
                limit,
                min_size,
                drain,
                sleep_time: Duration::from_millis(sleep_ms),
            };
            let mut consumer = BatchConsumer::new(factory.manager())
                .with_cancellation(cancel)
                .with_stats(stats);
            let summary = consumer
                .handle_items(&queue, options, |items, _channel| async move {
                    for item in &items {
                        println!("{}", item.body_str());
                    }
                    Ok(())
                })
                .await?;
            consumer.close().await?;
            info!(batches = summary.batches, messages = summary.messages, "handle_done");
        }
        Command::Purge { queue } => {
            let mut manager = factory.manager();
            let purged = empty_queue(&mut manager, &queue).await?;
            manager.close().await?;
            println!("{}", purged);
        }
        Command::Dedup {
            queue,
            routing_key,
            limit,
            transient,
        } => {
            let publisher = spawn_publisher(config, factory, stats);
            let mut manager = factory.manager();
            let options = DedupOptions {
                routing_key,
                limit,
                delivery_mode: if transient {
                    DeliveryMode::Transient
                } else {
                    DeliveryMode::Durable
                },
            };
            let report = dedup_queue(&mut manager, &publisher, &queue, options).await?;
            publisher.worker().shutdown().await?;
            manager.close().await?;
            println!(
                "scanned {} unique {} republished {}",
                report.scanned, report.unique, report.republished
            );
        }
        Command::BlackHole { queue } => {
            let mut consumer = StreamConsumer::new(factory.manager())
                .with_options(config.consume_options())
                .with_cancellation(cancel)
                .with_stats(stats);
            let summary = consumer.black_hole(&queue).await?;
            consumer.close().await?;
            info!(discarded = summary.acked, "black_hole_done");
        }
        Command::InitConfig { path } => config::create_default_config_file(&path)?,
    }
    Ok(())
}
