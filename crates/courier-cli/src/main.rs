use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use courier_core::domain::{MESSAGE_TYPE_ATTRIBUTE, Message, OutgoingMessage, ProcessingOutcome};
use courier_core::impls::{
    InMemoryDeadLetterSink, InMemoryQueue, QueueDeadLetterSink, RetryConfig, RetryingQueueClient,
    SqsQueueClient, load_sdk_config,
};
use courier_core::ports::QueueClient;
use courier_core::typed::{Matcher, batch_fn, handler_fn};
use courier_core::{Consumer, ConsumerConfig, Producer, ReceivePolicy, setup_logging};

#[derive(Parser)]
#[command(name = "courier", about = "SQS consumer / producer")]
struct Cli {
    /// JSON config file. Without it the COURIER_* environment variables are used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// In-process queue: send messages, consume them, print the stats.
    Demo {
        #[arg(long, default_value_t = 100)]
        messages: usize,
        /// Every n-th message fails once before succeeding.
        #[arg(long, default_value_t = 10)]
        flaky_every: usize,
        #[arg(long, default_value = "overlap")]
        policy: ReceivePolicy,
    },
    /// Send messages to the configured queue.
    Send {
        body: String,
        #[arg(long)]
        message_type: Option<String>,
        /// key=value, repeatable
        #[arg(long = "attribute", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,
        /// Message group (FIFO queues).
        #[arg(long)]
        group: Option<String>,
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Consume the configured queue until Ctrl-C.
    Consume,
    /// Create a queue and print its URL. Names ending in `.fifo` get a FIFO queue.
    CreateQueue {
        name: String,
        #[arg(long, env = "COURIER_REGION")]
        region: Option<String>,
        #[arg(long, env = "COURIER_ENDPOINT_URL")]
        endpoint_url: Option<String>,
    },
}

fn parse_attribute(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ConsumerConfig> {
    let config = match path {
        Some(path) => ConsumerConfig::from_json_file(path)?,
        None => ConsumerConfig::from_env()?,
    };
    Ok(config)
}

/// SQS client for the configured queue, with adapter-level retries.
async fn sqs_queue(config: &ConsumerConfig) -> Arc<dyn QueueClient> {
    let sqs = SqsQueueClient::from_config(config).await;
    Arc::new(RetryingQueueClient::new(sqs, RetryConfig::default()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env は任意
    let _ = dotenvy::dotenv();
    setup_logging();

    let cli = Cli::parse();
    match cli.command {
        Command::Demo {
            messages,
            flaky_every,
            policy,
        } => demo(messages, flaky_every, policy).await,
        Command::Send {
            body,
            message_type,
            attributes,
            group,
            count,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let mut outgoing =
                OutgoingMessage::new(body).with_attributes(attributes.into_iter().collect());
            if let Some(message_type) = message_type {
                outgoing = outgoing.with_attribute(MESSAGE_TYPE_ATTRIBUTE, message_type);
            }
            if let Some(group) = group {
                outgoing = outgoing.with_group(group);
            }
            let producer = Producer::new(sqs_queue(&config).await);
            let ids = producer
                .send_many(vec![outgoing; count])
                .await
                .context("sending messages")?;
            for id in ids {
                println!("{id}");
            }
            Ok(())
        }
        Command::Consume => {
            let config = load_config(cli.config.as_ref())?;
            consume(config).await
        }
        Command::CreateQueue {
            name,
            region,
            endpoint_url,
        } => {
            let sdk = load_sdk_config(region.as_deref(), endpoint_url.as_deref()).await;
            let client = aws_sdk_sqs::Client::new(&sdk);
            let url = SqsQueueClient::create_queue(&client, &name)
                .await
                .with_context(|| format!("creating queue {name}"))?;
            println!("{url}");
            Ok(())
        }
    }
}

async fn consume(config: ConsumerConfig) -> anyhow::Result<()> {
    let Some(dead_letter_url) = config.dead_letter_queue_url.clone() else {
        bail!("COURIER_DEAD_LETTER_QUEUE_URL is required for consume");
    };

    let queue = sqs_queue(&config).await;
    let mut dead_letter_config = config.clone();
    dead_letter_config.queue_url = dead_letter_url;
    let dead_letters = QueueDeadLetterSink::new(sqs_queue(&dead_letter_config).await);

    let consumer = Consumer::builder(config)
        .queue(queue)
        .dead_letter_sink(Arc::new(dead_letters))
        .register(
            Matcher::Any,
            handler_fn(|m: Message| async move {
                info!(
                    message_id = %m.id,
                    message_type = m.message_type().unwrap_or("-"),
                    receive_count = m.receive_count,
                    body = %m.body,
                    "Received"
                );
                ProcessingOutcome::success()
            }),
        )
        .build()?;

    let report = consumer
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await;
    info!(drained = report.drained, returned = report.returned, "Consumer stopped");
    println!("{}", serde_json::to_string_pretty(&consumer.stats())?);
    Ok(())
}

async fn demo(messages: usize, flaky_every: usize, policy: ReceivePolicy) -> anyhow::Result<()> {
    let queue = InMemoryQueue::new().with_visibility_timeout(Duration::from_secs(30));
    let dead_letters = Arc::new(InMemoryDeadLetterSink::new());

    let config = ConsumerConfig {
        poll_timeout_secs: 1,
        backoff_base_ms: 500,
        backoff_cap_ms: 2_000,
        shutdown_grace_secs: 5,
        receive_policy: policy,
        ..ConsumerConfig::for_queue("memory://demo")
    };

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let consumer = Consumer::builder(config)
        .queue(Arc::new(queue.clone()))
        .dead_letter_sink(dead_letters.clone())
        .register_batch(
            Matcher::Any,
            batch_fn(move |batch: Vec<Message>| {
                let counter = counter.clone();
                async move {
                    batch
                        .iter()
                        .map(|m| {
                            let n: usize = m.body.trim_start_matches("demo-").parse().unwrap_or(0);
                            if flaky_every > 0 && n % flaky_every == 0 && m.attempt() == 1 {
                                ProcessingOutcome::retryable(format!("first attempt of {n} fails"))
                            } else {
                                counter.fetch_add(1, Ordering::Relaxed);
                                ProcessingOutcome::success()
                            }
                        })
                        .collect()
                }
            }),
        )
        .build()?;

    let producer = Producer::new(Arc::new(queue.clone()));
    let outgoing = (1..=messages)
        .map(|n| OutgoingMessage::new(format!("demo-{n}")))
        .collect();
    producer.send_many(outgoing).await?;
    info!(messages, "Demo messages sent");

    let handle = consumer.start();
    let drained = tokio::time::timeout(Duration::from_secs(60), async {
        while !queue.is_empty().await {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    let report = handle.shutdown().await;
    if drained.is_err() {
        bail!("queue not empty after 60s ({} left)", queue.len().await);
    }

    info!(
        handled = handled.load(Ordering::Relaxed),
        dead_lettered = dead_letters.len().await,
        drained = report.drained,
        returned = report.returned,
        "Demo finished"
    );
    println!("{}", serde_json::to_string_pretty(&consumer.stats())?);
    Ok(())
}
