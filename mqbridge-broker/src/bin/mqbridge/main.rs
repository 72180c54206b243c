mod cli;

use std::{sync::Arc, time::Duration};

use clap::Parser;
use cli::{CliArgs, Command};
use log::{error, info};
use mqbridge_broker::{
    Consumer, DeliveryCallback, Message, Producer, Queue, QueueConfig, QueueError,
};
use mqbridge_models::errors::SendableError;
use mqbridge_utilities::{logger::parse_level, startup};
use serde_json::Value;

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let args = CliArgs::parse();
    startup::startup(
        "mqbridge",
        parse_level(Some(&args.log_level)),
        args.log_file.as_deref(),
    )?;

    let config = cli::resolve_config(&args)?;
    info!("Backend: {}", config.backend_kind);

    match args.command {
        Command::Produce { payload, user_id } => {
            produce(config, &args.topics[0], payload, user_id.as_deref()).await
        }
        Command::Consume {
            ack,
            iterations,
            poll_interval_ms,
        } => {
            consume(
                config,
                &args.topics,
                ack,
                iterations,
                Duration::from_millis(poll_interval_ms),
            )
            .await
        }
    }
}

async fn produce(
    config: QueueConfig,
    topic: &str,
    payload: String,
    user_id: Option<&str>,
) -> Result<(), SendableError> {
    let payload = serde_json::from_str(&payload).unwrap_or(Value::String(payload));
    let queue = Arc::new(Queue::open(config, topic).await?);

    let report: DeliveryCallback = Arc::new(
        |queue: &Queue, err: Option<&QueueError>, message: Option<&Message>| {
            match (err, message) {
                (Some(err), _) => error!("Delivery to {} failed: {}", queue.physical_name(), err),
                (None, Some(message)) => {
                    info!("Delivered {} to {}", message.message_id, queue.physical_name())
                }
                (None, None) => {}
            }
        },
    );
    let producer = Producer::new(Arc::clone(&queue)).with_callback(report);
    let message = producer.produce(payload, user_id, None).await?;
    println!("{}", serde_json::to_string(&message)?);

    drop(producer);
    if let Ok(queue) = Arc::try_unwrap(queue) {
        queue.close().await?;
    }
    Ok(())
}

async fn consume(
    config: QueueConfig,
    topics: &[String],
    ack: bool,
    iterations: Option<usize>,
    poll_interval: Duration,
) -> Result<(), SendableError> {
    let mut queues = Vec::with_capacity(topics.len());
    for topic in topics {
        queues.push(Queue::open(config.clone(), topic.as_str()).await?);
    }

    let consumer = Consumer::new(queues, ack, poll_interval)?.with_handler(|message| {
        match serde_json::to_string(&message) {
            Ok(line) => println!("{line}"),
            Err(err) => error!("Unable to print message {}: {}", message.message_id, err),
        }
    });
    let shutdown = consumer.cancellation_token();
    let mut handle = consumer.spawn(iterations);

    let processed = tokio::select! {
        joined = &mut handle => joined?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received. Stopping consumer...");
            shutdown.cancel();
            handle.await?
        }
    };

    info!("Consumed {} message(s)", processed);
    Ok(())
}
