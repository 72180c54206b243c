#[cfg(feature = "commit-log")]
pub mod kafka;
#[cfg(feature = "document")]
pub mod mongo;
#[cfg(feature = "amqp")]
pub mod rabbitmq;
pub mod sqlite;

use log::info;
use mqbridge_config::{BackendKind, QueueConfig};
use mqbridge_models::errors::QueueError;

use crate::Driver;

/// Build the driver selected by `config` for `topic` and run its `init`.
pub async fn open_driver(config: &QueueConfig, topic: &str) -> Result<Box<dyn Driver>, QueueError> {
    if topic.trim().is_empty() {
        return Err(QueueError::invalid("topic must not be empty"));
    }

    let driver: Box<dyn Driver> = match config.backend_kind {
        BackendKind::Embedded => Box::new(sqlite::EmbeddedDriver::connect(config, topic).await?),
        BackendKind::DocumentQueue => document_driver(config, topic).await?,
        BackendKind::Amqp => amqp_driver(config, topic).await?,
        BackendKind::CommitLog => commit_log_driver(config, topic).await?,
    };

    driver.init().await?;
    info!(
        "Opened {} queue '{}'",
        config.backend_kind,
        config.physical_name(topic)
    );
    Ok(driver)
}

#[cfg(feature = "document")]
async fn document_driver(config: &QueueConfig, topic: &str) -> Result<Box<dyn Driver>, QueueError> {
    Ok(Box::new(mongo::DocumentQueueDriver::connect(config, topic).await?))
}

#[cfg(not(feature = "document"))]
async fn document_driver(
    _config: &QueueConfig,
    _topic: &str,
) -> Result<Box<dyn Driver>, QueueError> {
    Err(not_compiled(BackendKind::DocumentQueue, "document"))
}

#[cfg(feature = "amqp")]
async fn amqp_driver(config: &QueueConfig, topic: &str) -> Result<Box<dyn Driver>, QueueError> {
    Ok(Box::new(rabbitmq::AmqpDriver::connect(config, topic).await?))
}

#[cfg(not(feature = "amqp"))]
async fn amqp_driver(_config: &QueueConfig, _topic: &str) -> Result<Box<dyn Driver>, QueueError> {
    Err(not_compiled(BackendKind::Amqp, "amqp"))
}

#[cfg(feature = "commit-log")]
async fn commit_log_driver(
    config: &QueueConfig,
    topic: &str,
) -> Result<Box<dyn Driver>, QueueError> {
    Ok(Box::new(kafka::CommitLogDriver::connect(config, topic)?))
}

#[cfg(not(feature = "commit-log"))]
async fn commit_log_driver(
    _config: &QueueConfig,
    _topic: &str,
) -> Result<Box<dyn Driver>, QueueError> {
    Err(not_compiled(BackendKind::CommitLog, "commit-log"))
}

#[allow(dead_code)]
fn not_compiled(kind: BackendKind, feature: &str) -> QueueError {
    QueueError::DriverUnavailable(format!(
        "{kind} backend is not compiled in (enable the '{feature}' feature)"
    ))
}
