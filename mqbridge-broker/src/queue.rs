use std::{fmt, sync::Arc};

use futures_util::{stream, Stream};
use log::{error, warn};
use mqbridge_config::{BackendKind, QueueConfig};
use mqbridge_models::{
    core::{Envelope, Message, MessageStatus, NO_DELIVERY_TAG},
    errors::QueueError,
    ids::{next_id, now_nanos},
};
use serde_json::Value;

use crate::{adapters, Driver};

/// Called once per `produce` with the producing queue and either the error or
/// the produced message.
pub type DeliveryCallback =
    Arc<dyn Fn(&Queue, Option<&QueueError>, Option<&Message>) + Send + Sync>;

/// One topic on one backend.
pub struct Queue {
    config: QueueConfig,
    topic: String,
    physical_name: String,
    driver: Box<dyn Driver>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("backend", &self.driver.kind())
            .field("topic", &self.topic)
            .field("physical_name", &self.physical_name)
            .finish()
    }
}

impl Queue {
    /// Build and initialise the driver selected by `config`.
    pub async fn open(config: QueueConfig, topic: impl Into<String>) -> Result<Self, QueueError> {
        let topic = topic.into();
        let driver = adapters::open_driver(&config, &topic).await?;
        Ok(Self::from_driver(config, topic, driver))
    }

    /// Wrap an already initialised driver.
    pub fn from_driver(
        config: QueueConfig,
        topic: impl Into<String>,
        driver: Box<dyn Driver>,
    ) -> Self {
        let topic = topic.into();
        Self {
            physical_name: config.physical_name(&topic),
            config,
            topic,
            driver,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn physical_name(&self) -> &str {
        &self.physical_name
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.driver.kind()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn produce(
        &self,
        payload: Value,
        user_id: Option<&str>,
        callback: Option<&DeliveryCallback>,
    ) -> Result<Message, QueueError> {
        let result = self.enqueue(payload, user_id).await;
        if let Err(err) = &result {
            error!("Produce to {} failed: {}", self.physical_name, err);
        }
        if let Some(callback) = callback {
            match &result {
                Ok(message) => callback(self, None, Some(message)),
                Err(err) => callback(self, Some(err), None),
            }
        }
        result
    }

    async fn enqueue(&self, payload: Value, user_id: Option<&str>) -> Result<Message, QueueError> {
        if payload.is_null() {
            return Err(QueueError::invalid("payload must not be null"));
        }

        let envelope = Envelope {
            message_id: next_id(),
            msg: payload,
            user_id: user_id.map(str::to_string),
            in_time: now_nanos(),
        };
        let body = envelope.encode()?;
        let delivery_tag = self.driver.enqueue(&envelope, body).await?;

        Ok(Message::from_envelope(
            envelope,
            MessageStatus::Pending,
            delivery_tag.unwrap_or_else(|| NO_DELIVERY_TAG.to_string()),
        ))
    }

    /// Take at most one message.
    ///
    /// With `acknowledge` the delivery is acked before it is returned and
    /// surfaces as `Acknowledged`; otherwise it stays `InFlight` and the caller
    /// settles it with [`Queue::ack`]. Undecodable deliveries are skipped.
    pub async fn consume_one(&self, acknowledge: bool) -> Result<Option<Message>, QueueError> {
        loop {
            let Some(raw) = self.driver.dequeue(acknowledge).await? else {
                return Ok(None);
            };

            let envelope = match Envelope::decode(&raw.body) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(
                        "Skipping undecodable delivery {} on {}: {}",
                        raw.delivery_tag, self.physical_name, err
                    );
                    if acknowledge && !raw.settled {
                        if let Err(err) = self.driver.ack(&raw.delivery_tag).await {
                            warn!("Unable to discard delivery {}: {}", raw.delivery_tag, err);
                        }
                    }
                    continue;
                }
            };

            let status = if acknowledge {
                if !raw.settled {
                    self.driver.ack(&raw.delivery_tag).await?;
                }
                MessageStatus::Acknowledged
            } else {
                raw.status
            };
            return Ok(Some(Message::from_envelope(envelope, status, raw.delivery_tag)));
        }
    }

    /// Messages currently available, in queue order.
    ///
    /// The stream ends once the queue is empty or the driver fails; failures
    /// are logged, never yielded.
    pub fn consume(&self, acknowledge: bool) -> impl Stream<Item = Message> + Send + '_ {
        stream::unfold((), move |()| async move {
            match self.consume_one(acknowledge).await {
                Ok(Some(message)) => Some((message, ())),
                Ok(None) => None,
                Err(err) => {
                    error!("Consume from {} failed: {}", self.physical_name, err);
                    None
                }
            }
        })
    }

    /// Settle a delivery taken with `acknowledge = false`.
    pub async fn ack(&self, delivery_tag: &str) -> Result<(), QueueError> {
        self.driver.ack(delivery_tag).await
    }

    pub async fn close(self) -> Result<(), QueueError> {
        self.driver.close().await
    }
}
