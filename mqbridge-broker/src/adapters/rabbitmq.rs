use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicPublishOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use log::{debug, warn};
use mqbridge_config::{AmqpParams, BackendKind, QueueConfig};
use mqbridge_models::errors::QueueError;

use crate::{Driver, Envelope, RawDelivery};

const ROUTING_KEY: &str = "";
const PERSISTENT: u8 = 2;

/// Topic exchange named after the logical topic, with the physical queue bound to it.
pub struct AmqpDriver {
    connection: Connection,
    channel: Channel,
    exchange: String,
    queue: String,
}

impl AmqpDriver {
    pub async fn connect(config: &QueueConfig, topic: &str) -> Result<Self, QueueError> {
        let params = config.amqp_params()?;
        let connection = Connection::connect_uri(amqp_uri(params), ConnectionProperties::default())
            .await
            .map_err(|err| {
                let context = format!("amqp connect {}:{}", params.host, params.port);
                QueueError::unavailable(&context, err)
            })?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| QueueError::unavailable("amqp channel", err))?;

        Ok(Self {
            connection,
            channel,
            exchange: topic.to_string(),
            queue: config.physical_name(topic),
        })
    }
}

fn amqp_uri(params: &AmqpParams) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.host = params.host.clone();
    uri.authority.port = params.port;
    if let Some(username) = &params.username {
        uri.authority.userinfo.username = username.clone();
    }
    if let Some(password) = &params.password {
        uri.authority.userinfo.password = password.clone();
    }
    uri
}

fn parse_tag(delivery_tag: &str) -> Result<u64, QueueError> {
    delivery_tag
        .parse::<u64>()
        .map_err(|err| QueueError::transient(&format!("amqp delivery tag '{delivery_tag}'"), err))
}

#[async_trait]
impl Driver for AmqpDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Amqp
    }

    async fn init(&self) -> Result<(), QueueError> {
        self.channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| QueueError::unavailable("amqp exchange declare", err))?;

        self.channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| QueueError::unavailable("amqp queue declare", err))?;

        self.channel
            .queue_bind(
                &self.queue,
                &self.exchange,
                ROUTING_KEY,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| QueueError::unavailable("amqp queue bind", err))?;

        // publisher confirms make enqueue wait for the broker's handoff
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| QueueError::unavailable("amqp confirm select", err))?;

        debug!("Bound queue {} to exchange {}", self.queue, self.exchange);
        Ok(())
    }

    async fn enqueue(
        &self,
        envelope: &Envelope,
        body: Vec<u8>,
    ) -> Result<Option<String>, QueueError> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_message_id(envelope.message_id.clone().into())
            .with_delivery_mode(PERSISTENT);

        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                ROUTING_KEY,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|err| QueueError::transient("amqp publish", err))?
            .await
            .map_err(|err| QueueError::transient("amqp publish confirm", err))?;

        if confirmation.is_nack() {
            return Err(QueueError::DriverTransient(format!(
                "amqp publish: broker rejected {} on exchange {}",
                envelope.message_id, self.exchange
            )));
        }
        Ok(None)
    }

    async fn dequeue(&self, acknowledge: bool) -> Result<Option<RawDelivery>, QueueError> {
        let fetched = self
            .channel
            .basic_get(&self.queue, BasicGetOptions { no_ack: acknowledge })
            .await
            .map_err(|err| QueueError::transient("amqp basic.get", err))?;

        Ok(fetched.map(|message| {
            let delivery = message.delivery;
            let raw = RawDelivery::in_flight(delivery.data, delivery.delivery_tag.to_string());
            if acknowledge {
                raw.mark_settled()
            } else {
                raw
            }
        }))
    }

    async fn ack(&self, delivery_tag: &str) -> Result<(), QueueError> {
        let tag = parse_tag(delivery_tag)?;
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|err| QueueError::transient("amqp ack", err))
    }

    async fn close(&self) -> Result<(), QueueError> {
        if let Err(err) = self.channel.close(200, "closing").await {
            warn!("Error closing channel for {}: {}", self.queue, err);
        }
        self.connection
            .close(200, "closing")
            .await
            .map_err(|err| QueueError::transient("amqp close", err))
    }
}
