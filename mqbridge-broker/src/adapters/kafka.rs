use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, warn};
use mqbridge_config::{BackendKind, CommitLogSettings, QueueConfig};
use mqbridge_models::errors::QueueError;
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::Message as _,
    producer::{FutureProducer, FutureRecord, Producer as _},
    Offset, TopicPartitionList,
};
use parking_lot::Mutex;

use crate::{Driver, Envelope, RawDelivery};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Single-topic producer/consumer pair on a partitioned log.
///
/// The delivery tag is the record offset. `ack` commits, per partition, up to
/// the first record that is still unacknowledged, so records polled but not
/// yet acked are read again after a restart.
pub struct CommitLogDriver {
    producer: FutureProducer,
    consumer: Arc<StreamConsumer>,
    topic: String,
    pending: Mutex<PendingOffsets>,
}

/// Offsets handed out by `dequeue` and not acked yet, per partition.
#[derive(Debug, Default)]
struct PendingOffsets {
    outstanding: HashMap<i32, BTreeSet<i64>>,
    highest_acked: HashMap<i32, i64>,
}

impl PendingOffsets {
    fn deliver(&mut self, partition: i32, offset: i64) {
        self.outstanding.entry(partition).or_default().insert(offset);
    }

    /// Settle the record behind `delivery_tag` and return the partition with
    /// its new commit position. An offset outstanding on several partitions
    /// settles the lowest partition first.
    fn settle(&mut self, delivery_tag: &str) -> Result<(i32, i64), QueueError> {
        let offset = delivery_tag.parse::<i64>().map_err(|err| {
            QueueError::transient(&format!("kafka offset '{delivery_tag}'"), err)
        })?;

        let partition = self
            .outstanding
            .iter()
            .filter(|(_, offsets)| offsets.contains(&offset))
            .map(|(partition, _)| *partition)
            .min()
            .ok_or_else(|| {
                QueueError::DriverTransient(format!(
                    "kafka ack: offset {offset} was not delivered or is already acked"
                ))
            })?;

        let offsets = self.outstanding.entry(partition).or_default();
        offsets.remove(&offset);
        let first_unacked = offsets.iter().next().copied();

        let acked = self.highest_acked.entry(partition).or_insert(offset);
        *acked = (*acked).max(offset);
        let position = first_unacked.unwrap_or(*acked + 1);
        Ok((partition, position))
    }
}

fn commit_list(
    topic: &str,
    partition: i32,
    position: i64,
) -> Result<TopicPartitionList, QueueError> {
    let mut list = TopicPartitionList::new();
    list.add_partition_offset(topic, partition, Offset::Offset(position))
        .map_err(|err| QueueError::transient("kafka commit", err))?;
    Ok(list)
}

impl CommitLogDriver {
    pub fn connect(config: &QueueConfig, topic: &str) -> Result<Self, QueueError> {
        let settings = config.commit_log_settings()?;
        let (producer_config, consumer_config) = client_configs(&settings);

        let producer: FutureProducer = producer_config
            .create()
            .map_err(|err| QueueError::unavailable("kafka producer", err))?;
        let consumer: StreamConsumer = consumer_config
            .create()
            .map_err(|err| QueueError::unavailable("kafka consumer", err))?;

        Ok(Self {
            producer,
            consumer: Arc::new(consumer),
            topic: config.physical_name(topic),
            pending: Mutex::new(PendingOffsets::default()),
        })
    }
}

fn client_configs(settings: &CommitLogSettings<'_>) -> (ClientConfig, ClientConfig) {
    let mut producer = ClientConfig::new();
    producer.set("bootstrap.servers", settings.bootstrap_servers);

    let mut consumer = ClientConfig::new();
    consumer
        .set("bootstrap.servers", settings.bootstrap_servers)
        .set("group.id", settings.group_id)
        .set("auto.offset.reset", settings.auto_offset_reset)
        .set("enable.auto.commit", "false");

    for (key, value) in &settings.extra {
        producer.set(*key, *value);
        consumer.set(*key, *value);
    }
    (producer, consumer)
}

#[async_trait]
impl Driver for CommitLogDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::CommitLog
    }

    async fn init(&self) -> Result<(), QueueError> {
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(Some(topic.as_str()), METADATA_TIMEOUT)
                .map(|metadata| metadata.topics().len())
        })
        .await
        .map_err(|err| QueueError::unavailable("kafka metadata", err))?;
        let topics = metadata.map_err(|err| QueueError::unavailable("kafka metadata", err))?;
        debug!("Kafka metadata for {}: {} topic(s)", self.topic, topics);

        self.consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|err| QueueError::unavailable("kafka subscribe", err))
    }

    async fn enqueue(
        &self,
        envelope: &Envelope,
        body: Vec<u8>,
    ) -> Result<Option<String>, QueueError> {
        let mut record: FutureRecord<'_, str, Vec<u8>> =
            FutureRecord::to(&self.topic).payload(&body);
        if let Some(user_id) = envelope.user_id.as_deref() {
            record = record.key(user_id);
        }

        match self.producer.send(record, SEND_TIMEOUT).await {
            Ok((partition, offset)) => {
                debug!(
                    "{}: {} stored at partition {} offset {}",
                    self.topic, envelope.message_id, partition, offset
                );
                Ok(Some(offset.to_string()))
            }
            Err((err, _)) => Err(QueueError::transient("kafka produce", err)),
        }
    }

    async fn dequeue(&self, _acknowledge: bool) -> Result<Option<RawDelivery>, QueueError> {
        let received = match tokio::time::timeout(POLL_TIMEOUT, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(received) => received.map_err(|err| QueueError::transient("kafka poll", err))?,
        };

        let body = received.payload().map(<[u8]>::to_vec).unwrap_or_default();
        self.pending
            .lock()
            .deliver(received.partition(), received.offset());
        Ok(Some(RawDelivery::in_flight(body, received.offset().to_string())))
    }

    async fn ack(&self, delivery_tag: &str) -> Result<(), QueueError> {
        let (partition, position) = self.pending.lock().settle(delivery_tag)?;
        let list = commit_list(&self.topic, partition, position)?;
        debug!("{}: committing partition {} at {}", self.topic, partition, position);
        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(|err| QueueError::transient("kafka commit", err))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.consumer.unsubscribe();
        if let Err(err) = self.producer.flush(SEND_TIMEOUT) {
            warn!("Kafka flush for {} failed: {}", self.topic, err);
        }
        Ok(())
    }
}
