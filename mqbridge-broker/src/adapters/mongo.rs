use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use mongodb::{
    bson::{doc, oid::ObjectId, Bson, DateTime as BsonDateTime, Document},
    options::{
        ClientOptions, Credential, FindOneAndUpdateOptions, ReturnDocument, ServerAddress,
    },
    Client, Collection, IndexModel,
};
use mqbridge_config::{BackendKind, DocumentParams, QueueConfig};
use mqbridge_models::errors::QueueError;

use crate::{Driver, Envelope, RawDelivery};

pub const DATABASE_NAME: &str = "queue";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lease-based job queue over one MongoDB collection.
///
/// Documents carry the envelope fields plus `priority`, `locked_at`,
/// `attempts` and `completed_at`. A document is handed out when it is not
/// complete, has been tried fewer than `max_attempts` times and holds no
/// live lease.
pub struct DocumentQueueDriver {
    client: Client,
    collection: Collection<Document>,
    name: String,
    lease: Duration,
    max_attempts: u32,
}

impl DocumentQueueDriver {
    pub async fn connect(config: &QueueConfig, topic: &str) -> Result<Self, QueueError> {
        let params = config.document_params()?;
        let name = config.physical_name(topic);

        let client = Client::with_options(client_options(params))
            .map_err(|err| QueueError::unavailable("mongodb client", err))?;
        let collection = client.database(DATABASE_NAME).collection::<Document>(&name);

        Ok(Self {
            client,
            collection,
            name,
            lease: params.lease(),
            max_attempts: params.max_attempts,
        })
    }
}

fn client_options(params: &DocumentParams) -> ClientOptions {
    let credential = params.username.as_ref().map(|username| {
        Credential::builder()
            .username(username.clone())
            .password(params.password.clone())
            .build()
    });

    ClientOptions::builder()
        .hosts(vec![ServerAddress::Tcp {
            host: params.host.clone(),
            port: Some(params.port),
        }])
        .app_name("mqbridge".to_string())
        .connect_timeout(CONNECT_TIMEOUT)
        .server_selection_timeout(CONNECT_TIMEOUT)
        .credential(credential)
        .build()
}

fn claim_filter(now: BsonDateTime, lease: Duration, max_attempts: u32) -> Document {
    let expired_before =
        BsonDateTime::from_millis(now.timestamp_millis() - lease.as_millis() as i64);
    doc! {
        "completed_at": Bson::Null,
        "attempts": { "$lt": max_attempts as i64 },
        "$or": [
            { "locked_at": Bson::Null },
            { "locked_at": { "$lt": expired_before } },
        ],
    }
}

fn claim_update(now: BsonDateTime) -> Document {
    doc! {
        "$set": { "locked_at": now },
        "$inc": { "attempts": 1 },
    }
}

fn claim_order() -> Document {
    doc! { "priority": -1, "in_time": 1, "_id": 1 }
}

fn new_document(envelope: &Envelope, body: String) -> Document {
    doc! {
        "message_id": envelope.message_id.as_str(),
        "body": body,
        "user_id": envelope.user_id.clone(),
        "in_time": envelope.in_time,
        "priority": 0,
        "attempts": 0,
        "locked_at": Bson::Null,
        "completed_at": Bson::Null,
    }
}

#[async_trait]
impl Driver for DocumentQueueDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::DocumentQueue
    }

    async fn init(&self) -> Result<(), QueueError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|err| QueueError::unavailable("mongodb ping", err))?;

        let index = IndexModel::builder()
            .keys(doc! { "completed_at": 1, "locked_at": 1, "priority": -1, "in_time": 1 })
            .build();
        self.collection
            .create_index(index, None)
            .await
            .map_err(|err| QueueError::unavailable("mongodb create index", err))?;

        info!(
            "Document queue {}.{} ready (lease {:?}, max attempts {})",
            DATABASE_NAME, self.name, self.lease, self.max_attempts
        );
        Ok(())
    }

    async fn enqueue(
        &self,
        envelope: &Envelope,
        body: Vec<u8>,
    ) -> Result<Option<String>, QueueError> {
        let body =
            String::from_utf8(body).map_err(|err| QueueError::Serialization(err.to_string()))?;
        let result = self
            .collection
            .insert_one(new_document(envelope, body), None)
            .await
            .map_err(|err| QueueError::transient("mongodb insert", err))?;
        Ok(result.inserted_id.as_object_id().map(|id| id.to_hex()))
    }

    async fn dequeue(&self, _acknowledge: bool) -> Result<Option<RawDelivery>, QueueError> {
        let now = BsonDateTime::now();
        let options = FindOneAndUpdateOptions::builder()
            .sort(claim_order())
            .return_document(ReturnDocument::After)
            .build();

        let claimed = self
            .collection
            .find_one_and_update(
                claim_filter(now, self.lease, self.max_attempts),
                claim_update(now),
                options,
            )
            .await
            .map_err(|err| QueueError::transient("mongodb claim", err))?;

        let Some(document) = claimed else {
            return Ok(None);
        };

        let id = document
            .get_object_id("_id")
            .map_err(|err| QueueError::transient("mongodb claim", err))?;
        let body = document
            .get_str("body")
            .map_err(|err| QueueError::Serialization(err.to_string()))?;
        debug!(
            "{}: claimed {} (attempt {})",
            self.name,
            id,
            document.get_i32("attempts").unwrap_or_default()
        );

        Ok(Some(RawDelivery::in_flight(body.as_bytes().to_vec(), id.to_hex())))
    }

    async fn ack(&self, delivery_tag: &str) -> Result<(), QueueError> {
        let id = ObjectId::parse_str(delivery_tag)
            .map_err(|err| QueueError::transient("mongodb ack", err))?;
        let result = self
            .collection
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "completed_at": BsonDateTime::now(), "locked_at": Bson::Null } },
                None,
            )
            .await
            .map_err(|err| QueueError::transient("mongodb ack", err))?;

        if result.matched_count == 0 {
            return Err(QueueError::DriverTransient(format!(
                "mongodb ack: no document {delivery_tag} in {}",
                self.name
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        debug!("Closing document queue {}", self.name);
        // handles share one pool; shutdown waits for checked-out sessions
        self.client.clone().shutdown().await;
        Ok(())
    }
}
