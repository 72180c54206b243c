use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use mqbridge_config::{BackendKind, QueueConfig};
use mqbridge_models::{core::MessageStatus, errors::QueueError, ids::now_nanos};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    ConnectOptions, Row, SqlitePool,
};

use crate::{Driver, Envelope, RawDelivery};

/// Queue stored as one table in a single SQLite file.
///
/// Rows are never deleted: an ack moves them to `status = 2`, so status
/// readback keeps working after a restart.
pub struct EmbeddedDriver {
    pool: SqlitePool,
    name: String,
    table: String,
    lease: Duration,
}

impl EmbeddedDriver {
    pub async fn connect(config: &QueueConfig, topic: &str) -> Result<Self, QueueError> {
        let params = config.embedded_params()?;
        let name = config.physical_name(topic);

        let mut options = SqliteConnectOptions::new()
            .filename(&params.database_path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        options
            .log_statements(log::LevelFilter::Debug)
            .log_slow_statements(log::LevelFilter::Warn, Duration::from_secs(1));

        // one connection: every statement on this queue is serialised
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|err| {
                QueueError::unavailable(&format!("sqlite open {}", params.database_path), err)
            })?;

        Ok(Self {
            pool,
            table: quote_identifier(&name),
            name,
            lease: params.lease(),
        })
    }

    pub fn table_name(&self) -> &str {
        &self.name
    }

    /// Current status of a stored message, if the row exists.
    pub async fn status_of(&self, message_id: &str) -> Result<Option<MessageStatus>, QueueError> {
        let sql = format!("SELECT status FROM {} WHERE message_id = ?", self.table);
        let row = sqlx::query(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| QueueError::transient("sqlite status", err))?;

        match row {
            Some(row) => {
                let status: i64 = row
                    .try_get("status")
                    .map_err(|err| QueueError::transient("sqlite status", err))?;
                Ok(Some(MessageStatus::try_from(status as i32)?))
            }
            None => Ok(None),
        }
    }

    pub async fn pending_count(&self) -> Result<i64, QueueError> {
        let sql = format!("SELECT COUNT(*) AS pending FROM {} WHERE status = 0", self.table);
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| QueueError::transient("sqlite count", err))?;
        row.try_get("pending")
            .map_err(|err| QueueError::transient("sqlite count", err))
    }

    /// Return rows whose lease ran out to `pending`.
    async fn release_expired(&self, now: i64) -> Result<u64, QueueError> {
        let expired_before = now.saturating_sub(self.lease.as_nanos() as i64);
        let sql = format!(
            "UPDATE {} SET status = 0, locked_at = NULL WHERE status = 1 AND locked_at <= ?",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(expired_before)
            .execute(&self.pool)
            .await
            .map_err(|err| QueueError::transient("sqlite lease sweep", err))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Driver for EmbeddedDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    async fn init(&self) -> Result<(), QueueError> {
        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                message_id TEXT PRIMARY KEY NOT NULL,
                body TEXT NOT NULL,
                in_time INTEGER NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                locked_at INTEGER NULL
            )",
            self.table
        );
        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (status, in_time)",
            quote_identifier(&format!("{}_status_in_time", self.name)),
            self.table
        );

        for sql in [create_table, create_index] {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|err| QueueError::unavailable("sqlite declare", err))?;
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        envelope: &Envelope,
        body: Vec<u8>,
    ) -> Result<Option<String>, QueueError> {
        let body =
            String::from_utf8(body).map_err(|err| QueueError::Serialization(err.to_string()))?;
        let sql = format!(
            "INSERT INTO {} (message_id, body, in_time, status) VALUES (?, ?, ?, 0)",
            self.table
        );
        sqlx::query(&sql)
            .bind(&envelope.message_id)
            .bind(body)
            .bind(envelope.in_time)
            .execute(&self.pool)
            .await
            .map_err(|err| QueueError::transient("sqlite enqueue", err))?;
        Ok(Some(envelope.message_id.clone()))
    }

    async fn dequeue(&self, _acknowledge: bool) -> Result<Option<RawDelivery>, QueueError> {
        let now = now_nanos();
        let released = self.release_expired(now).await?;
        if released > 0 {
            debug!("{}: {} expired lease(s) returned to pending", self.name, released);
        }

        // single statement: the write lock is held before the row is chosen
        let claim = format!(
            "UPDATE {table} SET status = 1, locked_at = ?
             WHERE message_id = (
                 SELECT message_id FROM {table} WHERE status = 0
                 ORDER BY in_time, message_id LIMIT 1
             )
             RETURNING message_id, body",
            table = self.table
        );

        let row = sqlx::query(&claim)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| QueueError::transient("sqlite dequeue", err))?;
        let Some(row) = row else {
            return Ok(None);
        };

        let message_id: String = row
            .try_get("message_id")
            .map_err(|err| QueueError::transient("sqlite dequeue", err))?;
        let body: String = row
            .try_get("body")
            .map_err(|err| QueueError::transient("sqlite dequeue", err))?;

        Ok(Some(RawDelivery::in_flight(body.into_bytes(), message_id)))
    }

    async fn ack(&self, delivery_tag: &str) -> Result<(), QueueError> {
        let sql = format!(
            "UPDATE {} SET status = 2, locked_at = NULL WHERE message_id = ?",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(delivery_tag)
            .execute(&self.pool)
            .await
            .map_err(|err| QueueError::transient("sqlite ack", err))?;
        if result.rows_affected() == 0 {
            return Err(QueueError::DriverTransient(format!(
                "sqlite ack: no message '{delivery_tag}' in {}",
                self.name
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.pool.close().await;
        Ok(())
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
