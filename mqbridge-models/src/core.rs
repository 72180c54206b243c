use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::QueueError;

/// Delivery tag used by backends that do not hand out their own handle.
pub const NO_DELIVERY_TAG: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum MessageStatus {
    Pending = 0,
    InFlight = 1,
    Acknowledged = 2,
}

impl MessageStatus {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl From<MessageStatus> for i32 {
    fn from(status: MessageStatus) -> Self {
        status.as_i32()
    }
}

impl TryFrom<i32> for MessageStatus {
    type Error = QueueError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::InFlight),
            2 => Ok(Self::Acknowledged),
            other => Err(QueueError::invalid(format!("unknown message status {other}"))),
        }
    }
}

/// JSON object handed to every backend: `{message_id, msg, user_id, in_time}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub msg: Value,
    pub user_id: Option<String>,
    pub in_time: i64,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, QueueError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(body: &[u8]) -> Result<Self, QueueError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// One enqueued item as seen by application code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub payload: Value,
    pub user_id: Option<String>,
    pub status: MessageStatus,
    pub enqueued_at: i64,
    pub delivery_tag: String,
}

impl Message {
    pub fn from_envelope(
        envelope: Envelope,
        status: MessageStatus,
        delivery_tag: impl Into<String>,
    ) -> Self {
        Self {
            message_id: envelope.message_id,
            payload: envelope.msg,
            user_id: envelope.user_id,
            status,
            enqueued_at: envelope.in_time,
            delivery_tag: delivery_tag.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> Envelope {
        Envelope {
            message_id: "0655f3a1-8c2e-7a10-8000-5e4f0c9d2b71".into(),
            msg: json!({"a": 1, "b": null}),
            user_id: None,
            in_time: 1_700_000_000_123_456_789,
        }
    }

    #[test]
    fn envelope_wire_shape() {
        let body = envelope().encode().unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            value,
            json!({
                "message_id": "0655f3a1-8c2e-7a10-8000-5e4f0c9d2b71",
                "msg": {"a": 1, "b": null},
                "user_id": null,
                "in_time": 1_700_000_000_123_456_789i64,
            })
        );
        assert_eq!(Envelope::decode(&body).unwrap(), envelope());
    }

    #[test]
    fn decode_rejects_foreign_bodies() {
        assert!(matches!(
            Envelope::decode(b"hello"),
            Err(QueueError::Serialization(_))
        ));
        assert!(Envelope::decode(br#"{"msg": 1}"#).is_err());
    }

    #[test]
    fn status_numbers() {
        assert_eq!(MessageStatus::Pending.as_i32(), 0);
        assert_eq!(MessageStatus::InFlight.as_i32(), 1);
        assert_eq!(MessageStatus::Acknowledged.as_i32(), 2);
        assert_eq!(MessageStatus::try_from(1).unwrap(), MessageStatus::InFlight);
        assert!(MessageStatus::try_from(7).is_err());
        assert!(MessageStatus::Pending < MessageStatus::Acknowledged);
        assert_eq!(serde_json::to_string(&MessageStatus::Acknowledged).unwrap(), "2");
    }

    #[test]
    fn message_takes_envelope_fields() {
        let message = Message::from_envelope(envelope(), MessageStatus::InFlight, "42");
        assert_eq!(message.payload, json!({"a": 1, "b": null}));
        assert_eq!(message.enqueued_at, 1_700_000_000_123_456_789);
        assert_eq!(message.delivery_tag, "42");
        assert_eq!(message.status, MessageStatus::InFlight);
    }
}
