use thiserror::Error;

pub type SendableError = Box<dyn std::error::Error + Send + Sync>;

/// Failure kinds surfaced by queues and their drivers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("driver unavailable: {0}")]
    DriverUnavailable(String),
    #[error("driver operation failed: {0}")]
    DriverTransient(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl QueueError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn unavailable(context: &str, err: impl std::fmt::Display) -> Self {
        Self::DriverUnavailable(format!("{context}: {err}"))
    }

    pub fn transient(context: &str, err: impl std::fmt::Display) -> Self {
        Self::DriverTransient(format!("{context}: {err}"))
    }

    /// Per-operation failures that a later attempt may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DriverTransient(_) | Self::Serialization(_))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(QueueError::transient("ack", "rejected").is_transient());
        assert!(QueueError::Serialization("bad".into()).is_transient());
        assert!(!QueueError::invalid("payload is null").is_transient());
        assert!(!QueueError::unavailable("connect", "refused").is_transient());
    }

    #[test]
    fn json_errors_become_serialization_errors() {
        let err: QueueError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert!(matches!(err, QueueError::Serialization(_)));
    }

    #[test]
    fn display_carries_context() {
        let err = QueueError::unavailable("amqp connect", "connection refused");
        assert_eq!(
            err.to_string(),
            "driver unavailable: amqp connect: connection refused"
        );
    }
}
