use std::{
    collections::BTreeMap,
    fmt, fs,
    path::Path,
    str::FromStr,
    time::Duration,
};

use log::debug;
use mqbridge_models::errors::QueueError;
use serde::{Deserialize, Serialize};

pub const BOOTSTRAP_SERVERS: &str = "bootstrap_servers";
pub const GROUP_ID: &str = "group_id";
pub const AUTO_OFFSET_RESET: &str = "auto_offset_reset";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Embedded,
    DocumentQueue,
    Amqp,
    CommitLog,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Embedded => "embedded",
            BackendKind::DocumentQueue => "document_queue",
            BackendKind::Amqp => "amqp",
            BackendKind::CommitLog => "commit_log",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = QueueError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "embedded" | "sqlite" => Ok(BackendKind::Embedded),
            "document_queue" | "mongodb" => Ok(BackendKind::DocumentQueue),
            "amqp" | "rabbitmq" => Ok(BackendKind::Amqp),
            "commit_log" | "kafka" => Ok(BackendKind::CommitLog),
            _ => Err(QueueError::invalid(format!("unknown backend kind '{value}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedParams {
    pub database_path: String,
    /// Seconds an unacknowledged row stays in flight before it is handed out again.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentParams {
    pub host: String,
    #[serde(default = "default_document_port")]
    pub port: u16,
    #[serde(default = "default_lease_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmqpParams {
    pub host: String,
    #[serde(default = "default_amqp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Validated view over the commit-log parameter bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitLogSettings<'a> {
    pub bootstrap_servers: &'a str,
    pub group_id: &'a str,
    pub auto_offset_reset: &'a str,
    /// Every remaining key, passed to the client untouched.
    pub extra: Vec<(&'a str, &'a str)>,
}

/// Backend selection plus the parameters for each backend.
///
/// Only the block matching `backend_kind` is read; the driver checks it when
/// the queue is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub backend_kind: BackendKind,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub embedded_params: Option<EmbeddedParams>,
    #[serde(default)]
    pub document_params: Option<DocumentParams>,
    #[serde(default)]
    pub amqp_params: Option<AmqpParams>,
    #[serde(default)]
    pub commit_log_params: BTreeMap<String, String>,
}

impl QueueConfig {
    pub fn new(backend_kind: BackendKind) -> Self {
        Self {
            backend_kind,
            prefix: None,
            embedded_params: None,
            document_params: None,
            amqp_params: None,
            commit_log_params: BTreeMap::new(),
        }
    }

    pub fn embedded(database_path: impl Into<String>) -> Self {
        let mut config = Self::new(BackendKind::Embedded);
        config.embedded_params = Some(EmbeddedParams {
            database_path: database_path.into(),
            lease_seconds: default_lease_seconds(),
        });
        config
    }

    pub fn document_queue(params: DocumentParams) -> Self {
        let mut config = Self::new(BackendKind::DocumentQueue);
        config.document_params = Some(params);
        config
    }

    pub fn amqp(params: AmqpParams) -> Self {
        let mut config = Self::new(BackendKind::Amqp);
        config.amqp_params = Some(params);
        config
    }

    pub fn commit_log<K, V>(params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut config = Self::new(BackendKind::CommitLog);
        config.commit_log_params = params
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        config
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Name the backend sees for `topic`: `prefix_topic`, or `topic` without a prefix.
    pub fn physical_name(&self, topic: &str) -> String {
        match self.prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}_{topic}"),
            _ => topic.to_string(),
        }
    }

    pub fn embedded_params(&self) -> Result<&EmbeddedParams, QueueError> {
        let params = self
            .embedded_params
            .as_ref()
            .ok_or_else(|| missing(BackendKind::Embedded, "embedded_params"))?;
        if params.database_path.trim().is_empty() {
            return Err(missing(BackendKind::Embedded, "database_path"));
        }
        if params.lease_seconds == 0 {
            return Err(QueueError::invalid("embedded lease_seconds must be positive"));
        }
        Ok(params)
    }

    pub fn document_params(&self) -> Result<&DocumentParams, QueueError> {
        let params = self
            .document_params
            .as_ref()
            .ok_or_else(|| missing(BackendKind::DocumentQueue, "document_params"))?;
        if params.host.trim().is_empty() {
            return Err(missing(BackendKind::DocumentQueue, "host"));
        }
        if params.timeout_seconds == 0 {
            return Err(QueueError::invalid("document_queue timeout_seconds must be positive"));
        }
        if params.max_attempts == 0 {
            return Err(QueueError::invalid("document_queue max_attempts must be positive"));
        }
        Ok(params)
    }

    pub fn amqp_params(&self) -> Result<&AmqpParams, QueueError> {
        let params = self
            .amqp_params
            .as_ref()
            .ok_or_else(|| missing(BackendKind::Amqp, "amqp_params"))?;
        if params.host.trim().is_empty() {
            return Err(missing(BackendKind::Amqp, "host"));
        }
        Ok(params)
    }

    pub fn commit_log_settings(&self) -> Result<CommitLogSettings<'_>, QueueError> {
        let required = |key: &str| {
            self.commit_log_params
                .get(key)
                .map(String::as_str)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| missing(BackendKind::CommitLog, key))
        };

        let bootstrap_servers = required(BOOTSTRAP_SERVERS)?;
        let group_id = required(GROUP_ID)?;
        let auto_offset_reset = self
            .commit_log_params
            .get(AUTO_OFFSET_RESET)
            .map(String::as_str)
            .unwrap_or("earliest");

        let extra = self
            .commit_log_params
            .iter()
            .filter(|(key, _)| {
                !matches!(key.as_str(), BOOTSTRAP_SERVERS | GROUP_ID | AUTO_OFFSET_RESET)
            })
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();

        Ok(CommitLogSettings {
            bootstrap_servers,
            group_id,
            auto_offset_reset,
            extra,
        })
    }
}

impl EmbeddedParams {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }
}

impl DocumentParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout_seconds: default_lease_seconds(),
            max_attempts: default_max_attempts(),
            username: None,
            password: None,
        }
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl AmqpParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }
}

/// Read a [`QueueConfig`] from a JSON file.
pub fn load_config(path: &Path) -> Result<QueueConfig, QueueError> {
    debug!("Loading queue config from {}", path.display());
    let data = fs::read_to_string(path).map_err(|err| {
        QueueError::invalid(format!("unable to read config {}: {err}", path.display()))
    })?;
    parse_config(&data)
        .map_err(|err| QueueError::invalid(format!("invalid config {}: {err}", path.display())))
}

pub fn parse_config(data: &str) -> Result<QueueConfig, QueueError> {
    serde_json::from_str(data).map_err(|err| QueueError::invalid(err.to_string()))
}

fn missing(kind: BackendKind, field: &str) -> QueueError {
    QueueError::invalid(format!("{kind} backend requires '{field}'"))
}

fn default_lease_seconds() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_document_port() -> u16 {
    27017
}

fn default_amqp_port() -> u16 {
    5672
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn physical_name_applies_prefix() {
        let config = QueueConfig::embedded("queue.db");
        assert_eq!(config.physical_name("t"), "t");
        assert_eq!(config.clone().with_prefix("p").physical_name("t"), "p_t");
        assert_eq!(config.with_prefix("").physical_name("t"), "t");
    }

    #[test]
    fn backend_kind_parsing() {
        assert_eq!("embedded".parse::<BackendKind>().unwrap(), BackendKind::Embedded);
        assert_eq!("document-queue".parse::<BackendKind>().unwrap(), BackendKind::DocumentQueue);
        assert_eq!("RabbitMQ".parse::<BackendKind>().unwrap(), BackendKind::Amqp);
        assert_eq!("kafka".parse::<BackendKind>().unwrap(), BackendKind::CommitLog);
        assert!(matches!(
            "redis".parse::<BackendKind>(),
            Err(QueueError::InvalidArgument(_))
        ));
    }

    #[test]
    fn parses_document_config_with_defaults() {
        let config = parse_config(
            r#"{
                "backend_kind": "document_queue",
                "prefix": "dev",
                "document_params": {"host": "localhost", "port": 27017}
            }"#,
        )
        .unwrap();
        let params = config.document_params().unwrap();
        assert_eq!(params.timeout_seconds, 300);
        assert_eq!(params.max_attempts, 3);
        assert_eq!(params.username, None);
        assert_eq!(config.physical_name("jobs"), "dev_jobs");
    }

    #[test]
    fn unknown_backend_in_file_is_invalid_argument() {
        let err = parse_config(r#"{"backend_kind": "carrier_pigeon"}"#).unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));
    }

    #[test]
    fn missing_backend_block_is_invalid_argument() {
        let config = QueueConfig::new(BackendKind::Amqp);
        assert!(matches!(config.amqp_params(), Err(QueueError::InvalidArgument(_))));

        let config = QueueConfig::embedded("  ");
        assert!(config.embedded_params().is_err());

        let mut params = DocumentParams::new("localhost", 27017);
        params.max_attempts = 0;
        assert!(QueueConfig::document_queue(params).document_params().is_err());
    }

    #[test]
    fn commit_log_settings_split_known_keys() {
        let config = QueueConfig::commit_log([
            ("bootstrap_servers", "localhost:9092"),
            ("group_id", "workers"),
            ("client.id", "mqbridge"),
        ]);
        let settings = config.commit_log_settings().unwrap();
        assert_eq!(settings.bootstrap_servers, "localhost:9092");
        assert_eq!(settings.group_id, "workers");
        assert_eq!(settings.auto_offset_reset, "earliest");
        assert_eq!(settings.extra, vec![("client.id", "mqbridge")]);

        let config = QueueConfig::commit_log([("bootstrap_servers", "localhost:9092")]);
        assert!(matches!(
            config.commit_log_settings(),
            Err(QueueError::InvalidArgument(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let body = r#"{
            "backend_kind": "embedded",
            "embedded_params": {"database_path": "q.db", "lease_seconds": 5}
        }"#;
        write!(file, "{body}").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.backend_kind, BackendKind::Embedded);
        assert_eq!(config.embedded_params().unwrap().lease(), Duration::from_secs(5));
        assert!(load_config(Path::new("/definitely/not/here.json")).is_err());
    }
}
