use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;

use crate::config::size::RawSize;
use crate::sink::{RecordFormat, RotationPolicy, SinkDescriptor, resolve_path};
use crate::subscription::Encoding;
use crate::utils::SettingsError;

pub const DEFAULT_ROOT: &str = "/logs";
pub const DEFAULT_MAX_BYTES: u64 = 10_000_000;
pub const DEFAULT_BACKUP_COUNT: u32 = 3;
pub const DEFAULT_ADDRESS: &str = "localhost";
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// Validated configuration for the whole bridge.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub brokers: Vec<BrokerEndpoint>,
    pub topics: Vec<TopicSettings>,
}

/// Defaults applied to every sink unless a topic overrides them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub root: PathBuf,
    pub format: RecordFormat,
    pub max_bytes: u64,
    pub backup_count: u32,
    pub sync: bool,
}

/// Connection parameters of one broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
}

/// One topic subscription and the sink it writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSettings {
    pub topic: String,
    pub broker: String,
    pub qos: Qos,
    pub encoding: Encoding,
    pub sink: SinkDescriptor,
}

/// MQTT quality of service level requested for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn level(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for Qos {
    type Error = SettingsError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(SettingsError::InvalidQos(other)),
        }
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            format: RecordFormat::default(),
            max_bytes: DEFAULT_MAX_BYTES,
            backup_count: DEFAULT_BACKUP_COUNT,
            sync: false,
        }
    }
}

/// Configuration as read from the file and environment; every field optional.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub logging: Option<PartialLogging>,
    pub brokers: Option<Vec<PartialBroker>>,
    pub topics: Option<Vec<PartialTopic>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogging {
    pub root: Option<PathBuf>,
    pub format: Option<String>,
    #[serde(rename = "maxBytes", alias = "maxbytes", alias = "max_bytes")]
    pub max_bytes: Option<RawSize>,
    #[serde(rename = "backupCount", alias = "backupcount", alias = "backup_count")]
    pub backup_count: Option<u32>,
    pub sync: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBroker {
    pub name: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(alias = "clientId", alias = "clientid")]
    pub client_id: Option<String>,
    #[serde(alias = "keepAlive", alias = "keepalive")]
    pub keep_alive: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialTopic {
    pub topic: Option<String>,
    pub broker: Option<String>,
    pub qos: Option<u8>,
    pub encoding: Option<String>,
    pub log: Option<PathBuf>,
    pub format: Option<String>,
    #[serde(rename = "maxBytes", alias = "maxbytes", alias = "max_bytes")]
    pub max_bytes: Option<RawSize>,
    #[serde(rename = "backupCount", alias = "backupcount", alias = "backup_count")]
    pub backup_count: Option<u32>,
}

/// Treats an empty or whitespace-only string as missing.
fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Settings {
    /// Applies defaults and checks every invariant. Nothing is connected or
    /// opened here; any error is fatal.
    pub fn from_partial(partial: PartialSettings) -> Result<Self, SettingsError> {
        let logging = LoggingSettings::from_partial(partial.logging.unwrap_or_default())?;

        let raw_brokers = partial.brokers.unwrap_or_default();
        if raw_brokers.is_empty() {
            return Err(SettingsError::NoBrokers);
        }
        let mut brokers: Vec<BrokerEndpoint> = Vec::with_capacity(raw_brokers.len());
        for (index, raw) in raw_brokers.into_iter().enumerate() {
            let endpoint = BrokerEndpoint::from_partial(index, raw)?;
            if brokers.iter().any(|b| b.name == endpoint.name) {
                return Err(SettingsError::DuplicateBroker(endpoint.name));
            }
            brokers.push(endpoint);
        }

        let raw_topics = partial.topics.unwrap_or_default();
        if raw_topics.is_empty() {
            return Err(SettingsError::NoTopics);
        }
        let mut topics: Vec<TopicSettings> = Vec::with_capacity(raw_topics.len());
        let mut log_paths = HashSet::new();
        for (index, raw) in raw_topics.into_iter().enumerate() {
            let topic = TopicSettings::from_partial(index, raw, &logging)?;
            if !brokers.iter().any(|b| b.name == topic.broker) {
                return Err(SettingsError::UnknownBroker {
                    topic: topic.topic,
                    broker: topic.broker,
                });
            }
            if topics
                .iter()
                .any(|t| t.broker == topic.broker && t.topic == topic.topic)
            {
                return Err(SettingsError::DuplicateSubscription {
                    broker: topic.broker,
                    topic: topic.topic,
                });
            }
            let resolved = resolve_path(&logging.root, &topic.sink.path);
            if !log_paths.insert(resolved.clone()) {
                return Err(SettingsError::SharedLogPath(resolved));
            }
            topics.push(topic);
        }

        Ok(Self {
            logging,
            brokers,
            topics,
        })
    }

    pub fn broker(&self, name: &str) -> Option<&BrokerEndpoint> {
        self.brokers.iter().find(|b| b.name == name)
    }
}

impl LoggingSettings {
    fn from_partial(raw: PartialLogging) -> Result<Self, SettingsError> {
        let default = LoggingSettings::default();
        Ok(Self {
            root: raw.root.unwrap_or(default.root),
            format: match raw.format {
                Some(template) => RecordFormat::parse(&template)?,
                None => default.format,
            },
            max_bytes: match raw.max_bytes {
                Some(size) => size.to_bytes()?,
                None => default.max_bytes,
            },
            backup_count: raw.backup_count.unwrap_or(default.backup_count),
            sync: raw.sync.unwrap_or(default.sync),
        })
    }
}

impl BrokerEndpoint {
    fn from_partial(index: usize, raw: PartialBroker) -> Result<Self, SettingsError> {
        let missing = |field| SettingsError::MissingField {
            section: "brokers",
            index,
            field,
        };
        let name = present(raw.name).ok_or_else(|| missing("name"))?;
        let address = match raw.address {
            None => DEFAULT_ADDRESS.to_string(),
            Some(address) => present(Some(address)).ok_or_else(|| missing("address"))?,
        };

        Ok(Self {
            name,
            address,
            port: raw.port.unwrap_or(DEFAULT_PORT),
            username: raw.username,
            password: raw.password,
            client_id: present(raw.client_id),
            keep_alive_secs: raw.keep_alive.unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
        })
    }
}

impl TopicSettings {
    fn from_partial(
        index: usize,
        raw: PartialTopic,
        logging: &LoggingSettings,
    ) -> Result<Self, SettingsError> {
        let missing = |field| SettingsError::MissingField {
            section: "topics",
            index,
            field,
        };
        let topic = present(raw.topic).ok_or_else(|| missing("topic"))?;
        let broker = present(raw.broker).ok_or_else(|| missing("broker"))?;
        let path = raw
            .log
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| missing("log"))?;

        let qos = match raw.qos {
            Some(level) => Qos::try_from(level)?,
            None => Qos::default(),
        };
        let encoding = match raw.encoding {
            Some(name) => name.parse()?,
            None => Encoding::default(),
        };
        let format = match raw.format {
            Some(template) => RecordFormat::parse(&template)?,
            None => logging.format.clone(),
        };
        let max_bytes = match raw.max_bytes {
            Some(size) => size.to_bytes()?,
            None => logging.max_bytes,
        };

        Ok(Self {
            sink: SinkDescriptor {
                broker: broker.clone(),
                topic: topic.clone(),
                path,
                format,
                policy: RotationPolicy {
                    max_bytes,
                    backup_count: raw.backup_count.unwrap_or(logging.backup_count),
                    sync: logging.sync,
                },
            },
            topic,
            broker,
            qos,
            encoding,
        })
    }
}
