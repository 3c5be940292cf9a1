use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::exporter::{ExporterConfig, DEFAULT_BATCH_SIZE, DEFAULT_MESSAGE_TIMEOUT};
use crate::filter::{Filter, FilterSpec};
use crate::payload::{PayloadProjector, Selector, SelectorError};
use crate::watcher::DEFAULT_MAX_EVENT_AGE;

pub const DEFAULT_BUFFER_SIZE: usize = 128;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("cluster name is required")]
    MissingClusterName,
    #[error("buffer size must be positive")]
    InvalidBufferSize,
    #[error("at least one kafka broker is required")]
    MissingBrokers,
    #[error("kafka topic is required")]
    MissingTopic,
    #[error("sasl username is required")]
    MissingSaslUsername,
    #[error("sasl password is required")]
    MissingSaslPassword,
    #[error("tls cert and key must be provided together")]
    IncompleteTlsKeyPair,
    #[error("unreadable credential file {path}: {source}")]
    UnreadableCredential {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("filter at index {index} has issues: {source}")]
    InvalidFilter { index: usize, source: regex::Error },
    #[error("selector at index {index} has issues: {source}")]
    InvalidSelector {
        index: usize,
        source: SelectorError,
    },
}

/// The configuration document. Parsing is strict: unknown fields anywhere in
/// the document abort startup, as do values that fail [`Config::validate`].
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Config {
    pub cluster_name: String,
    /// Empty means all namespaces.
    #[serde(default)]
    pub namespace: String,
    #[serde(default = "default_max_event_age", with = "humantime_serde")]
    pub max_event_age: Duration,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub selectors: Vec<Selector>,
}

fn default_max_event_age() -> Duration {
    DEFAULT_MAX_EVENT_AGE
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl Config {
    /// Reads, parses and validates the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_name.is_empty() {
            return Err(ConfigError::MissingClusterName);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize);
        }
        self.kafka.validate()?;
        for (index, filter) in self.filters.iter().enumerate() {
            filter
                .validate()
                .map_err(|source| ConfigError::InvalidFilter { index, source })?;
        }
        for (index, selector) in self.selectors.iter().enumerate() {
            selector
                .validate()
                .map_err(|source| ConfigError::InvalidSelector { index, source })?;
        }
        Ok(())
    }

    /// The namespace to watch; `None` means all namespaces.
    pub fn target_namespace(&self) -> Option<String> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(self.namespace.clone())
        }
    }

    pub fn compiled_filters(&self) -> Result<Vec<Filter>, ConfigError> {
        self.filters
            .iter()
            .enumerate()
            .map(|(index, filter)| {
                filter
                    .compile()
                    .map_err(|source| ConfigError::InvalidFilter { index, source })
            })
            .collect()
    }

    pub fn projector(&self) -> Result<Option<PayloadProjector>, ConfigError> {
        if self.selectors.is_empty() {
            return Ok(None);
        }
        for (index, selector) in self.selectors.iter().enumerate() {
            selector
                .validate()
                .map_err(|source| ConfigError::InvalidSelector { index, source })?;
        }
        let projector = PayloadProjector::new(&self.selectors)
            .map_err(|source| ConfigError::InvalidSelector { index: 0, source })?;
        Ok(Some(projector))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaConfig {
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub sasl: Option<SaslConfig>,
}

impl KafkaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.is_empty() {
            return Err(ConfigError::MissingBrokers);
        }
        if self.topic.is_empty() {
            return Err(ConfigError::MissingTopic);
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        if let Some(sasl) = &self.sasl {
            sasl.validate()?;
        }
        Ok(())
    }

    pub fn exporter_config(&self) -> ExporterConfig {
        ExporterConfig {
            brokers: self.brokers.clone(),
            topic: self.topic.clone(),
            compression: self.compression,
            tls: self.tls.clone(),
            sasl: self.sasl.clone(),
            batch_size: DEFAULT_BATCH_SIZE,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    /// The librdkafka `compression.codec` value.
    pub fn codec(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TlsConfig {
    pub cacert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub skip_verify: bool,
}

impl TlsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cert.is_some() != self.key.is_some() {
            return Err(ConfigError::IncompleteTlsKeyPair);
        }
        for path in [&self.cacert, &self.cert, &self.key].into_iter().flatten() {
            // The paths are handed to librdkafka as-is; catch unreadable
            // credential material at startup instead of at first connect.
            std::fs::metadata(path).map_err(|source| ConfigError::UnreadableCredential {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaslConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub mechanism: SaslMechanism,
}

impl SaslConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.is_empty() {
            return Err(ConfigError::MissingSaslUsername);
        }
        if self.password.is_empty() {
            return Err(ConfigError::MissingSaslPassword);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaslMechanism {
    #[default]
    Plain,
    Sha256,
    Sha512,
}

impl SaslMechanism {
    /// The librdkafka `sasl.mechanism` value.
    pub fn as_str(self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::Sha256 => "SCRAM-SHA-256",
            SaslMechanism::Sha512 => "SCRAM-SHA-512",
        }
    }
}
