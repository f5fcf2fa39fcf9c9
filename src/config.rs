//! Configuration loading and types for bucketproxy.
//!
//! Configuration is assembled once at startup from three layers, later
//! layers winning: built-in defaults, an optional YAML file deserialized
//! into [`Config`], and environment variables (see [`Config::apply_env`]).
//! The result is validated with `garde` and never mutated afterwards.

use std::path::Path;
use std::time::Duration;

use garde::Validate;
use serde::{Deserialize, Deserializer};

/// Smallest part size S3 accepts for all but the last multipart part.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    #[garde(dive)]
    pub server: ServerConfig,

    /// Object storage backend settings.
    #[serde(default)]
    #[garde(dive)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    #[garde(skip)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    #[garde(skip)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ServerConfig {
    /// Bind address (`host:port`).
    #[serde(default = "default_addr")]
    #[garde(length(min = 1))]
    pub addr: String,

    /// Longest stall allowed while reading a request body.
    #[serde(default = "default_read_timeout", deserialize_with = "deserialize_duration")]
    #[garde(skip)]
    pub read_timeout: Duration,

    /// Longest stall allowed while writing a response body.
    #[serde(default = "default_write_timeout", deserialize_with = "deserialize_duration")]
    #[garde(skip)]
    pub write_timeout: Duration,

    /// Time a request may take before its response head is produced.
    #[serde(default = "default_idle_timeout", deserialize_with = "deserialize_duration")]
    #[garde(skip)]
    pub idle_timeout: Duration,

    /// Graceful shutdown bound before connections are forcibly closed.
    #[serde(default = "default_shutdown_timeout", deserialize_with = "deserialize_duration")]
    #[garde(skip)]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            idle_timeout: default_idle_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Which [`crate::storage::backend::ObjectStore`] implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// S3-compatible service reached through the AWS SDK.
    S3,
    /// In-process store, nothing leaves the process.
    Memory,
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" | "aws" => Ok(StorageKind::S3),
            "memory" => Ok(StorageKind::Memory),
            other => Err(anyhow::anyhow!("unknown storage backend '{other}'")),
        }
    }
}

/// Object storage backend configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StorageConfig {
    /// Backend type: `s3` or `memory`.
    #[serde(default = "default_storage_kind")]
    #[garde(skip)]
    pub backend: StorageKind,

    /// S3-compatible endpoint (e.g. LocalStack, MinIO).
    #[serde(default = "default_endpoint")]
    #[garde(pattern(r"^https?://.+"))]
    pub endpoint_url: String,

    /// Region presented to the backend.
    #[serde(default = "default_region")]
    #[garde(length(min = 1))]
    pub region: String,

    /// Bucket used by the simplified `/upload` and `/download` endpoints.
    #[serde(default = "default_bucket")]
    #[garde(length(min = 3, max = 63))]
    pub default_bucket: String,

    /// Force path-style URL addressing (required by most emulators).
    #[serde(default = "default_true")]
    #[garde(skip)]
    pub force_path_style: bool,

    /// Explicit access key (falls back to the AWS credential chain).
    #[serde(default)]
    #[garde(skip)]
    pub access_key_id: String,

    /// Explicit secret key (falls back to the AWS credential chain).
    #[serde(default)]
    #[garde(skip)]
    pub secret_access_key: String,

    /// Upload buffer: bodies up to this size go out as one PUT, larger
    /// bodies as multipart uploads of parts this size.
    #[serde(default = "default_upload_part_size")]
    #[garde(range(min = 5_242_880))]
    pub upload_part_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_kind(),
            endpoint_url: default_endpoint(),
            region: default_region(),
            default_bucket: default_bucket(),
            force_path_style: true,
            access_key_id: String::new(),
            secret_access_key: String::new(),
            upload_part_size: default_upload_part_size(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_storage_kind() -> StorageKind {
    StorageKind::S3
}

fn default_endpoint() -> String {
    "http://localhost:4566".to_string()
}

fn default_region() -> String {
    "us-west-2".to_string()
}

fn default_bucket() -> String {
    "default-bucket".to_string()
}

fn default_upload_part_size() -> usize {
    32 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Durations ---------------------------------------------------------------

/// Parse a duration such as `500ms`, `15s`, `2m`, `1h`, or a bare number of
/// seconds.
pub fn parse_duration(raw: &str) -> anyhow::Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    if digits.is_empty() {
        anyhow::bail!("invalid duration '{raw}'");
    }
    let value: u64 = digits.parse()?;
    let duration = match unit.trim() {
        "" | "s" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        other => anyhow::bail!("invalid duration unit '{other}' in '{raw}'"),
    };
    Ok(duration)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

// -- Environment overrides ---------------------------------------------------

impl Config {
    /// Overlay environment variables onto this configuration.
    ///
    /// `lookup` is usually `std::env::var(..).ok()`; tests pass a map.
    /// Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("AWS_ENDPOINT") {
            self.storage.endpoint_url = v;
        }
        if let Some(v) = get("AWS_REGION") {
            self.storage.region = v;
        }
        if let Some(v) = get("AWS_S3_DEFAULT_BUCKET") {
            self.storage.default_bucket = v;
        }
        if let Some(v) = get("STORAGE_BACKEND") {
            self.storage.backend = v.parse()?;
        }
        if let Some(v) = get("HTTP_SERVER_ADDR") {
            self.server.addr = v;
        }
        if let Some(v) = get("HTTP_SERVER_READ_TIMEOUT") {
            self.server.read_timeout = parse_duration(&v)?;
        }
        if let Some(v) = get("HTTP_SERVER_WRITE_TIMEOUT") {
            self.server.write_timeout = parse_duration(&v)?;
        }
        if let Some(v) = get("HTTP_SERVER_IDLE_TIMEOUT") {
            self.server.idle_timeout = parse_duration(&v)?;
        }
        if let Some(v) = get("HTTP_SERVER_SHUTDOWN_TIMEOUT") {
            self.server.shutdown_timeout = parse_duration(&v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.logging.format = v;
        }
        Ok(())
    }
}

// -- Loader ------------------------------------------------------------------

/// Parse configuration from a YAML file at `path`.
pub fn load_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

/// Build the startup configuration: defaults, then the optional YAML file,
/// then process environment variables. Fails if the result does not
/// validate.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => load_file(path)?,
        None => Config::default(),
    };
    config.apply_env(|name| std::env::var(name).ok())?;
    config
        .validate()
        .map_err(|report| anyhow::anyhow!("invalid configuration: {report}"))?;
    Ok(config)
}
