//! Client configuration loaded from TOML or JSON.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vidingest_auth::provider::{MAX_ENFORCED_TOKEN_EXPIRATION_DURATION, MAX_STREAM_NAME_LEN};

use crate::chain::{DEFAULT_CALLBACK_CHAIN_COUNT, MAX_CALLBACK_CHAIN_COUNT};
use crate::error::{ClientError, ClientResult};
use crate::health::HealthConfig;
use crate::retry::{retry_policy, BackoffConfig, RetryPolicy};
use crate::service::{SERVICE_CALL_DEFAULT_TIMEOUT, SERVICE_CALL_MAX_RETRY_COUNT};

/// Delay between retries of a failed service call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    /// Default: 100.
    pub initial_ms: u64,
    /// Default: 10000.
    pub max_ms: u64,
    /// Default: 2.0.
    pub multiplier: f64,
    /// Default: true.
    pub jitter: bool,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffSettings {
    /// Convert to the retry layer's backoff parameters.
    pub fn to_backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_backoff: Duration::from_millis(self.initial_ms),
            max_backoff: Duration::from_millis(self.max_ms),
            backoff_multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// Connection health monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Default: true.
    pub enabled: bool,
    /// Default: 1000.
    pub sample_interval_ms: u64,
    /// No ack for this long marks a connection stale. Default: 60.
    pub connection_staleness_secs: u64,
    /// Buffered, unacknowledged duration that counts as latency pressure.
    /// Default: 60.
    pub max_latency_secs: u64,
    /// Default: 30.
    pub quiet_period_secs: u64,
    /// Default: 60.
    pub back_to_normal_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_ms: 1000,
            connection_staleness_secs: 60,
            max_latency_secs: 60,
            quiet_period_secs: 30,
            back_to_normal_secs: 60,
        }
    }
}

impl HealthSettings {
    /// Monitor timings; thresholds stay per stream.
    pub fn to_health_config(&self) -> HealthConfig {
        HealthConfig {
            sample_interval: Duration::from_millis(self.sample_interval_ms),
            quiet_period: Duration::from_secs(self.quiet_period_secs),
            back_to_normal: Duration::from_secs(self.back_to_normal_secs),
        }
    }
}

/// One stream the client should create and upload to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Stream name, at most 256 bytes.
    pub name: String,
    /// Empty means "use the device fingerprint when the auth source has one".
    pub device_name: String,
    /// Default: "video/h264".
    pub content_type: String,
    /// Default: 0 (no retention).
    pub retention_hours: u32,
    /// Key used to encrypt the stream at rest, if any.
    pub kms_key_id: Option<String>,
    /// Tags applied once the stream exists.
    pub tags: BTreeMap<String, String>,
    /// Overrides `health.connection_staleness_secs`.
    pub connection_staleness_secs: Option<u64>,
    /// Overrides `health.max_latency_secs`.
    pub max_latency_secs: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            device_name: String::new(),
            content_type: String::from("video/h264"),
            retention_hours: 0,
            kms_key_id: None,
            tags: BTreeMap::new(),
            connection_staleness_secs: None,
            max_latency_secs: None,
        }
    }
}

impl StreamConfig {
    /// Defaults with the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add or replace one tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Tags as ordered key/value pairs.
    pub fn tag_list(&self) -> Vec<(String, String)> {
        self.tags
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Staleness window, falling back to `health`.
    pub fn connection_staleness(&self, health: &HealthSettings) -> Duration {
        Duration::from_secs(
            self.connection_staleness_secs
                .unwrap_or(health.connection_staleness_secs),
        )
    }

    /// Latency ceiling, falling back to `health`.
    pub fn max_latency(&self, health: &HealthSettings) -> Duration {
        Duration::from_secs(self.max_latency_secs.unwrap_or(health.max_latency_secs))
    }

    /// Reject an empty or over-long name.
    pub fn validate(&self) -> ClientResult<()> {
        if self.name.is_empty() {
            return Err(ClientError::invalid_arg("stream name is empty"));
        }
        if self.name.len() > MAX_STREAM_NAME_LEN {
            return Err(ClientError::invalid_arg(format!(
                "stream name is {} bytes, max {}",
                self.name.len(),
                MAX_STREAM_NAME_LEN
            )));
        }
        Ok(())
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default: 5.
    pub api_callback_chain_capacity: usize,
    /// Never give up on retriable failures. Default: false.
    pub continuous_retry: bool,
    /// Default: 5.
    pub max_retry_count: u32,
    /// Default: 5000.
    pub service_call_timeout_ms: u64,
    /// Rotation period for static credentials. Default: 2400 (40 minutes).
    pub rotation_period_secs: u64,
    /// Retry backoff.
    pub backoff: BackoffSettings,
    /// Health monitor settings.
    pub health: HealthSettings,
    /// Streams started by `create_configured_streams`.
    pub streams: Vec<StreamConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_callback_chain_capacity: DEFAULT_CALLBACK_CHAIN_COUNT,
            continuous_retry: false,
            max_retry_count: SERVICE_CALL_MAX_RETRY_COUNT,
            service_call_timeout_ms: SERVICE_CALL_DEFAULT_TIMEOUT.as_millis() as u64,
            rotation_period_secs: MAX_ENFORCED_TOKEN_EXPIRATION_DURATION.as_secs(),
            backoff: BackoffSettings::default(),
            health: HealthSettings::default(),
            streams: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Load from a `.toml` or `.json` file and validate.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ClientConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check capacities, periods and every stream.
    pub fn validate(&self) -> ClientResult<()> {
        if self.api_callback_chain_capacity == 0
            || self.api_callback_chain_capacity > MAX_CALLBACK_CHAIN_COUNT
        {
            return Err(ClientError::invalid_arg(format!(
                "api_callback_chain_capacity {} outside 1..={}",
                self.api_callback_chain_capacity, MAX_CALLBACK_CHAIN_COUNT
            )));
        }
        if self.rotation_period() > MAX_ENFORCED_TOKEN_EXPIRATION_DURATION {
            return Err(ClientError::invalid_arg(format!(
                "rotation_period_secs {} above the enforced maximum {}",
                self.rotation_period_secs,
                MAX_ENFORCED_TOKEN_EXPIRATION_DURATION.as_secs()
            )));
        }
        if self.health.sample_interval_ms == 0 {
            return Err(ClientError::invalid_arg("health.sample_interval_ms is zero"));
        }
        for stream in &self.streams {
            stream.validate()?;
        }
        Ok(())
    }

    /// Per-call completion timeout.
    pub fn service_call_timeout(&self) -> Duration {
        Duration::from_millis(self.service_call_timeout_ms)
    }

    /// Rotation period for static credentials.
    pub fn rotation_period(&self) -> Duration {
        Duration::from_secs(self.rotation_period_secs)
    }

    /// Bounded or continuous policy per `continuous_retry`.
    pub fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        retry_policy(
            self.continuous_retry,
            self.max_retry_count,
            self.backoff.to_backoff(),
        )
    }
}
