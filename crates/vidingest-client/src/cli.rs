//! `vidingest-ctl` command definitions and reports.

use crate::config::ClientConfig;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use vidingest_auth::file::parse_credentials_file;
use vidingest_auth::{parse_iot_expiration, Clock, CredentialRecord, SystemClock, Timestamp};

/// Operator commands for validating client inputs offline.
#[derive(Parser)]
#[command(name = "vidingest-ctl")]
#[command(about = "vidingest operator CLI", long_about = None)]
pub struct Cli {
    /// Emit machine-readable JSON (reports and logs).
    #[arg(long, global = true)]
    pub json: bool,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands of [`Cli`].
#[derive(Subcommand)]
pub enum Command {
    /// Load and validate a client configuration file.
    CheckConfig {
        /// Path to the TOML configuration.
        #[arg(short, long, env = "VIDINGEST_CONFIG", default_value = "/etc/vidingest/client.toml")]
        config: PathBuf,
    },
    /// Parse a credentials file. The secret key is never printed.
    CheckCredentials {
        /// Credentials file starting with the `CREDENTIALS` token.
        path: PathBuf,
        /// Evaluate expiration against this instant (unix seconds).
        #[arg(long)]
        now: Option<u64>,
    },
    /// Parse an IoT-format expiration such as 2026-01-01T00:00:00Z.
    ParseExpiration {
        /// Expiration string to parse.
        value: String,
        /// Evaluate against this instant (unix seconds).
        #[arg(long)]
        now: Option<u64>,
    },
}

/// Effective settings of one configured stream.
#[derive(Debug, Serialize, PartialEq)]
pub struct StreamReport {
    /// Stream name.
    pub name: String,
    /// MIME type of the stream content.
    pub content_type: String,
    /// Retention requested at creation.
    pub retention_hours: u32,
    /// Number of tags applied after creation.
    pub tags: usize,
    /// Staleness window after health defaults.
    pub connection_staleness_secs: u64,
    /// Latency ceiling after health defaults.
    pub max_latency_secs: u64,
}

/// Summary printed by `check-config`.
#[derive(Debug, Serialize, PartialEq)]
pub struct ConfigReport {
    /// `bounded` or `continuous`.
    pub retry_mode: &'static str,
    /// Retries per call in bounded mode.
    pub max_retry_count: u32,
    /// Per-call completion timeout.
    pub service_call_timeout_ms: u64,
    /// Members allowed in the API callback chain.
    pub api_callback_chain_capacity: usize,
    /// Rotation period for static credentials.
    pub rotation_period_secs: u64,
    /// Whether the health monitor runs.
    pub health_enabled: bool,
    /// One entry per configured stream.
    pub streams: Vec<StreamReport>,
}

impl ConfigReport {
    /// Summarize a validated configuration.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            retry_mode: if config.continuous_retry {
                "continuous"
            } else {
                "bounded"
            },
            max_retry_count: config.max_retry_count,
            service_call_timeout_ms: config.service_call_timeout_ms,
            api_callback_chain_capacity: config.api_callback_chain_capacity,
            rotation_period_secs: config.rotation_period_secs,
            health_enabled: config.health.enabled,
            streams: config
                .streams
                .iter()
                .map(|s| StreamReport {
                    name: s.name.clone(),
                    content_type: s.content_type.clone(),
                    retention_hours: s.retention_hours,
                    tags: s.tags.len(),
                    connection_staleness_secs: s.connection_staleness(&config.health).as_secs(),
                    max_latency_secs: s.max_latency(&config.health).as_secs(),
                })
                .collect(),
        }
    }
}

/// Summary printed by `check-credentials`, without the secret.
#[derive(Debug, Serialize, PartialEq)]
pub struct CredentialReport {
    /// Access key identifier.
    pub access_key_id: String,
    /// Always `<redacted>`.
    pub secret_key: &'static str,
    /// Whether a non-empty session token is present.
    pub session_token: bool,
    /// Expiration as unix seconds.
    pub expiration_unix_secs: u64,
    /// Seconds left until expiration, zero once passed.
    pub expires_in_secs: u64,
}

impl CredentialReport {
    /// Summarize `record` as seen at `now`.
    pub fn from_record(record: &CredentialRecord, now: Timestamp) -> Self {
        Self {
            access_key_id: String::from_utf8_lossy(record.access_key_id()).into_owned(),
            secret_key: "<redacted>",
            session_token: record.session_token().is_some_and(|t| !t.is_empty()),
            expiration_unix_secs: record.expiration().as_unix_secs(),
            expires_in_secs: record.expiration().duration_since(now).as_secs(),
        }
    }
}

fn instant(now: Option<u64>) -> Timestamp {
    now.map(Timestamp::from_unix_secs)
        .unwrap_or_else(|| SystemClock.now())
}

impl Cli {
    /// Execute the parsed subcommand.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::CheckConfig { ref config } => self.check_config(config),
            Command::CheckCredentials { ref path, now } => self.check_credentials(path, now).await,
            Command::ParseExpiration { ref value, now } => self.parse_expiration(value, now),
        }
    }

    fn emit<T: Serialize + std::fmt::Debug>(&self, report: &T) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(report)?);
        } else {
            println!("{:#?}", report);
        }
        Ok(())
    }

    fn check_config(&self, path: &PathBuf) -> Result<()> {
        let config = ClientConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?;
        tracing::info!(path = %path.display(), streams = config.streams.len(), "config valid");
        self.emit(&ConfigReport::from_config(&config))
    }

    async fn check_credentials(&self, path: &PathBuf, now: Option<u64>) -> Result<()> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let now = instant(now);
        let record = parse_credentials_file(&contents, now)?;
        self.emit(&CredentialReport::from_record(&record, now))
    }

    fn parse_expiration(&self, value: &str, now: Option<u64>) -> Result<()> {
        let expiration = parse_iot_expiration(value, instant(now))?;
        if self.json {
            println!("{}", serde_json::json!({ "expiration_unix_secs": expiration.as_unix_secs() }));
        } else {
            println!("{} ({})", expiration.as_unix_secs(), expiration);
        }
        Ok(())
    }
}
