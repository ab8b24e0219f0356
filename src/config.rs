//! Configuration types.

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use secrecy::SecretString;

use crate::decoder::{DecoderOptions, MalformedPolicy};
use crate::error::ConfigError;
use crate::relay::RetryPolicy;

/// Default cap on a single message: 25 MiB.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 25 * 1024 * 1024;

/// Relay configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Where both artifacts are POSTed.
    pub webhook_url: Url,
    /// Sent as `Authorization: Bearer <token>` when set.
    pub webhook_token: Option<SecretString>,
    /// Per-POST timeout.
    pub http_timeout: Duration,
    /// Per-chunk timeout while reading the inbound stream.
    pub read_timeout: Duration,
    pub max_message_bytes: usize,
    pub malformed_policy: MalformedPolicy,
    pub retry: RetryPolicy,
    /// Bind address for the ingest server.
    pub listen_addr: SocketAddr,
    /// Relays allowed in flight at once.
    pub max_concurrent: usize,
    /// Daily-rolling log files go here when set.
    pub log_dir: Option<PathBuf>,
}

impl RelayConfig {
    /// Defaults for everything except the destination.
    pub fn new(webhook_url: Url) -> Self {
        Self {
            webhook_url,
            webhook_token: None,
            http_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            malformed_policy: MalformedPolicy::Replace,
            retry: RetryPolicy::default(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_concurrent: 16,
            log_dir: None,
        }
    }

    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let raw_url = get("RELAY_WEBHOOK_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("RELAY_WEBHOOK_URL".into()))?;
        let webhook_url = Url::parse(&raw_url).map_err(|e| invalid("RELAY_WEBHOOK_URL", e))?;
        if !matches!(webhook_url.scheme(), "http" | "https") {
            return Err(invalid(
                "RELAY_WEBHOOK_URL",
                format!("unsupported scheme '{}'", webhook_url.scheme()),
            ));
        }

        let mut config = Self::new(webhook_url);
        config.webhook_token = get("RELAY_WEBHOOK_TOKEN").map(SecretString::from);

        if let Some(secs) = parse_positive::<u64>(&get, "RELAY_HTTP_TIMEOUT_SECS")? {
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive::<u64>(&get, "RELAY_READ_TIMEOUT_SECS")? {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse::<usize>(&get, "RELAY_MAX_MESSAGE_BYTES")? {
            config.max_message_bytes = bytes;
        }
        if let Some(policy) = parse::<MalformedPolicy>(&get, "RELAY_MALFORMED_UTF8")? {
            config.malformed_policy = policy;
        }
        if let Some(attempts) = parse_positive::<u32>(&get, "RELAY_RETRY_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = parse::<u64>(&get, "RELAY_RETRY_BACKOFF_MS")? {
            config.retry.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(addr) = parse::<SocketAddr>(&get, "RELAY_LISTEN_ADDR")? {
            config.listen_addr = addr;
        }
        if let Some(n) = parse_positive::<usize>(&get, "RELAY_MAX_CONCURRENT")? {
            config.max_concurrent = n;
        }
        config.log_dir = get("RELAY_LOG_DIR").map(PathBuf::from);

        Ok(config)
    }

    /// Options for the [`StreamDecoder`](crate::decoder::StreamDecoder).
    pub fn decoder_options(&self) -> DecoderOptions {
        DecoderOptions {
            policy: self.malformed_policy,
            read_timeout: Some(self.read_timeout),
            max_bytes: Some(self.max_message_bytes),
        }
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    get(key)
        .map(|raw| raw.parse::<T>().map_err(|e| invalid(key, e)))
        .transpose()
}

/// Like [`parse`], but zero is rejected.
fn parse_positive<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr + Default + PartialEq,
    T::Err: Display,
{
    match parse::<T>(get, key)? {
        Some(value) if value == T::default() => Err(invalid(key, "must be at least 1")),
        other => Ok(other),
    }
}

fn invalid(key: &str, message: impl Display) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
