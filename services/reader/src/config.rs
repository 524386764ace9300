//! services/reader/src/config.rs
//!
//! Defines the client's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use crate::channel::ChannelConfig;
use crate::session::SessionConfig;
use crate::streaming::BufferConfig;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub server_ws_url: String,
    pub log_level: Level,
    pub channel: ChannelConfig,
    pub buffer: BufferConfig,
    pub session: SessionConfig,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let server_ws_url = std::env::var("READER_WS_URL")
            .map_err(|_| ConfigError::MissingVar("READER_WS_URL".to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Channel ---
        let channel_defaults = ChannelConfig::default();
        let channel = ChannelConfig {
            heartbeat_interval: env_millis("HEARTBEAT_INTERVAL_MS", channel_defaults.heartbeat_interval)?,
            reconnect_base: env_millis("RECONNECT_BASE_MS", channel_defaults.reconnect_base)?,
            reconnect_max: env_millis("RECONNECT_MAX_MS", channel_defaults.reconnect_max)?,
            max_reconnect_attempts: env_parse(
                "RECONNECT_MAX_ATTEMPTS",
                channel_defaults.max_reconnect_attempts,
            )?,
            request_timeout: env_millis("REQUEST_TIMEOUT_MS", channel_defaults.request_timeout)?,
        };

        // --- Streaming buffer ---
        let buffer_defaults = BufferConfig::default();
        let buffer = BufferConfig {
            low_threshold_secs: env_parse("BUFFER_LOW_SECS", buffer_defaults.low_threshold_secs)?,
            high_threshold_secs: env_parse("BUFFER_HIGH_SECS", buffer_defaults.high_threshold_secs)?,
            prefetch_when_empty: env_parse("PREFETCH_WHEN_EMPTY", buffer_defaults.prefetch_when_empty)?,
            prefetch_when_low: env_parse("PREFETCH_WHEN_LOW", buffer_defaults.prefetch_when_low)?,
        };
        if buffer.low_threshold_secs > buffer.high_threshold_secs {
            return Err(ConfigError::InvalidValue(
                "BUFFER_LOW_SECS".to_string(),
                "must not exceed BUFFER_HIGH_SECS".to_string(),
            ));
        }

        // --- Session ---
        let session_defaults = SessionConfig::default();
        let session = SessionConfig {
            sync_interval: env_millis("SYNC_INTERVAL_MS", session_defaults.sync_interval)?,
            context_words_before: env_parse(
                "CONTEXT_WORDS_BEFORE",
                session_defaults.context_words_before,
            )?,
            context_words_after: env_parse(
                "CONTEXT_WORDS_AFTER",
                session_defaults.context_words_after,
            )?,
            start_timeout: channel.request_timeout,
            ..session_defaults
        };

        Ok(Self {
            server_ws_url,
            log_level,
            channel,
            buffer,
            session,
        })
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(name, default.as_millis() as u64).map(Duration::from_millis)
}
