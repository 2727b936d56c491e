//! Server configuration

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tickfeed_services::{ConsumerConfig, MemoryStreamConfig, RedisStreamConfig, SessionConfig};

/// Errors loading the server configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Configuration for the tick feed server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port the HTTP listener binds to
    pub port: u16,
    /// Path that upgrades to the WebSocket feed
    pub ws_path: String,
    pub session: SessionConfig,
    pub consumer: ConsumerConfig,
    /// Read timeout and retention, shared by both stream backends
    pub stream: MemoryStreamConfig,
    /// Redis server holding the symbol streams; the in-process source is
    /// used when unset
    pub redis_url: Option<String>,
    /// Initial bucket count of the subscription maps
    pub registry_buckets: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            ws_path: "/cpp/ws".to_string(),
            session: SessionConfig::default(),
            consumer: ConsumerConfig::default(),
            stream: MemoryStreamConfig::default(),
            redis_url: None,
            registry_buckets: 16,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// Recognized:
    /// - SERVER_PORT
    /// - WS_PATH
    /// - HEARTBEAT_INTERVAL_SECS, HEARTBEAT_TIMEOUT_SECS, WRITE_TIMEOUT_SECS
    /// - STREAM_BLOCK_MS, STREAM_MAX_LEN, STREAM_RETRY_DELAY_MS
    /// - REDIS_URL
    /// - REGISTRY_BUCKETS
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let ws_path = lookup("WS_PATH").unwrap_or(defaults.ws_path);
        if !ws_path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                key: "WS_PATH",
                value: ws_path,
                reason: "must start with '/'".to_string(),
            });
        }

        Ok(Self {
            port: parse(&lookup, "SERVER_PORT", defaults.port)?,
            ws_path,
            session: SessionConfig {
                heartbeat_interval: secs(
                    &lookup,
                    "HEARTBEAT_INTERVAL_SECS",
                    defaults.session.heartbeat_interval,
                )?,
                heartbeat_timeout: secs(
                    &lookup,
                    "HEARTBEAT_TIMEOUT_SECS",
                    defaults.session.heartbeat_timeout,
                )?,
                write_timeout: secs(&lookup, "WRITE_TIMEOUT_SECS", defaults.session.write_timeout)?,
            },
            consumer: ConsumerConfig {
                retry_delay: millis(
                    &lookup,
                    "STREAM_RETRY_DELAY_MS",
                    defaults.consumer.retry_delay,
                )?,
            },
            stream: MemoryStreamConfig {
                block: millis(&lookup, "STREAM_BLOCK_MS", defaults.stream.block)?,
                max_len: positive(&lookup, "STREAM_MAX_LEN", defaults.stream.max_len as u64)?
                    as usize,
            },
            redis_url: lookup("REDIS_URL")
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty()),
            registry_buckets: positive(
                &lookup,
                "REGISTRY_BUCKETS",
                defaults.registry_buckets as u64,
            )? as usize,
        })
    }
}

impl ServerConfig {
    /// Settings for the Redis source, if one is configured
    pub fn redis_stream(&self) -> Option<RedisStreamConfig> {
        self.redis_url.as_ref().map(|url| RedisStreamConfig {
            url: url.clone(),
            block: self.stream.block,
            max_len: self.stream.max_len,
        })
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key,
                reason: e.to_string(),
                value,
            }),
    }
}

fn positive<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse(lookup, key, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn secs<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    positive(lookup, key, default.as_secs()).map(Duration::from_secs)
}

fn millis<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    positive(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}
