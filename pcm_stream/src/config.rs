use crate::connection::BackoffPolicy;
use crate::types::StreamEndpoint;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Firmware defaults for the bridge host.
pub const DEFAULT_HOST: &str = "192.168.1.2";
pub const DEFAULT_PORT: u16 = 9002;

pub const HOST_ENV: &str = "PCM_STREAM_HOST";
pub const PORT_ENV: &str = "PCM_STREAM_PORT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Server host must not be empty")]
    EmptyHost,

    #[error("Server port must not be 0")]
    ZeroPort,

    #[error("Invalid timing: {0}")]
    InvalidTiming(String),

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Delays used by the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTiming {
    /// Wait after a failed connect
    pub connect_backoff: BackoffPolicy,
    /// Wait after tearing down a connection before reconnecting
    pub close_delay: Duration,
    /// Wait between capture polls while no block is ready
    pub poll_interval: Duration,
}

impl Default for StreamTiming {
    fn default() -> Self {
        Self {
            connect_backoff: BackoffPolicy::default(),
            close_delay: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(5),
        }
    }
}

/// Everything the streamers need, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub endpoint: StreamEndpoint,
    pub timing: StreamTiming,
}

/// One source of settings. Unset fields fall through to lower layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub connect_retry_ms: Option<u64>,
    /// When set, connect retries back off exponentially up to this cap
    pub max_connect_retry_ms: Option<u64>,
    pub close_delay_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

impl ConfigLayer {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup(PORT_ENV) {
            Some(value) => Some(value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: PORT_ENV.to_string(),
                value: value.clone(),
            })?),
            None => None,
        };

        Ok(Self {
            host: lookup(HOST_ENV),
            port,
            ..Self::default()
        })
    }

    /// Fields set in `upper` win.
    pub fn merge(self, upper: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            host: upper.host.or(self.host),
            port: upper.port.or(self.port),
            connect_retry_ms: upper.connect_retry_ms.or(self.connect_retry_ms),
            max_connect_retry_ms: upper.max_connect_retry_ms.or(self.max_connect_retry_ms),
            close_delay_ms: upper.close_delay_ms.or(self.close_delay_ms),
            poll_interval_ms: upper.poll_interval_ms.or(self.poll_interval_ms),
        }
    }

    pub fn build(self) -> Result<StreamConfig, ConfigError> {
        let host = self.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
        if host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        let port = self.port.unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(ConfigError::ZeroPort);
        }

        let defaults = StreamTiming::default();
        let retry = self
            .connect_retry_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.connect_backoff.delay(1));
        let connect_backoff = match self.max_connect_retry_ms {
            Some(max_ms) => {
                let max = Duration::from_millis(max_ms);
                if max < retry {
                    return Err(ConfigError::InvalidTiming(format!(
                        "max_connect_retry_ms ({}) is below connect_retry_ms ({})",
                        max_ms,
                        retry.as_millis()
                    )));
                }
                BackoffPolicy::Exponential {
                    initial: retry,
                    max,
                }
            }
            None => BackoffPolicy::Fixed(retry),
        };

        let poll_interval = self
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);
        if poll_interval.is_zero() {
            return Err(ConfigError::InvalidTiming(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }

        Ok(StreamConfig {
            endpoint: StreamEndpoint::new(host.trim(), port),
            timing: StreamTiming {
                connect_backoff,
                close_delay: self
                    .close_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.close_delay),
                poll_interval,
            },
        })
    }
}

/// Resolve configuration: defaults, then the optional file, then the
/// environment (including `.env`), then `cli`.
pub fn load_config(file: Option<&Path>, cli: ConfigLayer) -> Result<StreamConfig, ConfigError> {
    // Don't error if .env doesn't exist
    dotenvy::dotenv().ok();

    let mut layer = ConfigLayer::default();
    if let Some(path) = file {
        log::info!("📄 Loading config from {}", path.display());
        layer = layer.merge(ConfigLayer::from_file(path)?);
    }
    layer = layer.merge(ConfigLayer::from_env()?).merge(cli);

    let config = layer.build()?;
    log::info!(
        "⚙️  Server {} (connect backoff {:?}, close delay {:?}, poll {:?})",
        config.endpoint,
        config.timing.connect_backoff,
        config.timing.close_delay,
        config.timing.poll_interval
    );
    Ok(config)
}
