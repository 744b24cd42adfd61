//! Server configuration from environment variables.
//!
//! | variable                    | default     |
//! |-----------------------------|-------------|
//! | `HOST`                      | `localhost` |
//! | `PORT`                      | `1234`      |
//! | `YPERSISTENCE`              | unset       |
//! | `GC`                        | `true`      |
//! | `PING_INTERVAL` (ms)        | `30000`     |
//! | `TLS_CERT` / `TLS_KEY`      | unset       |
//! | `CALLBACK_URL`              | unset       |
//! | `CALLBACK_DEBOUNCE_WAIT`    | `2000`      |
//! | `CALLBACK_DEBOUNCE_MAXWAIT` | `10000`     |
//! | `CALLBACK_TIMEOUT`          | `5000`      |
//! | `CALLBACK_OBJECTS`          | `{}`        |

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::callback::CallbackConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a number, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("{var} must be greater than zero")]
    ZeroDuration { var: &'static str },
    #[error("TLS_CERT and TLS_KEY must be set together")]
    IncompleteTls,
    #[error("CALLBACK_OBJECTS is not a valid object map: {0}")]
    InvalidCallbackObjects(#[from] serde_json::Error),
}

/// PEM files for serving `wss://`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// RocksDB directory; rooms are persisted only when set
    pub persistence_dir: Option<PathBuf>,
    /// `false` keeps deleted document content
    pub gc: bool,
    pub ping_interval: Duration,
    pub tls: Option<TlsConfig>,
    pub callback: Option<CallbackConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1234,
            persistence_dir: None,
            gc: true,
            ping_interval: Duration::from_millis(30_000),
            tls: None,
            callback: None,
        }
    }
}

impl ServerConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset and empty values use defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|value| !value.is_empty());
        let defaults = Self::default();

        let tls = match (get("TLS_CERT"), get("TLS_KEY")) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert: cert.into(),
                key: key.into(),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTls),
        };

        let callback = match get("CALLBACK_URL") {
            Some(url) => {
                let mut callback = CallbackConfig::new(url);
                callback.debounce_wait =
                    millis("CALLBACK_DEBOUNCE_WAIT", get("CALLBACK_DEBOUNCE_WAIT"), callback.debounce_wait)?;
                callback.debounce_max_wait = millis(
                    "CALLBACK_DEBOUNCE_MAXWAIT",
                    get("CALLBACK_DEBOUNCE_MAXWAIT"),
                    callback.debounce_max_wait,
                )?;
                callback.timeout = millis("CALLBACK_TIMEOUT", get("CALLBACK_TIMEOUT"), callback.timeout)?;
                if let Some(objects) = get("CALLBACK_OBJECTS") {
                    callback.objects = serde_json::from_str(&objects)?;
                }
                Some(callback)
            }
            None => None,
        };

        Ok(Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: number("PORT", get("PORT"), defaults.port)?,
            persistence_dir: get("YPERSISTENCE").map(PathBuf::from),
            gc: get("GC").is_none_or(|gc| gc != "false" && gc != "0"),
            ping_interval: nonzero_millis("PING_INTERVAL", get("PING_INTERVAL"), defaults.ping_interval)?,
            tls,
            callback,
        })
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn number<T: std::str::FromStr>(var: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        None => Ok(default),
    }
}

fn millis(var: &'static str, value: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    let ms = number(var, value, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

fn nonzero_millis(var: &'static str, value: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    let duration = millis(var, value, default)?;
    if duration.is_zero() {
        return Err(ConfigError::ZeroDuration { var });
    }
    Ok(duration)
}
