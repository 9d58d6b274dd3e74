//! Engine configuration (ambient addition), loaded from environment
//! variables via `dotenvy`, validated eagerly so a misconfigured process
//! fails at startup rather than mid-run.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Which `TokenStore`/`KvStore` backend to wire up at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    #[cfg(feature = "sled-store")]
    Sled { data_dir: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageBackend,
    /// Bound on the per-instance dispatch queue (§5 backpressure).
    pub dispatch_capacity: usize,
    /// How often the timing wheel ticks. The wheel's lowest level is
    /// second-granularity; this is not configurable per §4.4, only the
    /// service's own poll loops below are.
    pub timer_tick_interval: Duration,
    /// How often expired buffered messages are swept (§4.5).
    pub message_sweep_interval: Duration,
    /// How often ACTIVATED jobs past `lock_expires_at` are reclaimed (§4.6).
    pub job_timeout_sweep_interval: Duration,
    pub http_bind_addr: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let storage = match std::env::var("BPMN_STORAGE_BACKEND").ok().as_deref() {
            None | Some("memory") => StorageBackend::Memory,
            #[cfg(feature = "sled-store")]
            Some("sled") => StorageBackend::Sled {
                data_dir: std::env::var("BPMN_SLED_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            },
            Some(other) => {
                return Err(ConfigError::InvalidValue { key: "BPMN_STORAGE_BACKEND", value: other.to_string() })
            }
        };

        let dispatch_capacity = parse_env_or("BPMN_DISPATCH_CAPACITY", 256)?;
        let timer_tick_interval = Duration::from_millis(parse_env_or("BPMN_TIMER_TICK_MS", 1000)?);
        let message_sweep_interval = Duration::from_millis(parse_env_or("BPMN_MESSAGE_SWEEP_MS", 5000)?);
        let job_timeout_sweep_interval = Duration::from_millis(parse_env_or("BPMN_JOB_SWEEP_MS", 5000)?);
        let http_bind_addr = std::env::var("BPMN_HTTP_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8088".to_string());

        Ok(Self { storage, dispatch_capacity, timer_tick_interval, message_sweep_interval, job_timeout_sweep_interval, http_bind_addr })
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(default),
    }
}
