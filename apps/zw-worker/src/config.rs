use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use zw_engine::alerts::{BackoffConfig, DEFAULT_BACKOFF_SECS};

/// Scalar runtime configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub state_dir: PathBuf,
    /// Max detections claimed per occupancy run.
    pub chunk_size: i64,
    pub occupancy_interval: Duration,
    pub alert_interval: Duration,
    pub backoff: BackoffConfig,
    /// Open occupancy rows older than this are ignored by the
    /// standalone alert pass.
    pub alert_freshness: chrono::Duration,
}

/// Read an env var and parse it, falling back to `default` when the
/// variable is unset or unparseable.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            worker_id: std::env::var("ZW_WORKER_ID").unwrap_or_else(|_| "worker".to_string()),
            state_dir: std::env::var("ZW_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("state")),
            chunk_size: env_or("ZW_CHUNK_SIZE", 5000),
            occupancy_interval: Duration::from_secs(env_or("ZW_OCCUPANCY_INTERVAL_SECS", 10)),
            alert_interval: Duration::from_secs(env_or("ZW_ALERT_INTERVAL_SECS", 5)),
            backoff: BackoffConfig {
                unknown_secs: env_or("ZW_ALERT_UNKNOWN_BACKOFF_SECS", DEFAULT_BACKOFF_SECS),
                unauthorized_secs: env_or(
                    "ZW_ALERT_UNAUTHORIZED_BACKOFF_SECS",
                    DEFAULT_BACKOFF_SECS,
                ),
                overstay_secs: env_or("ZW_ALERT_OVERSTAY_BACKOFF_SECS", DEFAULT_BACKOFF_SECS),
            },
            alert_freshness: chrono::Duration::seconds(env_or("ZW_ALERT_FRESHNESS_SECS", 86_400)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_parses_and_falls_back() {
        std::env::set_var("ZW_TEST_CHUNK", "250");
        assert_eq!(env_or("ZW_TEST_CHUNK", 5000i64), 250);
        std::env::set_var("ZW_TEST_CHUNK", "not a number");
        assert_eq!(env_or("ZW_TEST_CHUNK", 5000i64), 5000);
        std::env::remove_var("ZW_TEST_CHUNK");
        assert_eq!(env_or("ZW_TEST_CHUNK", 5000i64), 5000);
    }
}
