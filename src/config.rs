use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cds::{DEFAULT_ARCHIVE_DATASET, DEFAULT_ARCHIVE_URL};
use crate::domain::{FIRST_PERIOD, Period};
use crate::error::EtlError;
use crate::retry::{DEFAULT_DELAY, DEFAULT_MAX_ATTEMPTS, RetryPolicy};
use crate::store::DEFAULT_TIME_CHUNK;

pub const DEFAULT_CONFIG_FILE: &str = "era5-etl.json";
pub const DEFAULT_PUBLICATION_LAG_MONTHS: u32 = 2;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STORAGE_ACCOUNT: &str = "cpdataeuwest";

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub archive_url: Option<String>,
    #[serde(default)]
    pub archive_dataset: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub publication_lag_months: Option<u32>,
    #[serde(default)]
    pub time_chunk: Option<u64>,
    #[serde(default)]
    pub storage_account: Option<String>,
    #[serde(default)]
    pub first_period: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub delay_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub archive_url: String,
    pub archive_dataset: String,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    pub publication_lag_months: u32,
    pub time_chunk: u64,
    pub storage_account: String,
    pub first_period: Period,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            archive_url: DEFAULT_ARCHIVE_URL.to_string(),
            archive_dataset: DEFAULT_ARCHIVE_DATASET.to_string(),
            retry: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            publication_lag_months: DEFAULT_PUBLICATION_LAG_MONTHS,
            time_chunk: DEFAULT_TIME_CHUNK,
            storage_account: DEFAULT_STORAGE_ACCOUNT.to_string(),
            first_period: FIRST_PERIOD,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// An explicit path must exist; the default file is optional.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, EtlError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(ResolvedConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| EtlError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| EtlError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, EtlError> {
        let defaults = ResolvedConfig::default();

        let retry = match config.retry {
            Some(retry) => {
                let max_attempts = retry.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
                if max_attempts == 0 {
                    return Err(EtlError::ConfigParse(
                        "retry.max_attempts must be at least 1".to_string(),
                    ));
                }
                let delay = retry
                    .delay_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_DELAY);
                RetryPolicy::new(max_attempts, delay)
            }
            None => defaults.retry,
        };

        let time_chunk = config.time_chunk.unwrap_or(defaults.time_chunk);
        if time_chunk == 0 {
            return Err(EtlError::ConfigParse("time_chunk must be positive".to_string()));
        }

        let first_period = match config.first_period {
            Some(value) => value.parse()?,
            None => defaults.first_period,
        };

        Ok(ResolvedConfig {
            archive_url: config.archive_url.unwrap_or(defaults.archive_url),
            archive_dataset: config.archive_dataset.unwrap_or(defaults.archive_dataset),
            retry,
            poll_interval: config
                .poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            publication_lag_months: config
                .publication_lag_months
                .unwrap_or(defaults.publication_lag_months),
            time_chunk,
            storage_account: config.storage_account.unwrap_or(defaults.storage_account),
            first_period,
        })
    }
}
