use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use era5_etl::config::{Config, ConfigLoader, RetryConfig};
use era5_etl::domain::Period;
use era5_etl::error::EtlError;
use era5_etl::pipeline::PipelineSettings;

#[test]
fn parse_config_overrides() {
    let config: Config = serde_json::from_str(
        r#"{
            "archive_url": "https://archive.example/api/v2",
            "retry": { "max_attempts": 3 },
            "poll_interval_secs": 1,
            "publication_lag_months": 3,
            "time_chunk": 48,
            "first_period": "1979-01"
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.archive_url, "https://archive.example/api/v2");
    assert_eq!(resolved.archive_dataset, "reanalysis-era5-single-levels");
    assert_eq!(resolved.retry.max_attempts, 3);
    assert_eq!(resolved.retry.delay, Duration::from_secs(5));
    assert_eq!(resolved.poll_interval, Duration::from_secs(1));
    assert_eq!(resolved.storage_account, "cpdataeuwest");

    let settings = PipelineSettings::from(&resolved);
    assert_eq!(settings.chunking.time_chunk, 48);
    assert_eq!(settings.publication_lag_months, 3);
    assert_eq!(settings.first_period, Period::new(1979, 1).unwrap());
}

#[test]
fn zero_attempts_are_rejected() {
    let config = Config {
        retry: Some(RetryConfig {
            max_attempts: Some(0),
            delay_secs: None,
        }),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(EtlError::ConfigParse(_))
    );
}

#[test]
fn unknown_fields_and_bad_periods_fail() {
    let temp = tempfile::tempdir().unwrap();
    let unknown = temp.path().join("unknown.json");
    fs::write(&unknown, r#"{ "proteins": [] }"#).unwrap();
    assert_matches!(
        ConfigLoader::resolve(unknown.to_str()),
        Err(EtlError::ConfigParse(_))
    );

    let bad_period = temp.path().join("period.json");
    fs::write(&bad_period, r#"{ "first_period": "1959-13" }"#).unwrap();
    assert_matches!(
        ConfigLoader::resolve(bad_period.to_str()),
        Err(EtlError::InvalidPeriod(_))
    );
}

#[test]
fn explicit_missing_file_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("missing.json");
    assert_matches!(
        ConfigLoader::resolve(missing.to_str()),
        Err(EtlError::ConfigRead(_))
    );
}
