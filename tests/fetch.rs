use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use assert_matches::assert_matches;

use era5_etl::cds::{ArchiveClient, RetrieveRequest, build_query};
use era5_etl::dataset::{Attrs, Dataset};
use era5_etl::domain::Period;
use era5_etl::error::EtlError;
use era5_etl::fetch::Fetcher;
use era5_etl::netcdf_reader::DatasetReader;
use era5_etl::retry::RetryPolicy;

/// Fails with `failure` for the first `failures` calls, then writes a file.
struct FlakyArchive {
    failures: usize,
    failure: fn() -> EtlError,
    calls: Mutex<Vec<PathBuf>>,
}

impl FlakyArchive {
    fn new(failures: usize, failure: fn() -> EtlError) -> Self {
        Self {
            failures,
            failure,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl ArchiveClient for &FlakyArchive {
    fn retrieve(
        &self,
        _dataset: &str,
        request: &RetrieveRequest,
        destination: &Path,
    ) -> Result<(), EtlError> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(destination.to_path_buf());
        if calls.len() <= self.failures {
            return Err((self.failure)());
        }
        fs::write(destination, &request.variable)
            .map_err(|err| EtlError::Filesystem(err.to_string()))
    }
}

struct NameReader;

impl DatasetReader for NameReader {
    fn open(&self, path: &Path) -> Result<Dataset, EtlError> {
        let name = fs::read_to_string(path).map_err(|err| EtlError::Filesystem(err.to_string()))?;
        let mut attrs = Attrs::new();
        attrs.insert("variable".to_string(), name.into());
        Ok(Dataset::new(attrs, Vec::new()))
    }
}

fn reset() -> EtlError {
    EtlError::ConnectionReset("connection reset by peer".to_string())
}

fn fetcher(archive: &FlakyArchive) -> Fetcher<&FlakyArchive, NameReader> {
    Fetcher::new(
        archive,
        NameReader,
        "reanalysis-era5-single-levels",
        RetryPolicy::new(10, Duration::ZERO),
    )
}

fn june() -> Period {
    Period::new(2020, 6).unwrap()
}

#[test]
fn nine_resets_then_success_makes_ten_calls() {
    let archive = FlakyArchive::new(9, reset);
    let workdir = tempfile::tempdir().unwrap();

    let dataset = fetcher(&archive)
        .fetch("2m_temperature", june(), workdir.path())
        .unwrap();

    assert_eq!(archive.calls(), 10);
    assert_eq!(dataset.attrs["variable"], "2m_temperature");
    let calls = archive.calls.lock().unwrap();
    assert!(calls.iter().all(|path| path == &workdir.path().join("2m_temperature.nc")));
}

#[test]
fn persistent_resets_give_up_after_ten_calls() {
    let archive = FlakyArchive::new(usize::MAX, reset);
    let workdir = tempfile::tempdir().unwrap();

    let result = fetcher(&archive).fetch("2m_temperature", june(), workdir.path());

    assert_matches!(result, Err(EtlError::RetriesExhausted { attempts: 10, .. }));
    assert_eq!(archive.calls(), 10);
}

#[test]
fn other_archive_errors_fail_at_once() {
    let archive = FlakyArchive::new(usize::MAX, || EtlError::ArchiveStatus {
        status: 403,
        message: "licence not accepted".to_string(),
    });
    let workdir = tempfile::tempdir().unwrap();

    let result = fetcher(&archive).fetch("total_precipitation", june(), workdir.path());

    assert_matches!(result, Err(EtlError::ArchiveStatus { status: 403, .. }));
    assert_eq!(archive.calls(), 1);
}

#[test]
fn query_covers_every_day_and_hour_of_the_month() {
    let request = build_query("surface_pressure", Period::new(2020, 2).unwrap());
    assert_eq!(request.product_type, "reanalysis");
    assert_eq!(request.format, "netcdf");
    assert_eq!(request.year, "2020");
    assert_eq!(request.month, "02");
    assert_eq!(request.day.len(), 29);
    assert_eq!(request.day.last().map(String::as_str), Some("29"));
    assert_eq!(request.time.len(), 24);
    assert_eq!(request.time[0], "00:00");
    assert_eq!(request.time[23], "23:00");
}
