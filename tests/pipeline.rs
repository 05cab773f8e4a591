use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::NaiveDate;
use ndarray::{ArrayD, IxDyn};
use serde_json::Value;

use era5_etl::cds::{ArchiveClient, RetrieveRequest};
use era5_etl::compact::CompactionOutcome;
use era5_etl::dataset::{
    ArrayData, Attrs, Dataset, Variable, datetime_to_seconds, time_encoding_attrs,
};
use era5_etl::domain::{Kind, Period};
use era5_etl::error::EtlError;
use era5_etl::fetch::Fetcher;
use era5_etl::netcdf_reader::DatasetReader;
use era5_etl::pipeline::{Pipeline, PipelineSettings, RunOptions, determine_next_period};
use era5_etl::retry::RetryPolicy;
use era5_etl::schema::canonical_for_request;
use era5_etl::storage::{Protocol, ReadableWritableListableStorage, StorageOptions};
use era5_etl::store::{Chunking, ZarrStore};
use zarrs::storage::store::MemoryStore;

/// Records requests and leaves `<variable>\n<YYYY-MM>` in the destination
/// so the reader can rebuild the month.
#[derive(Default)]
struct MockArchive {
    requests: Mutex<Vec<String>>,
}

impl MockArchive {
    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl ArchiveClient for &MockArchive {
    fn retrieve(
        &self,
        _dataset: &str,
        request: &RetrieveRequest,
        destination: &Path,
    ) -> Result<(), EtlError> {
        self.requests
            .lock()
            .unwrap()
            .push(format!("{}-{} {}", request.year, request.month, request.variable));
        fs::write(
            destination,
            format!("{}\n{}-{}", request.variable, request.year, request.month),
        )
        .map_err(|err| EtlError::Filesystem(err.to_string()))
    }
}

/// Builds a tiny 2 x 3 grid for the month named in the file, using the
/// short names the archive would.
struct MockReader;

fn short_name(canonical: &str) -> &'static str {
    match canonical {
        "air_temperature_at_2_metres" => "t2m",
        "air_temperature_at_2_metres_1hour_Maximum" => "mx2t",
        "air_temperature_at_2_metres_1hour_Minimum" => "mn2t",
        "precipitation_amount_1hour_Accumulation" => "tp",
        "integral_wrt_time_of_surface_direct_downwelling_shortwave_flux_in_air_1hour_Accumulation" => "ssrd",
        "surface_air_pressure" => "sp",
        "sea_surface_temperature" => "sst",
        "eastward_wind_at_10_metres" => "u10",
        "eastward_wind_at_100_metres" => "u100",
        "northward_wind_at_10_metres" => "v10",
        "northward_wind_at_100_metres" => "v100",
        "air_pressure_at_mean_sea_level" => "msl",
        "dew_point_temperature_at_2_metres" => "d2m",
        other => panic!("no short name for {other}"),
    }
}

fn month_dataset(short: &str, period: Period) -> Dataset {
    let times = period
        .hourly_timestamps()
        .into_iter()
        .map(datetime_to_seconds)
        .collect::<Vec<_>>();
    let steps = times.len();
    let mut attrs = Attrs::new();
    attrs.insert("history".to_string(), Value::from("retrieved from the archive"));
    Dataset::new(
        attrs,
        vec![
            Variable::new(
                "longitude",
                &["longitude"],
                ArrayData::F32(ArrayD::from_shape_vec(IxDyn(&[3]), vec![0.0, 0.25, 0.5]).unwrap()),
            ),
            Variable::new(
                "latitude",
                &["latitude"],
                ArrayData::F32(ArrayD::from_shape_vec(IxDyn(&[2]), vec![90.0, 89.75]).unwrap()),
            ),
            Variable::new(
                "time",
                &["time"],
                ArrayData::I64(ArrayD::from_shape_vec(IxDyn(&[steps]), times).unwrap()),
            )
            .with_attrs(time_encoding_attrs()),
            Variable::new(
                short,
                &["time", "latitude", "longitude"],
                ArrayData::F32(ArrayD::from_elem(IxDyn(&[steps, 2, 3]), 280.0)),
            ),
        ],
    )
}

impl DatasetReader for MockReader {
    fn open(&self, path: &Path) -> Result<Dataset, EtlError> {
        let content =
            fs::read_to_string(path).map_err(|err| EtlError::Filesystem(err.to_string()))?;
        let (request, period) = content.split_once('\n').unwrap();
        let canonical = canonical_for_request(request).unwrap();
        Ok(month_dataset(short_name(canonical), period.parse().unwrap()))
    }
}

fn settings(first_period: Period) -> PipelineSettings {
    PipelineSettings {
        chunking: Chunking::default(),
        first_period,
        publication_lag_months: 2,
    }
}

fn pipeline<'a>(
    kind: Kind,
    archive: &'a MockArchive,
    storage: &ReadableWritableListableStorage,
    first_period: Period,
) -> Pipeline<&'a MockArchive, MockReader> {
    pipeline_on(kind, archive, ZarrStore::new(storage.clone(), "memory://"), first_period)
}

fn pipeline_on(
    kind: Kind,
    archive: &MockArchive,
    store: ZarrStore,
    first_period: Period,
) -> Pipeline<&MockArchive, MockReader> {
    let fetcher = Fetcher::new(
        archive,
        MockReader,
        "reanalysis-era5-single-levels",
        RetryPolicy::new(10, Duration::ZERO),
    );
    Pipeline::new(kind, fetcher, store, settings(first_period))
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 8, 15).unwrap()
}

fn period(value: &str) -> Period {
    value.parse().unwrap()
}

#[test]
fn empty_store_loads_first_period_of_analysis() {
    let archive = MockArchive::default();
    let storage: ReadableWritableListableStorage = Arc::new(MemoryStore::new());
    let pipeline = pipeline(Kind::Analysis, &archive, &storage, period("1959-01"));

    let summary = pipeline
        .run(
            RunOptions {
                start_period: None,
                end_period: Some(period("1959-01")),
            },
            today(),
        )
        .unwrap();

    assert_eq!(summary.periods, vec!["1959-01"]);
    assert_eq!(summary.last_timestamp.as_deref(), Some("1959-01-31T23:00:00"));
    assert_eq!(archive.calls(), 9);
    assert_matches!(summary.compaction, CompactionOutcome::Completed(_));

    let store = pipeline.store();
    let names = store.consolidated().unwrap().array_names();
    assert_eq!(names.len(), 12);
    assert!(names.contains(&"dew_point_temperature_at_2_metres".to_string()));
    assert!(!names.contains(&"time1_bounds".to_string()));
    assert_eq!(store.read_time_axis().unwrap().len(), 31 * 24);
}

#[test]
fn next_period_follows_the_store_and_gaps_fail_before_fetching() {
    let archive = MockArchive::default();
    let storage: ReadableWritableListableStorage = Arc::new(MemoryStore::new());
    let seeded = pipeline(Kind::Forecast, &archive, &storage, period("2020-05"));
    seeded
        .run(
            RunOptions {
                start_period: None,
                end_period: Some(period("2020-05")),
            },
            today(),
        )
        .unwrap();
    assert_eq!(archive.calls(), 4);

    let store = ZarrStore::new(storage.clone(), "memory://");
    let state = determine_next_period(&store, period("1959-01")).unwrap();
    assert_eq!(state.last_timestamp.to_string(), "2020-05-31 23:00:00");
    assert_eq!(state.next, period("2020-06"));

    let later = pipeline(Kind::Forecast, &archive, &storage, period("1959-01"));
    assert_matches!(
        later.run(
            RunOptions {
                start_period: Some(period("2020-04")),
                end_period: None,
            },
            today(),
        ),
        Err(EtlError::NonConsecutivePeriod { .. })
    );
    assert_eq!(archive.calls(), 4);

    assert_eq!(
        later.plan(None, None, today()).unwrap(),
        vec![period("2020-06")]
    );
    let summary = later.run(RunOptions::default(), today()).unwrap();
    assert_eq!(summary.periods, vec!["2020-06"]);
    assert_eq!(summary.last_timestamp.as_deref(), Some("2020-06-30T23:00:00"));
    assert_eq!(archive.calls(), 8);

    let time = later.store().consolidated().unwrap().array("time").unwrap();
    assert_eq!(time.shape, vec![(31 + 30) * 24]);
    assert_eq!(time.chunks, time.shape);
    assert_eq!(
        later.store().list_fragments("time").unwrap(),
        vec!["0", "zarr.json"]
    );
}

#[test]
fn forecast_store_carries_time_bounds() {
    let archive = MockArchive::default();
    let storage: ReadableWritableListableStorage = Arc::new(MemoryStore::new());
    let pipeline = pipeline(Kind::Forecast, &archive, &storage, period("2021-02"));
    pipeline
        .run(
            RunOptions {
                start_period: None,
                end_period: Some(period("2021-02")),
            },
            today(),
        )
        .unwrap();

    let store = pipeline.store();
    let bounds = store.read_array("time1_bounds").unwrap();
    let time = store.read_array("time").unwrap();
    let bounds = bounds.as_i64().unwrap();
    let time = time.as_i64().unwrap();
    assert_eq!(bounds.shape(), &[28 * 24, 2]);
    for (step, t) in time.iter().enumerate() {
        assert_eq!(bounds[[step, 0]], t - 10_800);
        assert_eq!(bounds[[step, 1]], *t);
    }
    let data = store.consolidated().unwrap().array("precipitation_amount_1hour_Accumulation").unwrap();
    assert_eq!(data.chunks, vec![24, 2, 3]);
}

#[test]
fn store_ending_mid_day_is_rejected() {
    let archive = MockArchive::default();
    let storage: ReadableWritableListableStorage = Arc::new(MemoryStore::new());
    let store = ZarrStore::new(storage.clone(), "memory://");
    let noon = NaiveDate::from_ymd_opt(2020, 5, 31)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap();
    let time = Variable::new(
        "time",
        &["time"],
        ArrayData::I64(ArrayD::from_elem(IxDyn(&[1]), datetime_to_seconds(noon))),
    );
    store
        .write(&Dataset::new(Attrs::new(), vec![time]), Chunking::default())
        .unwrap();

    let pipeline = pipeline(Kind::Analysis, &archive, &storage, period("1959-01"));
    assert_matches!(
        pipeline.run(RunOptions::default(), today()),
        Err(EtlError::NotDayComplete { hour: 12, .. })
    );
    assert_eq!(archive.calls(), 0);
}

#[test]
fn up_to_date_store_skips_compaction() {
    let archive = MockArchive::default();
    let storage: ReadableWritableListableStorage = Arc::new(MemoryStore::new());
    let pipeline = pipeline(Kind::Forecast, &archive, &storage, period("2020-07"));
    let summary = pipeline.run(RunOptions::default(), today()).unwrap();
    // default end is 2020-06, before the first period
    assert!(summary.periods.is_empty());
    assert_eq!(summary.compaction, CompactionOutcome::Skipped);
    assert_eq!(summary.last_timestamp, None);
    assert_eq!(archive.calls(), 0);
}

#[test]
fn failed_compaction_leaves_the_run_successful() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path().join("forecast.zarr");
    let path = root.to_str().unwrap();
    // occupies the key the single time chunk is written to
    fs::create_dir_all(root.join("time").join("0").join("occupied")).unwrap();

    let archive = MockArchive::default();
    let store = ZarrStore::open(Protocol::File, path, &StorageOptions::default()).unwrap();
    let pipeline = pipeline_on(Kind::Forecast, &archive, store, period("2020-05"));
    let summary = pipeline
        .run(
            RunOptions {
                start_period: None,
                end_period: Some(period("2020-06")),
            },
            today(),
        )
        .unwrap();

    assert_eq!(summary.periods, vec!["2020-05", "2020-06"]);
    assert_eq!(summary.last_timestamp.as_deref(), Some("2020-06-30T23:00:00"));
    assert_matches!(summary.compaction, CompactionOutcome::Failed { .. });

    let reopened = ZarrStore::open(Protocol::File, path, &StorageOptions::default()).unwrap();
    assert_eq!(reopened.read_time_axis().unwrap().len(), (31 + 30) * 24);
    assert_eq!(
        reopened.last_timestamp().unwrap().unwrap().to_string(),
        "2020-06-30 23:00:00"
    );
    let bounds = reopened.consolidated().unwrap().array("time1_bounds").unwrap();
    assert_eq!(bounds.shape, vec![(31 + 30) * 24, 2]);
    assert_eq!(
        determine_next_period(&reopened, period("1959-01")).unwrap().next,
        period("2020-07")
    );
}
