use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;
use tempfile::Builder;
use tracing::{info, warn};

use crate::assemble::assemble;
use crate::cds::ArchiveClient;
use crate::compact::{CompactionOutcome, TIME_DIMENSION, compact_advisory};
use crate::config::ResolvedConfig;
use crate::dataset::Dataset;
use crate::domain::{Kind, Period, is_day_complete, sentinel_last_timestamp};
use crate::error::EtlError;
use crate::fetch::Fetcher;
use crate::netcdf_reader::DatasetReader;
use crate::store::{Chunking, ZarrStore};
use crate::transform::transform;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Where a store stands: its last timestamp (or the sentinel for an empty
/// store) and the period to fetch next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextPeriod {
    pub last_timestamp: NaiveDateTime,
    pub next: Period,
}

impl NextPeriod {
    pub fn last_period(&self) -> Period {
        Period::from_datetime(self.last_timestamp)
    }
}

pub fn determine_next_period(
    store: &ZarrStore,
    first_period: Period,
) -> Result<NextPeriod, EtlError> {
    let Some(last_timestamp) = store.last_timestamp()? else {
        return Ok(NextPeriod {
            last_timestamp: sentinel_last_timestamp(first_period),
            next: first_period,
        });
    };
    if !is_day_complete(last_timestamp) {
        return Err(EtlError::NotDayComplete {
            hour: last_timestamp.hour(),
            timestamp: last_timestamp.format(TIMESTAMP_FORMAT).to_string(),
        });
    }
    Ok(NextPeriod {
        last_timestamp,
        next: Period::from_datetime(last_timestamp).next(),
    })
}

/// `start` must be the month right after the store's last period.
pub fn check_consecutive(start: Period, state: &NextPeriod) -> Result<(), EtlError> {
    if start.is_consecutive_with(&state.last_period()) {
        return Ok(());
    }
    Err(EtlError::NonConsecutivePeriod {
        start: start.to_string(),
        last: state.last_timestamp.format(TIMESTAMP_FORMAT).to_string(),
    })
}

/// The latest month the archive is assumed to have published.
pub fn default_end_period(today: NaiveDate, publication_lag_months: u32) -> Period {
    let month_start = today.and_hms_opt(0, 0, 0).unwrap_or_default();
    Period::from_datetime(month_start).minus_months(publication_lag_months)
}

/// The assembled time axis must be exactly the hours of `period`.
pub fn validate_time_axis(dataset: &Dataset, period: Period) -> Result<(), EtlError> {
    let actual = dataset.timestamps()?;
    let expected = period.hourly_timestamps();
    let unexpected = |reason: String| EtlError::UnexpectedTimeAxis {
        period: period.to_string(),
        reason,
    };
    if actual.len() != expected.len() {
        return Err(unexpected(format!(
            "{} steps, expected {}",
            actual.len(),
            expected.len()
        )));
    }
    if let Some((index, (got, want))) = actual
        .iter()
        .zip(&expected)
        .enumerate()
        .find(|(_, (got, want))| got != want)
    {
        return Err(unexpected(format!("step {index} is {got}, expected {want}")));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub start_period: Option<Period>,
    pub end_period: Option<Period>,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub chunking: Chunking,
    pub first_period: Period,
    pub publication_lag_months: u32,
}

impl From<&ResolvedConfig> for PipelineSettings {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            chunking: Chunking {
                time_chunk: config.time_chunk,
            },
            first_period: config.first_period,
            publication_lag_months: config.publication_lag_months,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub kind: Kind,
    pub store: String,
    pub periods: Vec<String>,
    pub last_timestamp: Option<String>,
    pub compaction: CompactionOutcome,
}

/// Brings one kind's store up to date, a month at a time.
pub struct Pipeline<C: ArchiveClient, R: DatasetReader> {
    kind: Kind,
    fetcher: Fetcher<C, R>,
    store: ZarrStore,
    settings: PipelineSettings,
}

impl<C: ArchiveClient, R: DatasetReader> Pipeline<C, R> {
    pub fn new(kind: Kind, fetcher: Fetcher<C, R>, store: ZarrStore, settings: PipelineSettings) -> Self {
        Self {
            kind,
            fetcher,
            store,
            settings,
        }
    }

    pub fn store(&self) -> &ZarrStore {
        &self.store
    }

    /// Periods a run would process. Fails before any archive traffic when the
    /// store is not day-complete or `start` does not follow it.
    pub fn plan(
        &self,
        start: Option<Period>,
        end: Option<Period>,
        today: NaiveDate,
    ) -> Result<Vec<Period>, EtlError> {
        let state = determine_next_period(&self.store, self.settings.first_period)?;
        let start = start.unwrap_or(state.next);
        check_consecutive(start, &state)?;
        let end =
            end.unwrap_or_else(|| default_end_period(today, self.settings.publication_lag_months));
        Ok(Period::range_inclusive(start, end))
    }

    pub fn run(&self, options: RunOptions, today: NaiveDate) -> Result<RunSummary, EtlError> {
        let periods = self.plan(options.start_period, options.end_period, today)?;
        match (periods.first(), periods.last()) {
            (Some(first), Some(last)) => {
                info!("{}: processing {first} to {last}", self.kind)
            }
            _ => info!("{}: store {} is up to date", self.kind, self.store.location()),
        }

        let mut appended = Vec::with_capacity(periods.len());
        for period in periods {
            self.process_period(period)?;
            appended.push(period.to_string());
        }

        let compaction = if appended.is_empty() {
            CompactionOutcome::Skipped
        } else {
            compact_advisory(&self.store)
        };
        if let CompactionOutcome::Failed { error } = &compaction {
            warn!("compaction can be retried with the compact command: {error}");
        }

        let last_timestamp = self
            .store
            .last_timestamp()?
            .map(|ts| ts.format(TIMESTAMP_FORMAT).to_string());
        Ok(RunSummary {
            kind: self.kind,
            store: self.store.location(),
            periods: appended,
            last_timestamp,
            compaction,
        })
    }

    /// Fetch, transform, assemble and commit one month.
    pub fn process_period(&self, period: Period) -> Result<(), EtlError> {
        let state = determine_next_period(&self.store, self.settings.first_period)?;
        check_consecutive(period, &state)?;

        let workdir = Builder::new()
            .prefix("era5-etl-")
            .tempdir()
            .map_err(|err| EtlError::Filesystem(err.to_string()))?;
        let variables = self.kind.archive_variables();
        let mut transformed = Vec::with_capacity(variables.len());
        for (index, variable) in variables.iter().enumerate() {
            info!("{period} - {variable} [{} / {}]", index + 1, variables.len());
            let raw = self.fetcher.fetch(variable, period, workdir.path())?;
            transformed.push(transform(raw)?);
        }

        let assembled = assemble(transformed)?;
        validate_time_axis(&assembled, period)?;
        if self.store.exists()? {
            self.store.append(&assembled, TIME_DIMENSION)?;
        } else {
            self.store.write(&assembled, self.settings.chunking)?;
        }
        info!("{period} committed to {}", self.store.location());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ndarray::{ArrayD, IxDyn};

    use super::*;
    use crate::dataset::{ArrayData, Attrs, Variable, datetime_to_seconds};
    use crate::storage::{Protocol, StorageOptions};

    fn memory_store() -> ZarrStore {
        ZarrStore::open(Protocol::Memory, "", &StorageOptions::default()).unwrap()
    }

    fn store_ending_at(timestamps: &[&str]) -> ZarrStore {
        let values = timestamps
            .iter()
            .map(|ts| {
                datetime_to_seconds(NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).unwrap())
            })
            .collect::<Vec<_>>();
        let time = Variable::new(
            "time",
            &["time"],
            ArrayData::I64(ArrayD::from_shape_vec(IxDyn(&[values.len()]), values).unwrap()),
        );
        let store = memory_store();
        store
            .write(&Dataset::new(Attrs::new(), vec![time]), Chunking::default())
            .unwrap();
        store
    }

    #[test]
    fn empty_store_starts_at_first_period() {
        let store = memory_store();
        let first = Period::new(1959, 1).unwrap();
        let state = determine_next_period(&store, first).unwrap();
        assert_eq!(state.next, first);
        assert_eq!(state.last_timestamp.to_string(), "1958-12-31 00:00:00");
        assert_eq!(state.last_period(), Period::new(1958, 12).unwrap());
    }

    #[test]
    fn next_period_follows_last_hour() {
        let store = store_ending_at(&["2020-05-31T22:00:00", "2020-05-31T23:00:00"]);
        let state = determine_next_period(&store, Period::new(1959, 1).unwrap()).unwrap();
        assert_eq!(state.next, Period::new(2020, 6).unwrap());
    }

    #[test]
    fn partial_day_is_rejected() {
        let store = store_ending_at(&["2020-05-31T12:00:00"]);
        assert_matches!(
            determine_next_period(&store, Period::new(1959, 1).unwrap()),
            Err(EtlError::NotDayComplete { hour: 12, .. })
        );
    }

    #[test]
    fn default_end_lags_two_months() {
        let today = NaiveDate::from_ymd_opt(2021, 2, 17).unwrap();
        assert_eq!(default_end_period(today, 2), Period::new(2020, 12).unwrap());
    }

    #[test]
    fn gap_and_overlap_are_not_consecutive() {
        let state = NextPeriod {
            last_timestamp: NaiveDateTime::parse_from_str("2020-05-31T23:00:00", TIMESTAMP_FORMAT)
                .unwrap(),
            next: Period::new(2020, 6).unwrap(),
        };
        assert!(check_consecutive(Period::new(2020, 6).unwrap(), &state).is_ok());
        assert_matches!(
            check_consecutive(Period::new(2020, 4).unwrap(), &state),
            Err(EtlError::NonConsecutivePeriod { .. })
        );
        assert_matches!(
            check_consecutive(Period::new(2020, 8).unwrap(), &state),
            Err(EtlError::NonConsecutivePeriod { .. })
        );
    }
}
