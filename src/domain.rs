use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::EtlError;

/// First month published by the archive.
pub const FIRST_PERIOD: Period = Period {
    year: 1959,
    month: 1,
};

/// One calendar month of hourly data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self, EtlError> {
        if !(1..=12).contains(&month) || !(1..=9999).contains(&year) {
            return Err(EtlError::InvalidPeriod(format!("{year}-{month}")));
        }
        Ok(Self { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn from_datetime(value: NaiveDateTime) -> Self {
        Self {
            year: value.year(),
            month: value.month(),
        }
    }

    fn index(&self) -> i64 {
        i64::from(self.year) * 12 + i64::from(self.month) - 1
    }

    fn from_index(index: i64) -> Self {
        Self {
            year: index.div_euclid(12) as i32,
            month: index.rem_euclid(12) as u32 + 1,
        }
    }

    pub fn next(&self) -> Self {
        Self::from_index(self.index() + 1)
    }

    pub fn prev(&self) -> Self {
        Self::from_index(self.index() - 1)
    }

    pub fn minus_months(&self, months: u32) -> Self {
        Self::from_index(self.index() - i64::from(months))
    }

    /// Signed number of months from `self` to `other`.
    pub fn months_between(&self, other: &Period) -> i64 {
        other.index() - self.index()
    }

    /// True when `self` is exactly the month after `previous`.
    pub fn is_consecutive_with(&self, previous: &Period) -> bool {
        previous.months_between(self) == 1
    }

    pub fn days_in_month(&self) -> u32 {
        match self.month {
            1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
            4 | 6 | 9 | 11 => 30,
            _ => {
                let leap =
                    (self.year % 4 == 0 && self.year % 100 != 0) || self.year % 400 == 0;
                if leap { 29 } else { 28 }
            }
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or_default()
    }

    pub fn first_hour(&self) -> NaiveDateTime {
        self.first_day().and_hms_opt(0, 0, 0).unwrap_or_default()
    }

    pub fn last_hour(&self) -> NaiveDateTime {
        self.first_hour() + Duration::hours(i64::from(self.hour_count()) - 1)
    }

    pub fn hour_count(&self) -> u32 {
        self.days_in_month() * 24
    }

    pub fn hourly_timestamps(&self) -> Vec<NaiveDateTime> {
        let start = self.first_hour();
        (0..i64::from(self.hour_count()))
            .map(|hour| start + Duration::hours(hour))
            .collect()
    }

    pub fn range_inclusive(start: Period, end: Period) -> Vec<Period> {
        let mut periods = Vec::new();
        let mut current = start;
        while current <= end {
            periods.push(current);
            current = current.next();
        }
        periods
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = EtlError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let parts = trimmed.split('-').collect::<Vec<_>>();
        let invalid = || EtlError::InvalidPeriod(value.to_string());
        if parts.len() < 2 || parts.len() > 3 {
            return Err(invalid());
        }
        let year: i32 = parts[0].parse().map_err(|_| invalid())?;
        let month: u32 = parts[1].parse().map_err(|_| invalid())?;
        let period = Period::new(year, month).map_err(|_| invalid())?;
        if let Some(day) = parts.get(2) {
            let day: u32 = day.parse().map_err(|_| invalid())?;
            if day == 0 || day > period.days_in_month() {
                return Err(invalid());
            }
        }
        Ok(period)
    }
}

/// Last timestamp reported for a store that has never been written: the day
/// before the first period.
pub fn sentinel_last_timestamp(first_period: Period) -> NaiveDateTime {
    first_period.first_hour() - Duration::days(1)
}

pub fn is_day_complete(timestamp: NaiveDateTime) -> bool {
    timestamp.hour() == 23
}

/// Product category; each selects a fixed set of archive variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Forecast,
    Analysis,
}

const FORECAST_VARIABLES: &[&str] = &[
    "total_precipitation",
    "maximum_2m_temperature_since_previous_post_processing",
    "minimum_2m_temperature_since_previous_post_processing",
    "surface_solar_radiation_downwards",
];

const ANALYSIS_VARIABLES: &[&str] = &[
    "100m_u_component_of_wind",
    "100m_v_component_of_wind",
    "10m_u_component_of_wind",
    "10m_v_component_of_wind",
    "2m_dewpoint_temperature",
    "2m_temperature",
    "mean_sea_level_pressure",
    "sea_surface_temperature",
    "surface_pressure",
];

impl Kind {
    pub const ALL: [Kind; 2] = [Kind::Forecast, Kind::Analysis];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Forecast => "forecast",
            Kind::Analysis => "analysis",
        }
    }

    /// Archive request names, in fetch order.
    pub fn archive_variables(&self) -> &'static [&'static str] {
        match self {
            Kind::Forecast => FORECAST_VARIABLES,
            Kind::Analysis => ANALYSIS_VARIABLES,
        }
    }

    pub fn default_output_path(&self) -> String {
        format!("era5/{}.zarr", self.as_str())
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Kind {
    type Err = EtlError;

    /// Accepts kind names, their short forms and store names such as
    /// `era5/forecast.zarr`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let name = value.trim().trim_end_matches('/');
        let name = name.rsplit('/').next().unwrap_or(name);
        let name = name.strip_suffix(".zarr").unwrap_or(name);
        match name.to_ascii_lowercase().as_str() {
            "forecast" | "fc" => Ok(Kind::Forecast),
            "analysis" | "an" => Ok(Kind::Analysis),
            _ => Err(EtlError::InvalidKind(value.to_string())),
        }
    }
}
