//! In-memory labelled arrays.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use ndarray::ArrayD;
use serde_json::Value;

use crate::error::EtlError;

pub type Attrs = BTreeMap<String, Value>;

/// Canonical encoding of every time value held in memory and in the store.
pub const TIME_UNITS: &str = "seconds since 1970-01-01 00:00:00";
pub const TIME_CALENDAR: &str = "proleptic_gregorian";

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    I64(ArrayD<i64>),
}

impl ArrayData {
    pub fn shape(&self) -> &[usize] {
        match self {
            ArrayData::F32(values) => values.shape(),
            ArrayData::F64(values) => values.shape(),
            ArrayData::I64(values) => values.shape(),
        }
    }

    /// Zarr data type name.
    pub fn dtype(&self) -> &'static str {
        match self {
            ArrayData::F32(_) => "float32",
            ArrayData::F64(_) => "float64",
            ArrayData::I64(_) => "int64",
        }
    }

    pub fn as_i64(&self) -> Option<&ArrayD<i64>> {
        match self {
            ArrayData::I64(values) => Some(values),
            _ => None,
        }
    }

    /// Values widened to f64, for extents and summaries.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            ArrayData::F32(values) => values.iter().map(|v| f64::from(*v)).collect(),
            ArrayData::F64(values) => values.iter().copied().collect(),
            ArrayData::I64(values) => values.iter().map(|v| *v as f64).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub dims: Vec<String>,
    pub data: ArrayData,
    pub attrs: Attrs,
}

impl Variable {
    pub fn new(name: impl Into<String>, dims: &[&str], data: ArrayData) -> Self {
        Self {
            name: name.into(),
            dims: dims.iter().map(|dim| dim.to_string()).collect(),
            data,
            attrs: Attrs::new(),
        }
    }

    pub fn with_attrs(mut self, attrs: Attrs) -> Self {
        self.attrs = attrs;
        self
    }

    /// A coordinate is a one-dimensional variable named after its dimension.
    pub fn is_coordinate(&self) -> bool {
        self.dims.len() == 1 && self.dims[0] == self.name
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub attrs: Attrs,
    pub variables: Vec<Variable>,
}

impl Dataset {
    pub fn new(attrs: Attrs, variables: Vec<Variable>) -> Self {
        Self { attrs, variables }
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|var| var.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        self.variables.iter().map(|var| var.name.as_str()).collect()
    }

    pub fn data_vars(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter().filter(|var| !var.is_coordinate())
    }

    pub fn coords(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter().filter(|var| var.is_coordinate())
    }

    /// Replaces a variable of the same name in place, or appends it.
    pub fn insert(&mut self, variable: Variable) {
        match self.variables.iter_mut().find(|var| var.name == variable.name) {
            Some(slot) => *slot = variable,
            None => self.variables.push(variable),
        }
    }

    /// Length of a dimension, taken from the first variable that uses it.
    pub fn dim_len(&self, dim: &str) -> Option<usize> {
        self.variables.iter().find_map(|var| {
            var.dims
                .iter()
                .position(|name| name == dim)
                .map(|axis| var.data.shape()[axis])
        })
    }

    /// Time coordinate in canonical seconds.
    pub fn time_values(&self) -> Result<&ArrayD<i64>, EtlError> {
        self.get("time")
            .and_then(|var| var.data.as_i64())
            .ok_or_else(|| EtlError::Dataset("missing integer time coordinate".to_string()))
    }

    pub fn timestamps(&self) -> Result<Vec<NaiveDateTime>, EtlError> {
        self.time_values()?
            .iter()
            .map(|secs| seconds_to_datetime(*secs))
            .collect()
    }
}

pub fn seconds_to_datetime(secs: i64) -> Result<NaiveDateTime, EtlError> {
    DateTime::from_timestamp(secs, 0)
        .map(|value| value.naive_utc())
        .ok_or_else(|| EtlError::Dataset(format!("time value out of range: {secs}")))
}

pub fn datetime_to_seconds(value: NaiveDateTime) -> i64 {
    value.and_utc().timestamp()
}

/// A parsed CF `"<unit> since <reference>"` time encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeEncoding {
    pub unit_secs: i64,
    pub reference: NaiveDateTime,
}

impl TimeEncoding {
    pub fn parse(units: &str) -> Result<Self, EtlError> {
        let invalid = || EtlError::Dataset(format!("unsupported time units: {units}"));
        let (unit, reference) = units.split_once(" since ").ok_or_else(invalid)?;
        let unit_secs = match unit.trim().to_ascii_lowercase().as_str() {
            "seconds" | "second" | "s" => 1,
            "minutes" | "minute" => 60,
            "hours" | "hour" | "h" => 3_600,
            "days" | "day" | "d" => 86_400,
            _ => return Err(invalid()),
        };
        let reference = parse_reference(reference.trim()).ok_or_else(invalid)?;
        Ok(Self {
            unit_secs,
            reference,
        })
    }

    /// Converts an encoded value to canonical seconds since the Unix epoch.
    pub fn to_epoch_seconds(&self, value: f64) -> i64 {
        datetime_to_seconds(self.reference) + (value * self.unit_secs as f64).round() as i64
    }
}

fn parse_reference(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim_end_matches('Z').trim_end_matches(" UTC");
    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed);
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

/// Attributes written alongside canonical time values.
pub fn time_encoding_attrs() -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert("units".to_string(), Value::from(TIME_UNITS));
    attrs.insert("calendar".to_string(), Value::from(TIME_CALENDAR));
    attrs
}
