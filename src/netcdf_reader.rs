use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use serde_json::Value;

use crate::dataset::{ArrayData, Attrs, Dataset, TimeEncoding, Variable, time_encoding_attrs};
use crate::error::EtlError;

/// Opens a downloaded archive file as a [`Dataset`].
pub trait DatasetReader: Send + Sync {
    fn open(&self, path: &Path) -> Result<Dataset, EtlError>;
}

/// Reads netCDF files: packed integers are unpacked with `scale_factor` /
/// `add_offset`, fill values become NaN and the time axis is converted to
/// canonical seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetcdfReader;

impl DatasetReader for NetcdfReader {
    fn open(&self, path: &Path) -> Result<Dataset, EtlError> {
        let file = netcdf::open(path).map_err(|err| {
            EtlError::Netcdf(format!("open {}: {err}", path.display()))
        })?;

        let attrs = file
            .attributes()
            .filter_map(|attr| {
                let value = attr.value().ok().and_then(attribute_to_json)?;
                Some((attr.name().to_string(), value))
            })
            .collect::<Attrs>();

        let mut variables = Vec::new();
        for var in file.variables() {
            let name = var.name();
            let dims = var
                .dimensions()
                .iter()
                .map(|dim| dim.name())
                .collect::<Vec<_>>();
            let shape = var
                .dimensions()
                .iter()
                .map(|dim| dim.len())
                .collect::<Vec<_>>();
            let mut attrs = var
                .attributes()
                .filter_map(|attr| {
                    let value = attr.value().ok().and_then(attribute_to_json)?;
                    Some((attr.name().to_string(), value))
                })
                .collect::<Attrs>();

            let data = if name == "time" {
                let raw = var
                    .get_values::<f64, _>(..)
                    .map_err(|err| EtlError::Netcdf(format!("read {name}: {err}")))?;
                let units = attrs
                    .get("units")
                    .and_then(Value::as_str)
                    .ok_or_else(|| EtlError::Netcdf("time has no units".to_string()))?;
                let encoding = TimeEncoding::parse(units)?;
                let values = raw
                    .iter()
                    .map(|value| encoding.to_epoch_seconds(*value))
                    .collect::<Vec<_>>();
                attrs.remove("units");
                attrs.remove("calendar");
                attrs.extend(time_encoding_attrs());
                ArrayData::I64(to_array(&shape, values, &name)?)
            } else {
                let raw = var
                    .get_values::<f32, _>(..)
                    .map_err(|err| EtlError::Netcdf(format!("read {name}: {err}")))?;
                let values = unpack(&raw, &mut attrs);
                ArrayData::F32(to_array(&shape, values, &name)?)
            };

            variables.push(Variable {
                name,
                dims,
                data,
                attrs,
            });
        }

        Ok(Dataset::new(attrs, variables))
    }
}

fn to_array<T>(shape: &[usize], values: Vec<T>, name: &str) -> Result<ArrayD<T>, EtlError> {
    ArrayD::from_shape_vec(IxDyn(shape), values)
        .map_err(|err| EtlError::Netcdf(format!("{name}: {err}")))
}

/// Applies CF packing attributes and removes them from `attrs`.
fn unpack(raw: &[f32], attrs: &mut Attrs) -> Vec<f32> {
    let scale = attrs.remove("scale_factor").and_then(|v| v.as_f64());
    let offset = attrs.remove("add_offset").and_then(|v| v.as_f64());
    let fills = ["_FillValue", "missing_value"]
        .iter()
        .filter_map(|key| attrs.remove(*key).and_then(|v| v.as_f64()))
        .map(|fill| fill as f32)
        .collect::<Vec<_>>();
    if scale.is_none() && offset.is_none() && fills.is_empty() {
        return raw.to_vec();
    }

    raw.iter()
        .map(|value| {
            if fills.contains(value) {
                return f32::NAN;
            }
            let unpacked = f64::from(*value) * scale.unwrap_or(1.0) + offset.unwrap_or(0.0);
            unpacked as f32
        })
        .collect()
}

fn attribute_to_json(value: netcdf::AttributeValue) -> Option<Value> {
    use netcdf::AttributeValue as A;
    let json = match value {
        A::Str(text) => Value::from(text),
        A::Strs(texts) => Value::from(texts),
        A::Double(v) => Value::from(v),
        A::Doubles(v) => Value::from(v),
        A::Float(v) => Value::from(f64::from(v)),
        A::Floats(v) => Value::from(v.into_iter().map(f64::from).collect::<Vec<_>>()),
        A::Short(v) => Value::from(v),
        A::Shorts(v) => Value::from(v),
        A::Int(v) => Value::from(v),
        A::Ints(v) => Value::from(v),
        A::Longlong(v) => Value::from(v),
        A::Longlongs(v) => Value::from(v),
        A::Uchar(v) => Value::from(v),
        A::Schar(v) => Value::from(v),
        A::Ushort(v) => Value::from(v),
        A::Uint(v) => Value::from(v),
        A::Ulonglong(v) => Value::from(v),
        _ => return None,
    };
    Some(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpack_applies_scale_offset_and_fill() {
        let mut attrs = Attrs::new();
        attrs.insert("scale_factor".to_string(), Value::from(0.5));
        attrs.insert("add_offset".to_string(), Value::from(100.0));
        attrs.insert("missing_value".to_string(), Value::from(-32767));
        attrs.insert("units".to_string(), Value::from("K"));

        let values = unpack(&[0.0, 2.0, -32767.0], &mut attrs);
        assert_eq!(values[0], 100.0);
        assert_eq!(values[1], 101.0);
        assert!(values[2].is_nan());
        assert_eq!(attrs.len(), 1);
    }

    #[test]
    fn unpack_without_packing_is_identity() {
        let mut attrs = Attrs::new();
        assert_eq!(unpack(&[1.25, -3.0], &mut attrs), vec![1.25, -3.0]);
    }

    #[test]
    fn float_attributes_widen() {
        let value = attribute_to_json(netcdf::AttributeValue::Float(0.5)).unwrap();
        assert_eq!(value, Value::from(0.5));
    }
}
