use std::collections::HashMap;

use ndarray::{Array2, Axis};
use tracing::debug;

use crate::dataset::{ArrayData, Dataset, Variable, time_encoding_attrs};
use crate::error::EtlError;
use crate::schema::{
    BOUNDS_DIMENSION, COORDINATES, PROVENANCE_ATTRS, TIME_BOUNDS_OFFSET_SECS,
    TIME_BOUNDS_VARIABLE, attributes_for, canonical_name, dataset_attrs, has_time_bounds,
};

/// Relabels an archive dataset into the published naming and attribute
/// schema. Applying it to its own output is a no-op.
pub fn transform(raw: Dataset) -> Result<Dataset, EtlError> {
    let Dataset {
        mut attrs,
        variables,
    } = raw;

    let renames: HashMap<String, &'static str> = variables
        .iter()
        .filter_map(|var| canonical_name(&var.name).map(|name| (var.name.clone(), name)))
        .collect();

    let mut variables = variables
        .into_iter()
        .map(|mut var| {
            if let Some(name) = renames.get(&var.name) {
                var.name = name.to_string();
            }
            for dim in var.dims.iter_mut() {
                if let Some(name) = renames.get(dim.as_str()) {
                    *dim = name.to_string();
                }
            }
            var
        })
        .collect::<Vec<_>>();

    attrs.extend(dataset_attrs());
    for key in PROVENANCE_ATTRS {
        if let Some(dropped) = attrs.remove(key) {
            debug!("dropping {key} {dropped}");
        }
    }

    for var in variables.iter_mut() {
        if var.name == TIME_BOUNDS_VARIABLE {
            continue;
        }
        let record = attributes_for(&var.name)
            .ok_or_else(|| EtlError::MissingAttributes(var.name.clone()))?;
        var.attrs.extend(record.to_attrs());
    }

    let mut result = Dataset::new(attrs, Vec::new());
    for coordinate in COORDINATES {
        let position = variables
            .iter()
            .position(|var| var.name == coordinate)
            .ok_or_else(|| EtlError::Dataset(format!("missing coordinate '{coordinate}'")))?;
        result.variables.push(variables.remove(position));
    }
    for var in variables {
        if var.is_coordinate() {
            debug!("dropping extra coordinate {}", var.name);
            continue;
        }
        result.variables.push(var);
    }

    if result.data_vars().any(|var| has_time_bounds(&var.name)) {
        debug!("adding {TIME_BOUNDS_VARIABLE} for {:?}", result.names());
        let bounds = time_bounds(&result)?;
        result.insert(bounds);
    }

    Ok(result)
}

/// `[t - offset, t]` for every timestamp `t`, as a `(time, nv)` array.
pub fn time_bounds(dataset: &Dataset) -> Result<Variable, EtlError> {
    let time = dataset.time_values()?;
    let mut bounds = Array2::<i64>::zeros((time.len(), 2));
    for (mut row, t) in bounds.axis_iter_mut(Axis(0)).zip(time.iter()) {
        row[0] = t - TIME_BOUNDS_OFFSET_SECS;
        row[1] = *t;
    }
    Ok(Variable::new(
        TIME_BOUNDS_VARIABLE,
        &["time", BOUNDS_DIMENSION],
        ArrayData::I64(bounds.into_dyn()),
    )
    .with_attrs(time_encoding_attrs()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ndarray::{ArrayD, IxDyn};
    use serde_json::Value;

    use super::*;
    use crate::dataset::Attrs;

    fn raw(short: &str) -> Dataset {
        let mut attrs = Attrs::new();
        attrs.insert("history".to_string(), Value::from("retrieved"));
        attrs.insert("Conventions".to_string(), Value::from("CF-1.6"));
        let time = ArrayD::from_shape_vec(IxDyn(&[3]), vec![0_i64, 3_600, 7_200]).unwrap();
        Dataset::new(
            attrs,
            vec![
                Variable::new(
                    "longitude",
                    &["longitude"],
                    ArrayData::F32(ArrayD::from_shape_vec(IxDyn(&[2]), vec![0.0, 0.25]).unwrap()),
                ),
                Variable::new(
                    "latitude",
                    &["latitude"],
                    ArrayData::F32(ArrayD::from_shape_vec(IxDyn(&[1]), vec![90.0]).unwrap()),
                ),
                Variable::new("time", &["time"], ArrayData::I64(time)),
                Variable::new(
                    short,
                    &["time", "latitude", "longitude"],
                    ArrayData::F32(ArrayD::zeros(IxDyn(&[3, 1, 2]))),
                ),
            ],
        )
    }

    #[test]
    fn renames_and_orders_coordinates_first() {
        let result = transform(raw("t2m")).unwrap();
        assert_eq!(
            result.names(),
            vec!["lat", "lon", "time", "air_temperature_at_2_metres"]
        );
        let var = result.get("air_temperature_at_2_metres").unwrap();
        assert_eq!(var.dims, vec!["time", "lat", "lon"]);
        assert_eq!(var.attrs["units"], "K");
        assert_eq!(result.get("lon").unwrap().attrs["units"], "degrees_east");
    }

    #[test]
    fn replaces_dataset_attrs_and_drops_history() {
        let result = transform(raw("sp")).unwrap();
        assert!(!result.attrs.contains_key("history"));
        assert_eq!(result.attrs["institution"], "ECMWF");
        assert_eq!(result.attrs["title"], "ERA5 forecasts");
    }

    #[test]
    fn bounded_variables_get_time_bounds() {
        let result = transform(raw("tp")).unwrap();
        assert_eq!(result.names().last().copied(), Some(TIME_BOUNDS_VARIABLE));
        let bounds = result.get(TIME_BOUNDS_VARIABLE).unwrap();
        assert_eq!(bounds.dims, vec!["time", "nv"]);
        let values = bounds.data.as_i64().unwrap();
        for (i, t) in [0_i64, 3_600, 7_200].iter().enumerate() {
            assert_eq!(values[[i, 0]], t - 10_800);
            assert_eq!(values[[i, 1]], *t);
        }
    }

    #[test]
    fn analysis_variables_have_no_bounds() {
        let result = transform(raw("msl")).unwrap();
        assert!(!result.contains(TIME_BOUNDS_VARIABLE));
    }

    #[test]
    fn idempotent_on_canonical_input() {
        let once = transform(raw("mx2t")).unwrap();
        let twice = transform(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn unknown_variable_is_a_configuration_error() {
        let err = transform(raw("swh")).unwrap_err();
        assert_matches!(err, EtlError::MissingAttributes(name) if name == "swh");
    }
}
