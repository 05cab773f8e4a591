use tracing::debug;

use crate::dataset::{Dataset, Variable};
use crate::error::EtlError;
use crate::schema::COORDINATES;

/// Combines single-variable datasets for one period into one dataset.
///
/// Shared coordinates must match exactly, in value and order. Nothing is
/// reindexed: any disagreement is an error.
pub fn assemble(transformed: Vec<Dataset>) -> Result<Dataset, EtlError> {
    let mut inputs = transformed.into_iter();
    let mut result = inputs
        .next()
        .ok_or_else(|| EtlError::Dataset("no datasets to assemble".to_string()))?;
    let mut result_label = label(&result);

    for input in inputs {
        let input_label = label(&input);
        for coord in input.coords() {
            if let Some(existing) = result.get(&coord.name) {
                if existing.dims != coord.dims || existing.data != coord.data {
                    return Err(EtlError::CoordinateMismatch {
                        coordinate: coord.name.clone(),
                        left: result_label,
                        right: input_label,
                    });
                }
            }
        }

        let Dataset { attrs, variables } = input;
        merge_attrs(&mut result, attrs);
        for var in variables {
            match result.get(&var.name) {
                Some(existing) if existing.is_coordinate() => {}
                Some(existing) => {
                    if existing.dims != var.dims || existing.data != var.data {
                        return Err(EtlError::ConflictingVariable(var.name));
                    }
                    debug!("merged duplicate {}", var.name);
                }
                None => result.variables.push(var),
            }
        }
        result_label = format!("{result_label}+{input_label}");
    }

    Ok(order_variables(result))
}

fn label(dataset: &Dataset) -> String {
    dataset
        .data_vars()
        .next()
        .map(|var| var.name.clone())
        .unwrap_or_else(|| "<no data variables>".to_string())
}

/// Keeps attributes all inputs agree on.
fn merge_attrs(result: &mut Dataset, attrs: crate::dataset::Attrs) {
    for (key, value) in attrs {
        match result.attrs.get(&key) {
            Some(existing) if *existing != value => {
                result.attrs.remove(&key);
            }
            Some(_) => {}
            None => {
                result.attrs.insert(key, value);
            }
        }
    }
}

fn order_variables(dataset: Dataset) -> Dataset {
    let Dataset { attrs, variables } = dataset;
    let (mut coords, data): (Vec<Variable>, Vec<Variable>) =
        variables.into_iter().partition(|var| var.is_coordinate());
    coords.sort_by_key(|var| {
        COORDINATES
            .iter()
            .position(|name| *name == var.name)
            .unwrap_or(COORDINATES.len())
    });
    coords.extend(data);
    Dataset::new(attrs, coords)
}
