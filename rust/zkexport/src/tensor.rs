//! Input specifications and the tensors built from them.

use std::path::Path;

use anyhow::Context;
use ndarray::{ArrayD, Axis, IxDyn};
use rand::Rng;
use serde_json::Value;

use crate::errors::{ArrayConversionError, ExportError};

/// Upper bound (exclusive) of randomly generated input elements.
pub const RANDOM_INPUT_MAX: f32 = 0.1;

/// What the caller knows about the model input: a batch-less shape, a literal
/// array, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSpec {
    shape: Option<Vec<usize>>,
    array: Option<ArrayD<f32>>,
}

impl InputSpec {
    pub fn from_shape(shape: impl Into<Vec<usize>>) -> Self {
        Self {
            shape: Some(shape.into()),
            array: None,
        }
    }

    pub fn from_array(array: ArrayD<f32>) -> Self {
        Self {
            shape: None,
            array: Some(array),
        }
    }

    pub fn with_shape(mut self, shape: impl Into<Vec<usize>>) -> Self {
        self.shape = Some(shape.into());
        self
    }

    pub fn with_array(mut self, array: ArrayD<f32>) -> Self {
        self.array = Some(array);
        self
    }

    /// The shape as the caller declared it, recorded verbatim in the sidecar.
    pub fn declared_shape(&self) -> Option<&[usize]> {
        self.shape.as_deref()
    }

    /// Builds the model input: the literal array (or `shape` filled from
    /// `rng` with values in `[0, 0.1)`), with a leading batch axis of 1.
    pub fn materialize<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<ArrayD<f32>, ExportError> {
        let input = match (&self.shape, &self.array) {
            (None, None) => Err(ExportError::InvalidSpecification(
                "either an input shape or an input array is required".to_string(),
            )),
            (Some(shape), Some(array)) if array.shape() != shape.as_slice() => {
                Err(ExportError::InvalidSpecification(format!(
                    "input array has shape {:?} but the declared input shape is {:?}",
                    array.shape(),
                    shape
                )))
            }
            (_, Some(array)) => Ok(array.clone().insert_axis(Axis(0))),
            (Some(shape), None) => {
                let mut dims = Vec::with_capacity(shape.len() + 1);
                dims.push(1);
                dims.extend_from_slice(shape);
                Ok(ArrayD::from_shape_simple_fn(IxDyn(&dims), || {
                    rng.gen_range(0.0..RANDOM_INPUT_MAX)
                }))
            }
        }?;

        if input.shape().contains(&0) {
            return Err(ExportError::InvalidSpecification(format!(
                "input shape {:?} has a zero-sized dimension",
                &input.shape()[1..]
            )));
        }
        Ok(input)
    }
}

/// Row-major flattening, widened to `f64` for the JSON record.
pub fn flatten(array: &ArrayD<f32>) -> Vec<f64> {
    array.iter().map(|&v| f64::from(v)).collect()
}

/// Inverse of [`flatten`] for a known shape.
pub fn reshape_flat(values: &[f64], shape: &[usize]) -> Result<ArrayD<f32>, ndarray::ShapeError> {
    ArrayD::from_shape_vec(
        IxDyn(shape),
        values.iter().map(|&v| v as f32).collect(),
    )
}

/// Converts a nested JSON array of numbers into a dense `f32` array. Ragged
/// nesting is rejected rather than silently truncated.
pub fn array_from_json(value: &Value) -> Result<ArrayD<f32>, ArrayConversionError> {
    let shape = json_shape(value)?;
    let mut data = Vec::with_capacity(shape.iter().product());
    collect_numbers(value, &shape, 0, &mut data)?;
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
}

/// Loads a literal input array from a JSON file.
pub fn read_array_file(path: &Path) -> anyhow::Result<ArrayD<f32>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading input array {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("parsing input array {}", path.display()))?;
    array_from_json(&value).with_context(|| format!("converting input array {}", path.display()))
}

fn json_shape(value: &Value) -> Result<Vec<usize>, ArrayConversionError> {
    let mut shape = Vec::new();
    let mut current = value;
    loop {
        match current {
            Value::Array(items) => {
                shape.push(items.len());
                match items.first() {
                    Some(first) => current = first,
                    None => break,
                }
            }
            Value::Number(_) => break,
            other => {
                return Err(ArrayConversionError::InvalidArrayStructure {
                    expected: "array or number".to_string(),
                    found: other.to_string(),
                })
            }
        }
    }
    Ok(shape)
}

fn collect_numbers(
    value: &Value,
    shape: &[usize],
    depth: usize,
    data: &mut Vec<f32>,
) -> Result<(), ArrayConversionError> {
    match value {
        Value::Number(n) if depth == shape.len() => {
            let v = n
                .as_f64()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ArrayConversionError::InvalidNumber(n.to_string()))?;
            data.push(v as f32);
            Ok(())
        }
        Value::Array(items) if depth < shape.len() => {
            if items.len() != shape[depth] {
                return Err(ArrayConversionError::Ragged {
                    depth,
                    expected: shape[depth],
                    found: items.len(),
                });
            }
            items
                .iter()
                .try_for_each(|item| collect_numbers(item, shape, depth + 1, data))
        }
        other => Err(ArrayConversionError::InvalidArrayStructure {
            expected: format!("nesting depth {}", shape.len()),
            found: other.to_string(),
        }),
    }
}
