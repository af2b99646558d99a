//! Fixed-point forward pass over a quantized layer graph.
//!
//! Every activation is an integer at scale `alpha`. Multiplicative layers
//! produce values at `alpha^2` and are floor-divided back to `alpha`, the
//! same quotient a rescale gadget would witness.

use std::collections::HashMap;

use anyhow::{bail, ensure, Context, Result};
use ndarray::{ArrayD, Ix2, IxDyn};

use super::graph::{LayerNode, OpType};
use super::ops::{apply_shape_op, try_broadcast_binary};
use super::quantizer::{QuantizedModel, I64_LIMIT};

/// Floor division by `alpha`; returns `(quotient, remainder)` with
/// `0 <= remainder < alpha`.
pub fn compute_rescale(value: i64, alpha: i64) -> (i64, i64) {
    (value.div_euclid(alpha), value.rem_euclid(alpha))
}

fn rescale(array: ArrayD<i64>, alpha: i64) -> ArrayD<i64> {
    array.mapv(|v| compute_rescale(v, alpha).0)
}

fn overflow(layer: &LayerNode) -> anyhow::Error {
    anyhow::anyhow!(
        "{:?} {}: fixed-point value overflows i64; lower the scale or the input range",
        layer.op_type,
        layer.name
    )
}

/// Integer matrix product that fails instead of wrapping.
fn checked_matmul(
    a: &ndarray::Array2<i64>,
    b: &ndarray::Array2<i64>,
    layer: &LayerNode,
) -> Result<ArrayD<i64>> {
    let (rows, inner, cols) = (a.nrows(), a.ncols(), b.ncols());
    let mut out = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            let mut acc = 0i64;
            for k in 0..inner {
                acc = a[[r, k]]
                    .checked_mul(b[[k, c]])
                    .and_then(|p| acc.checked_add(p))
                    .ok_or_else(|| overflow(layer))?;
            }
            out.push(acc);
        }
    }
    Ok(ArrayD::from_shape_vec(IxDyn(&[rows, cols]), out)?)
}

fn operand(
    layer: &LayerNode,
    idx: usize,
    tensors: &HashMap<String, ArrayD<i64>>,
) -> Result<ArrayD<i64>> {
    let name = layer
        .inputs
        .get(idx)
        .with_context(|| format!("{:?} {} has no input {idx}", layer.op_type, layer.name))?;
    if let Some(t) = tensors.get(name) {
        return Ok(t.clone());
    }
    let w = layer.weights.get(name).with_context(|| {
        format!(
            "{:?} {} input {} not computed",
            layer.op_type, layer.name, name
        )
    })?;
    ensure!(
        w.float_data.is_empty(),
        "{:?} {}: constant '{}' was not quantized",
        layer.op_type,
        layer.name,
        name
    );
    w.to_i64_array()
}

fn matrix(array: ArrayD<i64>, what: &str, layer: &LayerNode) -> Result<ndarray::Array2<i64>> {
    array
        .into_dimensionality::<Ix2>()
        .with_context(|| format!("{:?} {}: {what} must be 2-D", layer.op_type, layer.name))
}

/// Runs the graph on a quantized input and returns the quantized outputs in
/// declaration order.
pub fn run_quantized(model: &QuantizedModel, input: ArrayD<i64>) -> Result<Vec<ArrayD<i64>>> {
    let alpha = model.scale_config.alpha;
    let graph = &model.graph;

    ensure!(
        graph.input_names.len() == 1,
        "expected exactly 1 graph input, found {} ({:?})",
        graph.input_names.len(),
        graph.input_names
    );

    let mut tensors: HashMap<String, ArrayD<i64>> = HashMap::new();
    tensors.insert(graph.input_names[0].clone(), input);

    for layer in graph.iter_topo() {
        let out = eval_layer(layer, &tensors, alpha)?;
        tracing::trace!(layer = %layer.name, shape = ?out.shape(), "evaluated layer");
        for name in &layer.outputs {
            tensors.insert(name.clone(), out.clone());
        }
    }

    graph
        .output_names
        .iter()
        .map(|name| {
            tensors
                .get(name)
                .cloned()
                .with_context(|| format!("declared output '{name}' not computed"))
        })
        .collect()
}

fn eval_layer(
    layer: &LayerNode,
    tensors: &HashMap<String, ArrayD<i64>>,
    alpha: i64,
) -> Result<ArrayD<i64>> {
    match layer.op_type {
        OpType::Identity | OpType::Flatten | OpType::Transpose => {
            apply_shape_op(layer.op_type, &layer.attributes, operand(layer, 0, tensors)?, None)
        }
        OpType::Reshape => {
            let shape_name = layer
                .inputs
                .get(1)
                .with_context(|| format!("Reshape {} has no shape input", layer.name))?;
            let shape = layer
                .weights
                .get(shape_name)
                .with_context(|| {
                    format!("Reshape {}: shape '{}' must be constant", layer.name, shape_name)
                })?
                .as_i64_vec();
            apply_shape_op(
                OpType::Reshape,
                &layer.attributes,
                operand(layer, 0, tensors)?,
                Some(&shape),
            )
        }
        OpType::Relu => Ok(operand(layer, 0, tensors)?.mapv(|v| v.max(0))),
        OpType::Neg => {
            let a = operand(layer, 0, tensors)?;
            let negated = a
                .iter()
                .map(|v| v.checked_neg().ok_or_else(|| overflow(layer)))
                .collect::<Result<Vec<_>>>()?;
            Ok(ArrayD::from_shape_vec(a.raw_dim(), negated)?)
        }
        OpType::Add => {
            let (a, b) = (operand(layer, 0, tensors)?, operand(layer, 1, tensors)?);
            try_broadcast_binary(&a, &b, |x, y| x.checked_add(*y).ok_or_else(|| overflow(layer)))
        }
        OpType::Sub => {
            let (a, b) = (operand(layer, 0, tensors)?, operand(layer, 1, tensors)?);
            try_broadcast_binary(&a, &b, |x, y| x.checked_sub(*y).ok_or_else(|| overflow(layer)))
        }
        OpType::Mul => {
            let (a, b) = (operand(layer, 0, tensors)?, operand(layer, 1, tensors)?);
            let product = try_broadcast_binary(&a, &b, |x, y| {
                x.checked_mul(*y).ok_or_else(|| overflow(layer))
            })?;
            Ok(rescale(product, alpha))
        }
        OpType::Div => {
            let a = operand(layer, 0, tensors)?;
            let divisor_name = layer
                .inputs
                .get(1)
                .with_context(|| format!("Div {} has no divisor", layer.name))?;
            let Some(divisor) = layer.weights.get(divisor_name) else {
                bail!(
                    "Div {}: divisor '{}' must be a constant initializer",
                    layer.name,
                    divisor_name
                );
            };
            let d = divisor.to_f64_array()?;
            ensure!(
                d.iter().all(|v| *v != 0.0),
                "Div {}: divisor '{}' contains zero",
                layer.name,
                divisor_name
            );
            try_broadcast_binary(&a, &d, |x, y| {
                let q = (*x as f64 / y).round();
                if q.is_finite() && q.abs() < I64_LIMIT {
                    Ok(q as i64)
                } else {
                    Err(overflow(layer))
                }
            })
        }
        OpType::Gemm => {
            for attr in ["alpha", "beta"] {
                let v = layer.get_float_attr(attr).unwrap_or(1.0);
                ensure!(
                    v == 1.0,
                    "Gemm {} has {attr}={v}; only 1.0 is supported",
                    layer.name
                );
            }
            let mut a = matrix(operand(layer, 0, tensors)?, "input", layer)?;
            if layer.get_int_attr("transA").is_some_and(|v| v != 0) {
                a = a.reversed_axes();
            }
            let mut b = matrix(operand(layer, 1, tensors)?, "weight", layer)?;
            if layer.get_int_attr("transB").is_some_and(|v| v != 0) {
                b = b.reversed_axes();
            }
            ensure!(
                a.ncols() == b.nrows(),
                "Gemm {}: cannot multiply {:?} by {:?}",
                layer.name,
                a.shape(),
                b.shape()
            );
            let mut acc = checked_matmul(&a, &b, layer)?;
            if layer.inputs.len() > 2 {
                let bias = operand(layer, 2, tensors)?;
                acc = try_broadcast_binary(&acc, &bias, |x, y| {
                    x.checked_add(*y).ok_or_else(|| overflow(layer))
                })?;
            }
            Ok(rescale(acc, alpha))
        }
        OpType::MatMul => {
            let a = matrix(operand(layer, 0, tensors)?, "left operand", layer)?;
            let b = matrix(operand(layer, 1, tensors)?, "right operand", layer)?;
            ensure!(
                a.ncols() == b.nrows(),
                "MatMul {}: cannot multiply {:?} by {:?}",
                layer.name,
                a.shape(),
                b.shape()
            );
            Ok(rescale(checked_matmul(&a, &b, layer)?, alpha))
        }
        OpType::Constant => {
            let value = layer
                .get_tensor_attr("value")
                .with_context(|| format!("Constant {} has no value tensor", layer.name))?;
            ensure!(
                value.float_data.is_empty(),
                "Constant {}: value was not quantized",
                layer.name
            );
            value.to_i64_array()
        }
    }
}
