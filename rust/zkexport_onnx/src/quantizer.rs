use std::collections::HashMap;

use anyhow::{ensure, Context, Result};

use super::graph::{LayerGraph, LayerNode, OpType};
use super::ops;
use super::parser::{AttrValue, TensorData};

pub const DEFAULT_SCALE_BASE: u64 = 2;
pub const DEFAULT_SCALE_EXPONENT: u32 = 18;

/// Largest `log2(alpha)` for which `alpha^2` products still fit comfortably
/// in an `i64` accumulator.
const MAX_SCALE_BITS: f64 = 30.0;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScaleConfig {
    pub base: u64,
    pub exponent: u32,
    pub alpha: i64,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        let alpha = (DEFAULT_SCALE_BASE as i64).pow(DEFAULT_SCALE_EXPONENT);
        Self {
            base: DEFAULT_SCALE_BASE,
            exponent: DEFAULT_SCALE_EXPONENT,
            alpha,
        }
    }
}

impl ScaleConfig {
    pub fn new(base: u64, exponent: u32) -> Result<Self> {
        ensure!(base >= 2, "scale base must be at least 2, got {base}");
        let bits = (base as f64).log2() * f64::from(exponent);
        ensure!(
            bits <= MAX_SCALE_BITS,
            "scale {base}^{exponent} is too large (limit 2^{MAX_SCALE_BITS})"
        );
        let alpha = (base as i64).pow(exponent);
        Ok(Self {
            base,
            exponent,
            alpha,
        })
    }
}

/// `2^63`, the smallest magnitude an `i64` cannot hold.
pub const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;

fn to_fixed(value: f64, factor: f64) -> Option<i64> {
    let scaled = (value * factor).round();
    (scaled.is_finite() && scaled.abs() < I64_LIMIT).then_some(scaled as i64)
}

/// Fails when `value * alpha` does not fit in an `i64`.
pub fn quantize_value(value: f64, alpha: i64) -> Result<i64> {
    to_fixed(value, alpha as f64)
        .with_context(|| format!("{value} is out of range at scale {alpha}"))
}

pub fn dequantize_value(value: i64, alpha: i64) -> f64 {
    value as f64 / alpha as f64
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QuantizedModel {
    pub graph: LayerGraph,
    pub scale_config: ScaleConfig,
    #[serde(default)]
    pub n_bits_config: HashMap<String, usize>,
}

/// Converts every float constant of `graph` to fixed point at `config.alpha`
/// and records, per rescaling or Relu layer, how many bits its activations
/// need. `input_bound` is the largest input magnitude the model will see; a
/// graph whose intermediates could then leave the `i64` range is rejected.
pub fn quantize_model(
    mut graph: LayerGraph,
    config: &ScaleConfig,
    input_bound: f64,
) -> Result<QuantizedModel> {
    // Bounds are taken from the float weights, so they go first.
    let n_bits_config = compute_bounds(&graph, config, input_bound)?;

    for layer in &mut graph.layers {
        quantize_layer_weights(layer, config.alpha)?;
        layer.n_bits = n_bits_config.get(&layer.name).copied();
    }

    Ok(QuantizedModel {
        graph,
        scale_config: config.clone(),
        n_bits_config,
    })
}

fn scale_tensor(tensor: &mut TensorData, factor: i64) -> Result<()> {
    if tensor.float_data.is_empty() {
        return Ok(());
    }
    let scaled = tensor
        .float_data
        .iter()
        .map(|&v| to_fixed(v, factor as f64))
        .collect::<Option<Vec<_>>>()
        .with_context(|| format!("constant '{}' is out of range at scale {factor}", tensor.name))?;
    tensor.float_data.clear();
    tensor.int_data = scaled;
    Ok(())
}

fn quantize_layer_weights(layer: &mut LayerNode, alpha: i64) -> Result<()> {
    if layer.op_type == OpType::Constant {
        if let Some(AttrValue::Tensor(value)) = layer.attributes.get_mut("value") {
            scale_tensor(value, alpha)?;
        }
        return Ok(());
    }

    for (position, power) in ops::get_scale_plan(layer.op_type) {
        let Some(name) = layer.inputs.get(position) else {
            continue;
        };
        let Some(weight) = layer.weights.get_mut(name) else {
            continue;
        };
        let factor = alpha
            .checked_pow(power)
            .with_context(|| format!("layer {}: alpha^{power} overflows i64", layer.name))?;
        scale_tensor(weight, factor)?;
    }
    Ok(())
}

fn max_abs(tensor: &TensorData) -> f64 {
    tensor
        .as_f64_vec()
        .iter()
        .map(|v| v.abs())
        .fold(0.0_f64, f64::max)
}

/// Propagates a worst-case magnitude from the inputs (within
/// `[-input_bound, input_bound]`) through the graph.
fn compute_bounds(
    graph: &LayerGraph,
    config: &ScaleConfig,
    input_bound: f64,
) -> Result<HashMap<String, usize>> {
    let mut bounds: HashMap<String, f64> = graph
        .input_names
        .iter()
        .map(|name| (name.clone(), input_bound))
        .collect();

    let mut n_bits_config = HashMap::new();
    for layer in graph.iter_topo() {
        let bound = compute_layer_bound(layer, &bounds)?;
        check_headroom(layer, bound, config.alpha)?;
        if layer.needs_rescale || layer.op_type == OpType::Relu {
            n_bits_config.insert(layer.name.clone(), compute_n_bits(config.alpha, bound));
        }
        bounds.extend(layer.outputs.iter().map(|out| (out.clone(), bound)));
    }
    Ok(n_bits_config)
}

fn compute_layer_bound(layer: &LayerNode, prev_bounds: &HashMap<String, f64>) -> Result<f64> {
    let get_input_bound = |idx: usize| -> f64 {
        let Some(name) = layer.inputs.get(idx) else {
            return 1.0;
        };
        if let Some(w) = layer.weights.get(name) {
            return max_abs(w);
        }
        prev_bounds.get(name).copied().unwrap_or(1.0)
    };

    let weight = |idx: usize| -> Result<&TensorData> {
        let name = layer.inputs.get(idx).ok_or_else(|| {
            anyhow::anyhow!(
                "layer {}: expected weight input at index {idx} but only {} inputs present",
                layer.name,
                layer.inputs.len(),
            )
        })?;
        layer.weights.get(name).ok_or_else(|| {
            anyhow::anyhow!(
                "layer {}: weight tensor '{}' not found in initializers",
                layer.name,
                name,
            )
        })
    };

    // Largest L1 norm over the output columns of a [rows, cols] matrix.
    let max_column_l1 = |w: &TensorData, transposed: bool| -> Result<f64> {
        let d = w.shape();
        let vals = w.as_f64_vec();
        ensure!(
            d.len() == 2 && vals.len() == d[0] * d[1],
            "layer {}: weight '{}' is not a matrix (dims {:?})",
            layer.name,
            w.name,
            w.dims
        );
        let (rows, cols) = (d[0], d[1]);
        let l1 = if transposed {
            (0..rows)
                .map(|r| (0..cols).map(|c| vals[r * cols + c].abs()).sum::<f64>())
                .fold(0.0_f64, f64::max)
        } else {
            (0..cols)
                .map(|c| (0..rows).map(|r| vals[r * cols + c].abs()).sum::<f64>())
                .fold(0.0_f64, f64::max)
        };
        Ok(l1)
    };

    match layer.op_type {
        OpType::Gemm => {
            let m_in = get_input_bound(0);
            let trans_b = layer.get_int_attr("transB").is_some_and(|v| v != 0);
            let weight_l1 = max_column_l1(weight(1)?, trans_b)?;
            let bias_bound = layer
                .inputs
                .get(2)
                .and_then(|name| layer.weights.get(name))
                .map(max_abs)
                .unwrap_or(0.0);
            Ok(weight_l1 * m_in + bias_bound)
        }
        OpType::MatMul => {
            let m_in = get_input_bound(0);
            Ok(max_column_l1(weight(1)?, false)? * m_in)
        }
        OpType::Mul => Ok(get_input_bound(0) * get_input_bound(1)),
        OpType::Add | OpType::Sub => Ok(get_input_bound(0) + get_input_bound(1)),
        OpType::Div => {
            let m_a = get_input_bound(0);
            let min_abs_b = layer
                .inputs
                .get(1)
                .and_then(|name| layer.weights.get(name))
                .map(|w| {
                    w.as_f64_vec()
                        .iter()
                        .map(|v| v.abs())
                        .fold(f64::INFINITY, f64::min)
                })
                .filter(|&v| v.is_finite() && v > 0.0);
            match min_abs_b {
                Some(b) => Ok(m_a / b),
                None => anyhow::bail!(
                    "layer {}: Div denominator is not a constant initializer or contains zero",
                    layer.name,
                ),
            }
        }
        OpType::Neg
        | OpType::Relu
        | OpType::Reshape
        | OpType::Flatten
        | OpType::Identity
        | OpType::Transpose => Ok(get_input_bound(0)),
        OpType::Constant => Ok(layer.get_tensor_attr("value").map(max_abs).unwrap_or(0.0)),
    }
}

/// Rescaling layers hold `alpha^2`-scaled values before the floor division;
/// everything else stays at `alpha`.
fn check_headroom(layer: &LayerNode, bound: f64, alpha: i64) -> Result<()> {
    let scale = if layer.needs_rescale {
        (alpha as f64).powi(2)
    } else {
        alpha as f64
    };
    let peak = bound * scale;
    ensure!(
        peak.is_finite() && peak < I64_LIMIT,
        "layer {}: values up to {bound} need {:.0} bits at scale {alpha}, more than an i64 holds",
        layer.name,
        peak.log2().ceil() + 1.0,
    );
    Ok(())
}

fn compute_n_bits(alpha: i64, bound: f64) -> usize {
    let val = (alpha as f64 * bound).abs();
    if val <= 1.0 {
        return 2;
    }
    (val.log2().ceil() as usize) + 1
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn gemm_layer() -> LayerNode {
        let mut weights = HashMap::new();
        weights.insert(
            "w".to_string(),
            TensorData::from_f64("w", vec![2, 2], vec![0.5, -0.25, 1.0, 2.0]),
        );
        weights.insert(
            "b".to_string(),
            TensorData::from_f64("b", vec![2], vec![0.5, -1.0]),
        );
        LayerNode {
            id: 0,
            name: "gemm".into(),
            op_type: OpType::Gemm,
            inputs: vec!["x".into(), "w".into(), "b".into()],
            outputs: vec!["y".into()],
            weights,
            attributes: BTreeMap::from([("transB".to_string(), AttrValue::Int(1))]),
            needs_rescale: true,
            n_bits: None,
        }
    }

    #[test]
    fn default_scale_is_two_to_the_eighteenth() {
        let config = ScaleConfig::default();
        assert_eq!(config.alpha, 1 << 18);
        assert_eq!(ScaleConfig::new(2, 18).unwrap(), config);
    }

    #[test]
    fn oversized_scale_is_rejected() {
        assert!(ScaleConfig::new(2, 31).is_err());
        assert!(ScaleConfig::new(10, 10).is_err());
        assert!(ScaleConfig::new(1, 4).is_err());
    }

    #[test]
    fn gemm_weights_scale_once_and_bias_twice() {
        let mut layer = gemm_layer();
        quantize_layer_weights(&mut layer, 4).unwrap();
        assert_eq!(layer.weights["w"].int_data, vec![2, -1, 4, 8]);
        assert_eq!(layer.weights["b"].int_data, vec![8, -16]);
        assert!(layer.weights["w"].float_data.is_empty());
    }

    #[test]
    fn gemm_bound_uses_rows_when_transposed() {
        let layer = gemm_layer();
        let bound = compute_layer_bound(&layer, &HashMap::from([("x".to_string(), 2.0)])).unwrap();
        assert!((bound - (3.0 * 2.0 + 1.0)).abs() < 1e-12);
    }

    #[test]
    fn n_bits_covers_scaled_bound() {
        assert_eq!(compute_n_bits(1 << 18, 1.0), 19);
        assert_eq!(compute_n_bits(1, 0.0), 2);
    }

    #[test]
    fn quantize_roundtrip_is_within_half_step() {
        let alpha = 1 << 10;
        for v in [0.0, 0.06980138272047043, -0.5, 3.14159] {
            let q = quantize_value(v, alpha).unwrap();
            assert!((dequantize_value(q, alpha) - v).abs() <= 0.5 / alpha as f64);
        }
    }

    #[test]
    fn out_of_range_values_are_rejected_not_clamped() {
        let alpha = 1 << 18;
        assert!(quantize_value(1e15, alpha).is_err());
        assert!(quantize_value(-1e15, alpha).is_err());
        assert!(quantize_value(f64::NAN, alpha).is_err());
        assert_eq!(quantize_value(1e6, alpha).unwrap(), 1_000_000 << 18);

        let mut big = TensorData::from_f64("big", vec![1], vec![1e15]);
        assert!(scale_tensor(&mut big, alpha).is_err());
    }

    #[test]
    fn headroom_counts_alpha_squared_for_rescaling_layers() {
        let layer = gemm_layer();
        let alpha = 1 << 18;
        // 2^63 / 2^36 = 2^27 is the largest Gemm output this scale can hold.
        assert!(check_headroom(&layer, 1e8, alpha).is_ok());
        assert!(check_headroom(&layer, 1e9, alpha).is_err());

        let relu = LayerNode {
            op_type: OpType::Relu,
            needs_rescale: false,
            ..gemm_layer()
        };
        assert!(check_headroom(&relu, 1e9, alpha).is_ok());
        assert!(check_headroom(&relu, f64::INFINITY, alpha).is_err());
    }
}
