//! Quantizers turn the float record into the fixed-point view a proving
//! circuit sees.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context};
use ndarray::{ArrayD, IxDyn};
use zkexport_onnx::inference::run_quantized;
use zkexport_onnx::quantizer::{dequantize_value, quantize_value};
use zkexport_onnx::{parse_onnx, quantize_model, IoSpec, LayerGraph, ScaleConfig};

use crate::errors::QuantizeError;
use crate::record::ExportRecord;

/// Consumes the record at `source` and the graph at `graph`, writing the
/// quantized record to `dest`. `source` and `dest` may be the same path.
pub trait Quantizer {
    fn forward(&self, source: &Path, graph: &Path, dest: &Path) -> Result<(), QuantizeError>;
}

impl<Q: Quantizer + ?Sized> Quantizer for &Q {
    fn forward(&self, source: &Path, graph: &Path, dest: &Path) -> Result<(), QuantizeError> {
        (**self).forward(source, graph, dest)
    }
}

impl<Q: Quantizer + ?Sized> Quantizer for Box<Q> {
    fn forward(&self, source: &Path, graph: &Path, dest: &Path) -> Result<(), QuantizeError> {
        (**self).forward(source, graph, dest)
    }
}

/// Fixed-point quantization done in process.
///
/// The input is rounded to the `alpha` grid, the graph is evaluated in
/// integers with floor rescaling after each multiplicative layer, and the
/// record is rewritten with the dequantized input and outputs.
#[derive(Debug, Clone, Default)]
pub struct NativeQuantizer {
    scale: ScaleConfig,
}

impl NativeQuantizer {
    pub fn new(scale: ScaleConfig) -> Self {
        Self { scale }
    }
}

/// Resolves `-1` axes of the graph input from the number of values.
fn resolve_input_shape(spec: &IoSpec, len: usize) -> anyhow::Result<Vec<usize>> {
    let dynamic = spec.shape.iter().filter(|&&d| d < 0).count();
    let fixed: usize = spec
        .shape
        .iter()
        .filter(|&&d| d >= 0)
        .map(|&d| d as usize)
        .product();

    match dynamic {
        0 if fixed == len => Ok(spec.shape.iter().map(|&d| d as usize).collect()),
        1 if fixed > 0 && len % fixed == 0 && len > 0 => Ok(spec
            .shape
            .iter()
            .map(|&d| if d < 0 { len / fixed } else { d as usize })
            .collect()),
        0 | 1 => bail!(
            "input '{}' has shape {:?} but the record holds {len} values",
            spec.name,
            spec.shape
        ),
        _ => bail!(
            "input '{}' has {dynamic} dynamic axes; only one can be resolved",
            spec.name
        ),
    }
}

impl Quantizer for NativeQuantizer {
    fn forward(&self, source: &Path, graph: &Path, dest: &Path) -> Result<(), QuantizeError> {
        let record = ExportRecord::read(source)?;
        let values = record.single_input()?;

        let parsed = parse_onnx(graph)?;
        let layers = LayerGraph::from_parsed(&parsed)?;
        let input_name = match layers.input_names.as_slice() {
            [name] => name.clone(),
            names => {
                return Err(QuantizeError::Graph(anyhow::anyhow!(
                    "graph must have exactly one data input, found {names:?}"
                )))
            }
        };
        let spec = layers
            .inputs
            .get(&input_name)
            .with_context(|| format!("graph input '{input_name}' has no type information"))?;
        let shape = resolve_input_shape(spec, values.len())?;

        let input_bound = values.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let model = quantize_model(layers, &self.scale, input_bound)?;
        for (layer, bits) in &model.n_bits_config {
            tracing::debug!(layer = %layer, bits, "layer bit bound");
        }

        let alpha = self.scale.alpha;
        let quantized = values
            .iter()
            .map(|&v| quantize_value(v, alpha))
            .collect::<anyhow::Result<Vec<i64>>>()?;
        let input = ArrayD::from_shape_vec(IxDyn(&shape), quantized)
            .context("shaping quantized input")?;

        let outputs = run_quantized(&model, input.clone())?;

        let dequantize = |a: &ArrayD<i64>| -> Vec<f64> {
            a.iter().map(|&v| dequantize_value(v, alpha)).collect()
        };
        let result = ExportRecord {
            input_shapes: record.input_shapes.clone(),
            input_data: vec![dequantize(&input)],
            output_data: outputs.iter().map(dequantize).collect(),
        };
        result.write(dest)?;

        tracing::info!(
            alpha,
            outputs = result.output_data.len(),
            dest = %dest.display(),
            "quantized record"
        );
        Ok(())
    }
}

/// Delegates to an external program invoked as
/// `program [args..] <source> <graph> <dest>`.
#[derive(Debug, Clone)]
pub struct CommandQuantizer {
    program: String,
    args: Vec<String>,
}

impl CommandQuantizer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl Quantizer for CommandQuantizer {
    fn forward(&self, source: &Path, graph: &Path, dest: &Path) -> Result<(), QuantizeError> {
        tracing::info!(program = %self.program, args = ?self.args, "running external quantizer");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(source)
            .arg(graph)
            .arg(dest)
            .output()
            .map_err(|source| QuantizeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(QuantizeError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use ndarray::IxDyn;
    use tempfile::TempDir;

    use super::*;
    use crate::graph_export::{GraphExportConfig, GraphExporter, OnnxExporter};
    use crate::model::{Layer, Model, Sequential};

    fn io(shape: Vec<i64>) -> IoSpec {
        IoSpec {
            name: "input".into(),
            shape,
            elem_type: 1,
            dim_params: BTreeMap::new(),
        }
    }

    fn export(dir: &TempDir, model: &Sequential, input: &ArrayD<f32>) -> (PathBuf, PathBuf) {
        let graph = dir.path().join("network.onnx");
        let data = dir.path().join("input.json");
        OnnxExporter
            .export(model, input, &graph, &GraphExportConfig::default())
            .unwrap();
        let outputs = model.forward(input).unwrap();
        ExportRecord::new(Some(&input.shape()[1..]), input, &outputs)
            .unwrap()
            .write(&data)
            .unwrap();
        (graph, data)
    }

    #[test]
    fn dynamic_batch_is_resolved_from_length() {
        assert_eq!(resolve_input_shape(&io(vec![-1, 9, 2]), 36).unwrap(), vec![2, 9, 2]);
        assert_eq!(resolve_input_shape(&io(vec![1, 3]), 3).unwrap(), vec![1, 3]);
        assert!(resolve_input_shape(&io(vec![-1, 4]), 6).is_err());
        assert!(resolve_input_shape(&io(vec![1, 3]), 4).is_err());
        assert!(resolve_input_shape(&io(vec![-1, -1]), 4).is_err());
    }

    #[test]
    fn native_quantizer_tracks_float_model() {
        let tmp = TempDir::new().unwrap();
        let model = Sequential::new(vec![
            Layer::Linear {
                weight: vec![vec![0.5, -0.25, 1.0], vec![-1.0, 0.75, 0.125]],
                bias: Some(vec![0.1, -0.2]),
            },
            Layer::Relu,
            Layer::Scale { factor: 3.0 },
        ]);
        let input = ArrayD::from_shape_vec(IxDyn(&[1, 3]), vec![0.3, 0.6, 0.9]).unwrap();
        let (graph, data) = export(&tmp, &model, &input);
        let before = ExportRecord::read(&data).unwrap();

        NativeQuantizer::default().forward(&data, &graph, &data).unwrap();
        let after = ExportRecord::read(&data).unwrap();

        assert_eq!(after.input_shapes, before.input_shapes);
        let step = 1.0 / f64::from(1 << 18);
        for (q, f) in after.input_data[0].iter().zip(&before.input_data[0]) {
            assert!((q - f).abs() <= step);
        }
        for (q, f) in after.output_data[0].iter().zip(&before.output_data[0]) {
            assert!((q - f).abs() < 1e-4, "{q} vs {f}");
        }
    }

    #[test]
    fn products_beyond_i64_fail_instead_of_wrapping() {
        let tmp = TempDir::new().unwrap();
        let model = Sequential::new(vec![Layer::Scale { factor: 1e5 }]);
        let input = ArrayD::from_elem(IxDyn(&[1, 1]), 1e5_f32);
        let (graph, data) = export(&tmp, &model, &input);
        let before = std::fs::read_to_string(&data).unwrap();

        let err = NativeQuantizer::default()
            .forward(&data, &graph, &data)
            .unwrap_err();
        assert!(matches!(err, QuantizeError::Graph(_)), "{err}");
        assert_eq!(std::fs::read_to_string(&data).unwrap(), before);
    }

    #[test]
    fn inputs_beyond_the_scale_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let model = Sequential::new(vec![Layer::Flatten { start_dim: 1 }]);
        let input = ArrayD::from_shape_vec(IxDyn(&[1, 2]), vec![1e15_f32, 1.0]).unwrap();
        let (graph, data) = export(&tmp, &model, &input);

        let err = NativeQuantizer::default()
            .forward(&data, &graph, &data)
            .unwrap_err();
        assert!(matches!(err, QuantizeError::Graph(_)), "{err}");

        // The same record fits once the scale leaves enough headroom.
        let coarse = NativeQuantizer::new(ScaleConfig::new(2, 4).unwrap());
        coarse.forward(&data, &graph, &data).unwrap();
        let after = ExportRecord::read(&data).unwrap();
        assert_eq!(after.output_data[0][1], 1.0);
        assert!((after.output_data[0][0] - 1e15).abs() < 1e9);
    }

    #[test]
    fn record_with_two_inputs_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let model = Sequential::new(vec![Layer::Relu]);
        let input = ArrayD::from_elem(IxDyn(&[1, 2]), 0.05_f32);
        let (graph, data) = export(&tmp, &model, &input);

        let mut record = ExportRecord::read(&data).unwrap();
        record.input_data.push(vec![0.0, 0.0]);
        record.input_shapes.push(None);
        record.write(&data).unwrap();

        let err = NativeQuantizer::default()
            .forward(&data, &graph, &data)
            .unwrap_err();
        assert!(matches!(err, QuantizeError::Record(_)));
    }

    #[test]
    fn unreadable_graph_is_a_graph_error() {
        let tmp = TempDir::new().unwrap();
        let model = Sequential::new(vec![Layer::Relu]);
        let input = ArrayD::from_elem(IxDyn(&[1, 2]), 0.05_f32);
        let (graph, data) = export(&tmp, &model, &input);
        std::fs::write(&graph, b"not a model").unwrap();

        let err = NativeQuantizer::default()
            .forward(&data, &graph, &data)
            .unwrap_err();
        assert!(matches!(err, QuantizeError::Graph(_)));
    }

    #[test]
    fn command_receives_three_paths() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("args.txt");
        let quantizer = CommandQuantizer::new("sh")
            .arg("-c")
            .arg(format!("echo \"$1 $2 $3\" > {}", log.display()))
            .arg("quantize");

        quantizer
            .forward(Path::new("a.json"), Path::new("g.onnx"), Path::new("b.json"))
            .unwrap();
        let seen = std::fs::read_to_string(&log).unwrap();
        assert_eq!(seen.trim(), "a.json g.onnx b.json");
    }

    #[test]
    fn failing_command_reports_status_and_stderr() {
        let quantizer = CommandQuantizer::new("sh").args(["-c", "echo broken >&2; exit 3", "quantize"]);
        let err = quantizer
            .forward(Path::new("a"), Path::new("b"), Path::new("c"))
            .unwrap_err();
        match err {
            QuantizeError::Failed { status, stderr, .. } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = CommandQuantizer::new("zkexport-no-such-quantizer")
            .forward(Path::new("a"), Path::new("b"), Path::new("c"))
            .unwrap_err();
        assert!(matches!(err, QuantizeError::Spawn { .. }));
    }
}
