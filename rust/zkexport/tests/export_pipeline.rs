use std::cell::RefCell;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;
use zkexport::{
    CommandQuantizer, ExportError, ExportRecord, Exporter, GraphExportConfig, InputSpec, Layer,
    Model, ModelError, NativeQuantizer, OnnxExporter, QuantizeError, Quantizer, Sequential,
    TraceModel,
};
use zkexport_onnx::{parse_onnx, GraphBuilder, OpType};

fn paths(tmp: &TempDir) -> (PathBuf, PathBuf) {
    (tmp.path().join("network.onnx"), tmp.path().join("input.json"))
}

fn native_exporter() -> Exporter {
    Exporter::default()
}

fn flatten_model() -> Sequential {
    Sequential::new(vec![Layer::Flatten { start_dim: 1 }])
}

fn literal_9x2() -> ArrayD<f32> {
    let values = vec![
        0.06980138, 0.01617849, 0.05047512, 0.08226728, 0.03163215, 0.00917083, 0.09520084,
        0.02375662, 0.04466381, 0.07311105, 0.01038749, 0.05998234, 0.08812311, 0.03590417,
        0.02203866, 0.06641352, 0.09077743, 0.04129508,
    ];
    ArrayD::from_shape_vec(IxDyn(&[9, 2]), values).unwrap()
}

/// Records the paths it is called with instead of quantizing.
#[derive(Default)]
struct RecordingQuantizer {
    calls: RefCell<Vec<(PathBuf, PathBuf, PathBuf)>>,
}

impl Quantizer for RecordingQuantizer {
    fn forward(&self, source: &Path, graph: &Path, dest: &Path) -> Result<(), QuantizeError> {
        self.calls
            .borrow_mut()
            .push((source.to_path_buf(), graph.to_path_buf(), dest.to_path_buf()));
        Ok(())
    }
}

/// Two outputs: `relu(x)` and `-x`.
struct TwoHeads;

impl Model for TwoHeads {
    fn forward(&self, input: &ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, ModelError> {
        Ok(vec![input.mapv(|v| v.max(0.0)), input.mapv(|v| -v)])
    }
}

impl TraceModel for TwoHeads {
    fn trace(&self, graph: &mut GraphBuilder, input: &str) -> Result<Vec<String>, ModelError> {
        let relu = graph.add_node(OpType::Relu, &[input], vec![]);
        let neg = graph.add_node(OpType::Neg, &[input], vec![]);
        Ok(vec![relu, neg])
    }
}

#[test]
fn flatten_export_with_literal_array() {
    let tmp = TempDir::new().unwrap();
    let (graph, data) = paths(&tmp);
    let array = literal_9x2();
    let spec = InputSpec::from_shape([9, 2]).with_array(array.clone());

    let record = native_exporter()
        .export(&flatten_model(), &spec, &graph, &data, &mut StdRng::seed_from_u64(1))
        .unwrap();

    assert!(graph.exists());
    let parsed = parse_onnx(&graph).unwrap();
    assert_eq!(parsed.inputs[0].name, "input");
    assert_eq!(parsed.outputs[0].name, "output");

    let expected: Vec<f64> = array.iter().map(|&v| f64::from(v)).collect();
    assert_eq!(record.input_shapes, vec![Some(vec![9, 2])]);
    assert_eq!(record.input_data, vec![expected.clone()]);
    assert_eq!(record.output_data, vec![expected.clone()]);

    let quantized = ExportRecord::read(&data).unwrap();
    assert_eq!(quantized.input_shapes, record.input_shapes);
    let step = 1.0 / f64::from(1 << 18);
    for (q, f) in quantized.output_data[0].iter().zip(&expected) {
        assert!((q - f).abs() <= step, "{q} too far from {f}");
    }
}

#[test]
fn random_input_from_shape_only() {
    let tmp = TempDir::new().unwrap();
    let (graph, data) = paths(&tmp);

    let record = native_exporter()
        .export(
            &flatten_model(),
            &InputSpec::from_shape([3, 2, 3]),
            &graph,
            &data,
            &mut StdRng::seed_from_u64(2),
        )
        .unwrap();

    assert_eq!(record.input_data[0].len(), 18);
    assert!(record.input_data[0].iter().all(|&v| (0.0..0.1).contains(&v)));
    assert_eq!(record.output_data[0], record.input_data[0]);
}

#[test]
fn literal_runs_repeat_and_random_runs_differ() {
    let tmp = TempDir::new().unwrap();
    let (graph, data) = paths(&tmp);
    let exporter = Exporter::new(OnnxExporter, RecordingQuantizer::default());
    let model = flatten_model();

    let literal = InputSpec::from_array(literal_9x2());
    let a = exporter
        .export(&model, &literal, &graph, &data, &mut StdRng::seed_from_u64(3))
        .unwrap();
    let b = exporter
        .export(&model, &literal, &graph, &data, &mut StdRng::seed_from_u64(4))
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(a.input_shapes, vec![None]);

    let shaped = InputSpec::from_shape([3, 2, 3]);
    let mut rng = StdRng::seed_from_u64(5);
    let c = exporter.export(&model, &shaped, &graph, &data, &mut rng).unwrap();
    let d = exporter.export(&model, &shaped, &graph, &data, &mut rng).unwrap();
    assert_ne!(c.input_data, d.input_data);
}

#[test]
fn quantizer_reads_and_writes_the_data_file() {
    let tmp = TempDir::new().unwrap();
    let (graph, data) = paths(&tmp);
    let quantizer = RecordingQuantizer::default();

    Exporter::new(OnnxExporter, &quantizer)
        .export(
            &flatten_model(),
            &InputSpec::from_shape([4]),
            &graph,
            &data,
            &mut StdRng::seed_from_u64(6),
        )
        .unwrap();

    assert_eq!(
        quantizer.calls.borrow().as_slice(),
        &[(data.clone(), graph.clone(), data.clone())]
    );
}

#[test]
fn one_output_entry_per_model_output() {
    let tmp = TempDir::new().unwrap();
    let (graph, data) = paths(&tmp);

    let record = native_exporter()
        .export(
            &TwoHeads,
            &InputSpec::from_shape([5]),
            &graph,
            &data,
            &mut StdRng::seed_from_u64(7),
        )
        .unwrap();
    assert_eq!(record.output_data.len(), 2);

    let names: Vec<String> = parse_onnx(&graph)
        .unwrap()
        .outputs
        .into_iter()
        .map(|io| io.name)
        .collect();
    assert_eq!(names, vec!["output", "output_1"]);
    assert_eq!(ExportRecord::read(&data).unwrap().output_data.len(), 2);
}

#[test]
fn custom_graph_config_reaches_the_exporter() {
    let tmp = TempDir::new().unwrap();
    let (graph, data) = paths(&tmp);
    let config = GraphExportConfig {
        export_params: false,
        ..GraphExportConfig::default()
    };

    Exporter::new(OnnxExporter, RecordingQuantizer::default())
        .with_graph_config(config)
        .export(
            &Sequential::new(vec![Layer::Linear {
                weight: vec![vec![1.0, 2.0]],
                bias: None,
            }]),
            &InputSpec::from_shape([2]),
            &graph,
            &data,
            &mut StdRng::seed_from_u64(15),
        )
        .unwrap();

    let parsed = parse_onnx(&graph).unwrap();
    assert!(parsed.initializers.is_empty());
    assert!(parsed.inputs.len() > 1);
}

#[test]
fn mismatched_or_missing_input_is_invalid() {
    let tmp = TempDir::new().unwrap();
    let (graph, data) = paths(&tmp);
    let exporter = native_exporter();
    let mut rng = StdRng::seed_from_u64(8);

    let mismatched = InputSpec::from_shape([2, 9]).with_array(literal_9x2());
    let err = exporter
        .export(&flatten_model(), &mismatched, &graph, &data, &mut rng)
        .unwrap_err();
    assert!(matches!(err, ExportError::InvalidSpecification(_)));

    let err = exporter
        .export(&flatten_model(), &InputSpec::default(), &graph, &data, &mut rng)
        .unwrap_err();
    assert!(matches!(err, ExportError::InvalidSpecification(_)));
    assert!(!graph.exists());
}

#[test]
fn non_finite_outputs_fail_serialization_after_graph_export() {
    let tmp = TempDir::new().unwrap();
    let (graph, data) = paths(&tmp);
    let model = Sequential::new(vec![Layer::Scale { factor: f32::INFINITY }]);

    let err = native_exporter()
        .export(&model, &InputSpec::from_shape([2]), &graph, &data, &mut StdRng::seed_from_u64(9))
        .unwrap_err();

    assert!(matches!(err, ExportError::Serialization(_)), "{err}");
    assert!(graph.exists());
    assert!(!data.exists());
}

#[test]
fn failing_quantizer_keeps_earlier_artifacts() {
    let tmp = TempDir::new().unwrap();
    let (graph, data) = paths(&tmp);
    let quantizer = CommandQuantizer::new("sh").args(["-c", "exit 1", "quantize"]);

    let err = Exporter::new(OnnxExporter, quantizer)
        .export(
            &flatten_model(),
            &InputSpec::from_shape([2, 2]),
            &graph,
            &data,
            &mut StdRng::seed_from_u64(10),
        )
        .unwrap_err();

    assert!(matches!(err, ExportError::Quantization(QuantizeError::Failed { .. })));
    assert!(graph.exists());
    assert_eq!(ExportRecord::read(&data).unwrap().input_data[0].len(), 4);
}

#[test]
fn out_of_range_values_fail_quantization_without_panicking() {
    let tmp = TempDir::new().unwrap();
    let (graph, data) = paths(&tmp);
    let model = Sequential::new(vec![Layer::Scale { factor: 1e5 }]);
    let input = ArrayD::from_elem(IxDyn(&[1]), 1e5_f32);

    let err = native_exporter()
        .export(
            &model,
            &InputSpec::from_array(input),
            &graph,
            &data,
            &mut StdRng::seed_from_u64(13),
        )
        .unwrap_err();
    assert!(matches!(err, ExportError::Quantization(QuantizeError::Graph(_))), "{err}");

    let wide = ArrayD::from_shape_vec(IxDyn(&[2]), vec![1e15_f32, 1.0]).unwrap();
    let err = native_exporter()
        .export(
            &flatten_model(),
            &InputSpec::from_array(wide),
            &graph,
            &data,
            &mut StdRng::seed_from_u64(14),
        )
        .unwrap_err();
    assert!(matches!(err, ExportError::Quantization(_)), "{err}");
    assert_eq!(ExportRecord::read(&data).unwrap().output_data[0][1], 1.0);
}

#[test]
fn unwritable_graph_path_is_an_io_error() {
    let tmp = TempDir::new().unwrap();
    let graph = tmp.path().join("no_such_dir").join("network.onnx");
    let data = tmp.path().join("input.json");

    let err = Exporter::new(OnnxExporter, NativeQuantizer::default())
        .export(
            &flatten_model(),
            &InputSpec::from_shape([2]),
            &graph,
            &data,
            &mut StdRng::seed_from_u64(11),
        )
        .unwrap_err();

    match err {
        ExportError::Io { path, .. } => assert!(path.ends_with("network.onnx")),
        other => panic!("expected Io, got {other:?}"),
    }
}

#[test]
fn binary_forward_subcommand_works_as_command_quantizer() {
    let tmp = TempDir::new().unwrap();
    let (graph, data) = paths(&tmp);
    let quantizer = CommandQuantizer::new(env!("CARGO_BIN_EXE_zkexport"))
        .args(["forward", "--scale-exponent", "12"]);

    let record = Exporter::new(OnnxExporter, quantizer)
        .export(
            &flatten_model(),
            &InputSpec::from_array(literal_9x2()),
            &graph,
            &data,
            &mut StdRng::seed_from_u64(12),
        )
        .unwrap();

    let quantized = ExportRecord::read(&data).unwrap();
    let step = 1.0 / f64::from(1 << 12);
    for (q, f) in quantized.input_data[0].iter().zip(&record.input_data[0]) {
        assert!((q - f).abs() <= step);
        assert_eq!((q * f64::from(1 << 12)).fract(), 0.0);
    }
}
