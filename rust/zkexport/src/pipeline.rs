use std::path::Path;

use rand::Rng;

use crate::errors::{ExportError, ModelError};
use crate::graph_export::{GraphExportConfig, GraphExporter, OnnxExporter};
use crate::model::TraceModel;
use crate::quantize::{NativeQuantizer, Quantizer};
use crate::record::ExportRecord;
use crate::tensor::InputSpec;

pub const DEFAULT_GRAPH_PATH: &str = "network.onnx";
pub const DEFAULT_DATA_PATH: &str = "input.json";

/// Runs a model once and leaves behind everything a circuit build needs: the
/// ONNX graph, the JSON record of its input and outputs, and the quantized
/// version of that record.
#[derive(Debug, Clone, Default)]
pub struct Exporter<G = OnnxExporter, Q = NativeQuantizer> {
    graph_exporter: G,
    quantizer: Q,
    graph_config: GraphExportConfig,
}

impl<G: GraphExporter, Q: Quantizer> Exporter<G, Q> {
    pub fn new(graph_exporter: G, quantizer: Q) -> Self {
        Self {
            graph_exporter,
            quantizer,
            graph_config: GraphExportConfig::default(),
        }
    }

    pub fn with_graph_config(mut self, config: GraphExportConfig) -> Self {
        self.graph_config = config;
        self
    }

    /// Returns the record as written before quantization. Artifacts from
    /// completed stages stay on disk if a later stage fails.
    pub fn export<M, R>(
        &self,
        model: &M,
        spec: &InputSpec,
        graph_path: &Path,
        data_path: &Path,
        rng: &mut R,
    ) -> Result<ExportRecord, ExportError>
    where
        M: TraceModel + ?Sized,
        R: Rng + ?Sized,
    {
        let input = spec.materialize(rng)?;
        tracing::debug!(shape = ?input.shape(), "built model input");

        let outputs = model.forward(&input)?;
        if outputs.is_empty() {
            return Err(ModelError::Unsupported("model returned no outputs".to_string()).into());
        }
        tracing::debug!(
            shapes = ?outputs.iter().map(|o| o.shape().to_vec()).collect::<Vec<_>>(),
            "forward pass done"
        );

        self.graph_exporter
            .export(model, &input, graph_path, &self.graph_config)?;

        let record = ExportRecord::new(spec.declared_shape(), &input, &outputs)?;
        record.write(data_path)?;
        tracing::info!(path = %data_path.display(), "wrote input/output record");

        self.quantizer.forward(data_path, graph_path, data_path)?;
        tracing::info!(
            graph = %graph_path.display(),
            data = %data_path.display(),
            "export finished"
        );

        Ok(record)
    }
}

/// [`Exporter::export`] with the default collaborators and a thread-local
/// random source.
pub fn export<M: TraceModel + ?Sized>(
    model: &M,
    spec: &InputSpec,
    graph_path: &Path,
    data_path: &Path,
) -> Result<ExportRecord, ExportError> {
    Exporter::<OnnxExporter, NativeQuantizer>::default().export(
        model,
        spec,
        graph_path,
        data_path,
        &mut rand::thread_rng(),
    )
}

/// Exports to `network.onnx` and `input.json` in the working directory.
pub fn export_default<M: TraceModel + ?Sized>(
    model: &M,
    spec: &InputSpec,
) -> Result<ExportRecord, ExportError> {
    export(
        model,
        spec,
        Path::new(DEFAULT_GRAPH_PATH),
        Path::new(DEFAULT_DATA_PATH),
    )
}
