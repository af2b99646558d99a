//! Serializing a traced model to an ONNX file.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use zkexport_onnx::{GraphBuilder, ModelMeta, OpType};

use crate::errors::GraphExportError;
use crate::model::TraceModel;

pub const PRODUCER_NAME: &str = "zkexport";
pub const BATCH_DIM_PARAM: &str = "batch_size";

/// Options handed to the graph exporter. The default is the configuration the
/// export pipeline always uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphExportConfig {
    /// Embed parameters as initializers. When false they become graph
    /// inputs without data.
    pub export_params: bool,
    pub opset_version: i64,
    pub do_constant_folding: bool,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    /// Value name to `axis -> dim_param`.
    pub dynamic_axes: BTreeMap<String, BTreeMap<usize, String>>,
}

impl Default for GraphExportConfig {
    fn default() -> Self {
        let batch_axis = || BTreeMap::from([(0, BATCH_DIM_PARAM.to_string())]);
        Self {
            export_params: true,
            opset_version: 10,
            do_constant_folding: true,
            input_names: vec!["input".to_string()],
            output_names: vec!["output".to_string()],
            dynamic_axes: BTreeMap::from([
                ("input".to_string(), batch_axis()),
                ("output".to_string(), batch_axis()),
            ]),
        }
    }
}

impl GraphExportConfig {
    /// Name given to the `index`-th model output. Outputs beyond
    /// `output_names` reuse the first name with a numeric suffix.
    pub fn output_name(&self, index: usize) -> String {
        match self.output_names.get(index) {
            Some(name) => name.clone(),
            None => {
                let base = self.output_names.first().map_or("output", String::as_str);
                format!("{base}_{index}")
            }
        }
    }
}

/// Writes a model's graph to `path` given an example input.
pub trait GraphExporter {
    fn export<M: TraceModel + ?Sized>(
        &self,
        model: &M,
        input: &ArrayD<f32>,
        path: &Path,
        config: &GraphExportConfig,
    ) -> Result<(), GraphExportError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OnnxExporter;

impl OnnxExporter {
    /// Traces `model` into a finished graph without writing it.
    pub fn build_graph<M: TraceModel + ?Sized>(
        &self,
        model: &M,
        input: &ArrayD<f32>,
        config: &GraphExportConfig,
    ) -> Result<GraphBuilder, GraphExportError> {
        let input_name = config
            .input_names
            .first()
            .ok_or_else(|| GraphExportError::Config("input_names is empty".to_string()))?;

        let outputs = model.forward(input)?;

        let mut graph = GraphBuilder::new("main_graph");
        let input_name = graph.add_input(input_name.as_str(), input.shape());
        let traced = model.trace(&mut graph, &input_name)?;

        if traced.len() != outputs.len() {
            return Err(GraphExportError::Trace(format!(
                "trace produced {} outputs but forward produced {}",
                traced.len(),
                outputs.len()
            )));
        }

        let mut renamed: HashMap<String, String> = HashMap::new();
        for (index, (value, array)) in traced.iter().zip(&outputs).enumerate() {
            let target = config.output_name(index);
            let source = match renamed.get(value) {
                // A value returned twice needs its own node per output name.
                Some(first) => {
                    let first = first.clone();
                    graph.add_node(OpType::Identity, &[first.as_str()], vec![])
                }
                None if !graph.is_node_output(value) => {
                    graph.add_node(OpType::Identity, &[value.as_str()], vec![])
                }
                None => value.clone(),
            };
            graph.rename_value(&source, &target)?;
            graph.add_output(target.as_str(), array.shape());
            renamed.entry(value.clone()).or_insert(target);
        }

        for (value, axes) in &config.dynamic_axes {
            for (&axis, param) in axes {
                graph.set_dim_param(value, axis, param)?;
            }
        }

        if config.do_constant_folding {
            let folded = graph.fold_constants()?;
            tracing::debug!(folded, "constant folding finished");
        }

        if !config.export_params {
            graph.externalize_params();
        }

        Ok(graph)
    }
}

impl GraphExporter for OnnxExporter {
    fn export<M: TraceModel + ?Sized>(
        &self,
        model: &M,
        input: &ArrayD<f32>,
        path: &Path,
        config: &GraphExportConfig,
    ) -> Result<(), GraphExportError> {
        let graph = self.build_graph(model, input, config)?;

        let meta = ModelMeta {
            opset_version: config.opset_version,
            producer_name: PRODUCER_NAME.to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let bytes = graph.write(path, &meta).map_err(|source| GraphExportError::Io {
            source,
            path: path.display().to_string(),
        })?;

        tracing::info!(
            path = %path.display(),
            bytes,
            nodes = graph.nodes().len(),
            initializers = graph.initializers().len(),
            "wrote ONNX graph"
        );
        Ok(())
    }
}
