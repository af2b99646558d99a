//! Exports a model for zero-knowledge circuit generation: one forward pass,
//! an ONNX graph, a JSON record of the input and outputs, and a quantized
//! copy of that record.

#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod errors;
pub mod graph_export;
pub mod model;
pub mod pipeline;
pub mod quantize;
pub mod record;
pub mod tensor;

pub use errors::{ExportError, GraphExportError, ModelError, QuantizeError, RecordError};
pub use graph_export::{GraphExportConfig, GraphExporter, OnnxExporter};
pub use model::{Layer, Model, Sequential, TraceModel};
pub use pipeline::{export, export_default, Exporter, DEFAULT_DATA_PATH, DEFAULT_GRAPH_PATH};
pub use quantize::{CommandQuantizer, NativeQuantizer, Quantizer};
pub use record::ExportRecord;
pub use tensor::InputSpec;
pub use zkexport_onnx::ScaleConfig;
