#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::should_implement_trait
)]

//! ONNX support for zkexport: graph construction and encoding, parsing,
//! constant folding, fixed-point quantization and integer inference.

pub mod builder;
mod fold;
pub mod graph;
pub mod inference;
pub mod ops;
pub mod parser;
pub mod proto;
pub mod quantizer;

pub use builder::{ir_version_for_opset, GraphBuilder, ModelMeta};
pub use graph::{LayerGraph, LayerNode, OpType};
pub use parser::{parse_onnx, parse_onnx_bytes, AttrValue, IoSpec, ParsedModel, TensorData};
pub use quantizer::{quantize_model, QuantizedModel, ScaleConfig};
