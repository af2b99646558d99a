use std::io;
use std::process::ExitStatus;

use thiserror::Error;

/// Failure of a whole export. Every variant is terminal: the pipeline stops
/// at the failing stage and leaves earlier artifacts on disk.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Invalid input specification: {0}")]
    InvalidSpecification(String),

    #[error("Model forward pass failed: {0}")]
    Model(#[from] ModelError),

    #[error("Graph export failed: {0}")]
    GraphExport(#[source] GraphExportError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Quantization failed: {0}")]
    Quantization(#[from] QuantizeError),

    #[error("I/O error while accessing {path}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: String,
    },
}

impl From<GraphExportError> for ExportError {
    fn from(err: GraphExportError) -> Self {
        match err {
            GraphExportError::Io { source, path } => ExportError::Io { source, path },
            other => ExportError::GraphExport(other),
        }
    }
}

impl From<RecordError> for ExportError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::Io { source, path } => ExportError::Io { source, path },
            other => ExportError::Serialization(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Shape mismatch in {layer}: {message}")]
    Shape { layer: String, message: String },

    #[error("Unsupported construct: {0}")]
    Unsupported(String),

    #[error("Array shape error: {0}")]
    Array(#[from] ndarray::ShapeError),
}

#[derive(Debug, Error)]
pub enum GraphExportError {
    #[error("Running the model failed: {0}")]
    Model(#[from] ModelError),

    #[error("Traced graph does not match the model: {0}")]
    Trace(String),

    #[error("Invalid export configuration: {0}")]
    Config(String),

    #[error("Graph construction failed: {0:#}")]
    Graph(#[from] anyhow::Error),

    #[error("I/O error while accessing {path}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: String,
    },
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error while accessing {path}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Non-finite value {value} at {field}[{entry}][{index}]")]
    NonFinite {
        field: &'static str,
        entry: usize,
        index: usize,
        value: f64,
    },

    #[error("Malformed record: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum QuantizeError {
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Graph error: {0:#}")]
    Graph(#[from] anyhow::Error),

    #[error("Failed to launch quantizer '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Quantizer '{program}' exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum ArrayConversionError {
    #[error("Invalid array structure: expected {expected}, found {found}")]
    InvalidArrayStructure { expected: String, found: String },

    #[error("Ragged array: expected {expected} elements at depth {depth}, found {found}")]
    Ragged {
        depth: usize,
        expected: usize,
        found: usize,
    },

    #[error("Invalid number for target type: {0}")]
    InvalidNumber(String),

    #[error("Shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
}
