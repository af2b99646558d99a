use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::errors::RecordError;
use crate::tensor::flatten;

/// The JSON sidecar consumed by the quantizer. Field order is the key order
/// on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub input_shapes: Vec<Option<Vec<usize>>>,
    pub input_data: Vec<Vec<f64>>,
    pub output_data: Vec<Vec<f64>>,
}

impl ExportRecord {
    /// Flattens the input and every output in row-major order.
    pub fn new(
        input_shape: Option<&[usize]>,
        input: &ArrayD<f32>,
        outputs: &[ArrayD<f32>],
    ) -> Result<Self, RecordError> {
        let record = Self {
            input_shapes: vec![input_shape.map(<[usize]>::to_vec)],
            input_data: vec![flatten(input)],
            output_data: outputs.iter().map(flatten).collect(),
        };
        record.check_finite()?;
        Ok(record)
    }

    /// JSON has no representation for NaN or infinities, so they are refused
    /// instead of being written as `null`.
    pub fn check_finite(&self) -> Result<(), RecordError> {
        for (field, rows) in [("input_data", &self.input_data), ("output_data", &self.output_data)] {
            for (entry, row) in rows.iter().enumerate() {
                if let Some((index, &value)) = row.iter().enumerate().find(|(_, v)| !v.is_finite()) {
                    return Err(RecordError::NonFinite {
                        field,
                        entry,
                        index,
                        value,
                    });
                }
            }
        }
        Ok(())
    }

    /// Writes the record as JSON, replacing any existing file.
    pub fn write(&self, path: &Path) -> Result<(), RecordError> {
        self.check_finite()?;
        let io_err = |source: std::io::Error| RecordError::Io {
            source,
            path: path.display().to_string(),
        };
        let file = File::create(path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush().map_err(io_err)?;
        tracing::debug!(path = %path.display(), "wrote export record");
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, RecordError> {
        let file = File::open(path).map_err(|source| RecordError::Io {
            source,
            path: path.display().to_string(),
        })?;
        let record: Self = serde_json::from_reader(BufReader::new(file))?;
        record.check_finite()?;
        Ok(record)
    }

    /// The single input entry the quantizer works on.
    pub fn single_input(&self) -> Result<&[f64], RecordError> {
        match (self.input_data.as_slice(), self.input_shapes.len()) {
            ([data], 1) => Ok(data.as_slice()),
            (data, shapes) => Err(RecordError::Malformed(format!(
                "expected exactly one input entry, found {} data and {shapes} shape entries",
                data.len()
            ))),
        }
    }
}
