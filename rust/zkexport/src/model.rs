//! Models the exporter can run and trace, plus a small sequential model
//! described in JSON.

use std::path::Path;

use anyhow::Context;
use ndarray::{Array1, Array2, ArrayD, Ix2, IxDyn};
use serde::{Deserialize, Serialize};
use zkexport_onnx::{AttrValue, GraphBuilder, OpType, TensorData};

use crate::errors::ModelError;

/// Anything callable on a single input tensor that yields one or more
/// output tensors.
pub trait Model {
    fn forward(&self, input: &ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, ModelError>;
}

/// A model that can describe its forward computation as ONNX nodes.
pub trait TraceModel: Model {
    /// Appends the model's nodes to `graph`, reading from the value `input`,
    /// and returns the names of its output values in `forward` order.
    fn trace(&self, graph: &mut GraphBuilder, input: &str) -> Result<Vec<String>, ModelError>;
}

impl<M: Model + ?Sized> Model for Box<M> {
    fn forward(&self, input: &ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, ModelError> {
        (**self).forward(input)
    }
}

impl<M: TraceModel + ?Sized> TraceModel for Box<M> {
    fn trace(&self, graph: &mut GraphBuilder, input: &str) -> Result<Vec<String>, ModelError> {
        (**self).trace(graph, input)
    }
}

fn default_start_dim() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Layer {
    /// Collapses every axis from `start_dim` onwards into one.
    Flatten {
        #[serde(default = "default_start_dim")]
        start_dim: usize,
    },
    /// `y = x · weightᵀ + bias` over a `[batch, in]` input; `weight` is
    /// `[out][in]`.
    Linear {
        weight: Vec<Vec<f32>>,
        #[serde(default)]
        bias: Option<Vec<f32>>,
    },
    Relu,
    Scale { factor: f32 },
}

impl Layer {
    fn kind(&self) -> &'static str {
        match self {
            Layer::Flatten { .. } => "flatten",
            Layer::Linear { .. } => "linear",
            Layer::Relu => "relu",
            Layer::Scale { .. } => "scale",
        }
    }

    fn shape_error(&self, index: usize, message: String) -> ModelError {
        ModelError::Shape {
            layer: format!("{}[{index}]", self.kind()),
            message,
        }
    }

    fn flatten_dims(&self, index: usize, dims: &[usize], start_dim: usize) -> Result<Vec<usize>, ModelError> {
        if start_dim >= dims.len() {
            return Err(self.shape_error(
                index,
                format!("start_dim {start_dim} out of range for rank {}", dims.len()),
            ));
        }
        let mut out = dims[..start_dim].to_vec();
        out.push(dims[start_dim..].iter().product());
        Ok(out)
    }

    fn linear_params(
        &self,
        index: usize,
        weight: &[Vec<f32>],
        bias: Option<&[f32]>,
    ) -> Result<(Array2<f32>, Array1<f32>), ModelError> {
        let rows = weight.len();
        let cols = weight.first().map_or(0, Vec::len);
        if rows == 0 || cols == 0 {
            return Err(self.shape_error(index, "weight matrix is empty".to_string()));
        }
        if let Some(row) = weight.iter().position(|r| r.len() != cols) {
            return Err(self.shape_error(
                index,
                format!("weight row {row} has {} columns, expected {cols}", weight[row].len()),
            ));
        }
        let w = Array2::from_shape_vec((rows, cols), weight.iter().flatten().copied().collect())?;
        let b = match bias {
            Some(b) if b.len() != rows => {
                return Err(self.shape_error(
                    index,
                    format!("bias has {} entries for {rows} outputs", b.len()),
                ))
            }
            Some(b) => Array1::from(b.to_vec()),
            None => Array1::zeros(rows),
        };
        Ok((w, b))
    }

    fn forward(&self, index: usize, x: ArrayD<f32>) -> Result<ArrayD<f32>, ModelError> {
        match self {
            Layer::Flatten { start_dim } => {
                let dims = self.flatten_dims(index, x.shape(), *start_dim)?;
                Ok(ArrayD::from_shape_vec(IxDyn(&dims), x.iter().copied().collect())?)
            }
            Layer::Linear { weight, bias } => {
                let (w, b) = self.linear_params(index, weight, bias.as_deref())?;
                if x.ndim() != 2 || x.shape()[1] != w.ncols() {
                    return Err(self.shape_error(
                        index,
                        format!("expected input [batch, {}], got {:?}", w.ncols(), x.shape()),
                    ));
                }
                let x = x.into_dimensionality::<Ix2>()?;
                Ok((x.dot(&w.t()) + &b).into_dyn())
            }
            Layer::Relu => Ok(x.mapv(|v| v.max(0.0))),
            Layer::Scale { factor } => Ok(x.mapv(|v| v * factor)),
        }
    }

    fn trace(
        &self,
        index: usize,
        graph: &mut GraphBuilder,
        x: &str,
    ) -> Result<String, ModelError> {
        let value = match self {
            Layer::Flatten { start_dim: 1 } => {
                graph.add_node(OpType::Flatten, &[x], vec![("axis", AttrValue::Int(1))])
            }
            Layer::Flatten { start_dim } => {
                // Leading axes are copied through so the batch stays dynamic.
                let mut target = vec![0_i64; *start_dim];
                target.push(-1);
                let shape = graph.add_i64_initializer("flatten_shape", &target);
                graph.add_node(OpType::Reshape, &[x, &shape], vec![])
            }
            Layer::Linear { weight, bias } => {
                let (w, b) = self.linear_params(index, weight, bias.as_deref())?;
                let w = graph.add_f32_initializer("weight", &w.into_dyn());
                let b = graph.add_f32_initializer("bias", &b.into_dyn());
                graph.add_node(
                    OpType::Gemm,
                    &[x, &w, &b],
                    vec![
                        ("alpha", AttrValue::Float(1.0)),
                        ("beta", AttrValue::Float(1.0)),
                        ("transB", AttrValue::Int(1)),
                    ],
                )
            }
            Layer::Relu => graph.add_node(OpType::Relu, &[x], vec![]),
            Layer::Scale { factor } => {
                let factor = graph.add_node(
                    OpType::Constant,
                    &[],
                    vec![(
                        "value",
                        AttrValue::Tensor(TensorData::from_f64("", vec![], vec![f64::from(*factor)])),
                    )],
                );
                graph.add_node(OpType::Mul, &[x, &factor], vec![])
            }
        };
        Ok(value)
    }
}

/// Layers applied in order; the single output is the last layer's result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequential {
    pub layers: Vec<Layer>,
}

impl Sequential {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading model {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing model {}", path.display()))
    }
}

impl Model for Sequential {
    fn forward(&self, input: &ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, ModelError> {
        let out = self
            .layers
            .iter()
            .enumerate()
            .try_fold(input.clone(), |x, (i, layer)| layer.forward(i, x))?;
        Ok(vec![out])
    }
}

impl TraceModel for Sequential {
    fn trace(&self, graph: &mut GraphBuilder, input: &str) -> Result<Vec<String>, ModelError> {
        let out = self
            .layers
            .iter()
            .enumerate()
            .try_fold(input.to_string(), |x, (i, layer)| layer.trace(i, graph, &x))?;
        Ok(vec![out])
    }
}
