use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{bail, ensure, Result};

use super::ops;
use super::parser::{AttrValue, IoSpec, ParsedModel, TensorData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum OpType {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Gemm,
    MatMul,
    Relu,
    Reshape,
    Flatten,
    Identity,
    Transpose,
    Constant,
}

impl OpType {
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "Add" => Ok(Self::Add),
            "Sub" => Ok(Self::Sub),
            "Mul" => Ok(Self::Mul),
            "Div" => Ok(Self::Div),
            "Neg" => Ok(Self::Neg),
            "Gemm" => Ok(Self::Gemm),
            "MatMul" => Ok(Self::MatMul),
            "Relu" => Ok(Self::Relu),
            "Reshape" => Ok(Self::Reshape),
            "Flatten" => Ok(Self::Flatten),
            "Identity" => Ok(Self::Identity),
            "Transpose" => Ok(Self::Transpose),
            "Constant" => Ok(Self::Constant),
            other => bail!("unsupported ONNX op: {}", other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "Add",
            Self::Sub => "Sub",
            Self::Mul => "Mul",
            Self::Div => "Div",
            Self::Neg => "Neg",
            Self::Gemm => "Gemm",
            Self::MatMul => "MatMul",
            Self::Relu => "Relu",
            Self::Reshape => "Reshape",
            Self::Flatten => "Flatten",
            Self::Identity => "Identity",
            Self::Transpose => "Transpose",
            Self::Constant => "Constant",
        }
    }

    pub fn is_shape_only(&self) -> bool {
        matches!(
            self,
            Self::Reshape | Self::Flatten | Self::Identity | Self::Transpose
        )
    }

    pub fn needs_rescale(&self) -> bool {
        matches!(self, Self::Gemm | Self::MatMul | Self::Mul)
    }

    /// Ops the exporter may evaluate at export time when every input is a
    /// constant.
    pub fn is_foldable(&self) -> bool {
        !matches!(self, Self::Gemm | Self::MatMul | Self::Relu)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LayerNode {
    pub id: usize,
    pub name: String,
    pub op_type: OpType,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub weights: HashMap<String, TensorData>,
    pub attributes: BTreeMap<String, AttrValue>,
    pub needs_rescale: bool,
    pub n_bits: Option<usize>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LayerGraph {
    pub layers: Vec<LayerNode>,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    pub topo_order: Vec<usize>,
    pub inputs: HashMap<String, IoSpec>,
}

impl LayerGraph {
    pub fn from_parsed(model: &ParsedModel) -> Result<Self> {
        let layers = model
            .nodes
            .iter()
            .enumerate()
            .map(|(id, node)| {
                let op_type = OpType::from_str(&node.op_type)?;
                let weights = node
                    .inputs
                    .iter()
                    .filter_map(|name| Some((name.clone(), model.initializers.get(name)?.clone())))
                    .collect();
                Ok(LayerNode {
                    id,
                    name: node.name.clone(),
                    op_type,
                    inputs: node.inputs.clone(),
                    outputs: node.outputs.clone(),
                    weights,
                    attributes: node.attributes.clone(),
                    needs_rescale: op_type.needs_rescale(),
                    n_bits: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // Initializers may also be listed as graph inputs; only the rest carry data.
        let data_inputs: Vec<&IoSpec> = model
            .inputs
            .iter()
            .filter(|io| !model.initializers.contains_key(&io.name))
            .collect();

        let topo_order = topological_sort(&layers)?;

        Ok(LayerGraph {
            input_names: data_inputs.iter().map(|io| io.name.clone()).collect(),
            inputs: data_inputs
                .into_iter()
                .map(|io| (io.name.clone(), io.clone()))
                .collect(),
            output_names: model.outputs.iter().map(|io| io.name.clone()).collect(),
            topo_order,
            layers,
        })
    }

    pub fn iter_topo(&self) -> impl Iterator<Item = &LayerNode> {
        self.topo_order.iter().map(|&idx| &self.layers[idx])
    }
}

impl LayerNode {
    pub fn get_int_attr(&self, name: &str) -> Option<i64> {
        ops::int_attr(&self.attributes, name)
    }

    pub fn get_float_attr(&self, name: &str) -> Option<f32> {
        ops::float_attr(&self.attributes, name)
    }

    pub fn get_tensor_attr(&self, name: &str) -> Option<&TensorData> {
        match self.attributes.get(name)? {
            AttrValue::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

/// Kahn's algorithm. Among ready layers the lowest index goes first, so a
/// graph that is already sorted keeps its node order.
fn topological_sort(layers: &[LayerNode]) -> Result<Vec<usize>> {
    let producer: HashMap<&str, usize> = layers
        .iter()
        .enumerate()
        .flat_map(|(idx, layer)| layer.outputs.iter().map(move |o| (o.as_str(), idx)))
        .collect();

    let mut pending = vec![0usize; layers.len()];
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); layers.len()];
    for (idx, layer) in layers.iter().enumerate() {
        let deps: BTreeSet<usize> = layer
            .inputs
            .iter()
            .filter_map(|i| producer.get(i.as_str()).copied())
            .filter(|&dep| dep != idx)
            .collect();
        pending[idx] = deps.len();
        for dep in deps {
            consumers[dep].push(idx);
        }
    }

    let mut ready: BTreeSet<usize> = (0..layers.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(layers.len());
    while let Some(idx) = ready.pop_first() {
        order.push(idx);
        for &next in &consumers[idx] {
            pending[next] -= 1;
            if pending[next] == 0 {
                ready.insert(next);
            }
        }
    }

    ensure!(
        order.len() == layers.len(),
        "layer graph has a cycle through {} layers",
        layers.len() - order.len()
    );
    Ok(order)
}
