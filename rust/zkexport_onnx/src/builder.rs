use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{bail, ensure, Result};
use ndarray::ArrayD;
use prost::Message;

use super::fold;
use super::graph::OpType;
use super::parser::{AttrValue, IoSpec, ParsedNode, TensorData, ONNX_FLOAT, ONNX_INT64};
use super::proto::attribute_proto::AttributeType;
use super::proto::{
    tensor_shape_proto, type_proto, AttributeProto, GraphProto, ModelProto, NodeProto,
    OperatorSetIdProto, TensorShapeProto, TypeProto, ValueInfoProto,
};

/// Metadata stamped on an encoded model.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    pub opset_version: i64,
    pub producer_name: String,
    pub producer_version: String,
}

/// Maps an opset of the default domain to the IR version that introduced it.
pub fn ir_version_for_opset(opset: i64) -> i64 {
    match opset {
        i64::MIN..=8 => 3,
        9 => 4,
        10 => 5,
        11 => 6,
        12..=14 => 7,
        15..=18 => 8,
        19..=20 => 9,
        _ => 10,
    }
}

/// Incrementally assembles an ONNX graph while a model describes its forward
/// computation.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    name: String,
    nodes: Vec<ParsedNode>,
    initializers: Vec<TensorData>,
    inputs: Vec<IoSpec>,
    outputs: Vec<IoSpec>,
    next_id: usize,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            initializers: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            next_id: 0,
        }
    }

    fn fresh_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn add_input(&mut self, name: impl Into<String>, shape: &[usize]) -> String {
        let name = name.into();
        self.inputs.push(IoSpec {
            name: name.clone(),
            shape: shape.iter().map(|&d| d as i64).collect(),
            elem_type: ONNX_FLOAT,
            dim_params: BTreeMap::new(),
        });
        name
    }

    /// Adds a constant under a fresh name derived from `hint`.
    pub fn add_initializer(&mut self, hint: &str, mut tensor: TensorData) -> String {
        let name = format!("{hint}_{}", self.fresh_id());
        tensor.name = name.clone();
        self.initializers.push(tensor);
        name
    }

    pub fn add_f32_initializer(&mut self, hint: &str, array: &ArrayD<f32>) -> String {
        self.add_initializer(hint, TensorData::from_f32_array("", array))
    }

    pub fn add_i64_initializer(&mut self, hint: &str, values: &[i64]) -> String {
        self.add_initializer(
            hint,
            TensorData::from_i64("", vec![values.len() as i64], values.to_vec()),
        )
    }

    /// Appends a single-output node and returns the name of its output value.
    pub fn add_node(
        &mut self,
        op: OpType,
        inputs: &[&str],
        attributes: Vec<(&str, AttrValue)>,
    ) -> String {
        let id = self.fresh_id();
        let name = format!("{}_{id}", op.as_str());
        let output = format!("{name}_output_0");
        self.nodes.push(ParsedNode {
            name,
            op_type: op.as_str().to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: vec![output.clone()],
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            domain: String::new(),
        });
        output
    }

    pub fn add_output(&mut self, value: impl Into<String>, shape: &[usize]) {
        self.outputs.push(IoSpec {
            name: value.into(),
            shape: shape.iter().map(|&d| d as i64).collect(),
            elem_type: ONNX_FLOAT,
            dim_params: BTreeMap::new(),
        });
    }

    pub fn nodes(&self) -> &[ParsedNode] {
        &self.nodes
    }

    pub fn initializers(&self) -> &[TensorData] {
        &self.initializers
    }

    pub fn inputs(&self) -> &[IoSpec] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[IoSpec] {
        &self.outputs
    }

    pub fn is_initializer(&self, value: &str) -> bool {
        self.initializers.iter().any(|t| t.name == value)
    }

    pub fn is_node_output(&self, value: &str) -> bool {
        self.nodes
            .iter()
            .any(|n| n.outputs.iter().any(|o| o == value))
    }

    fn value_exists(&self, value: &str) -> bool {
        self.is_node_output(value)
            || self.is_initializer(value)
            || self.inputs.iter().any(|io| io.name == value)
    }

    /// Renames a node output everywhere it is referenced.
    pub fn rename_value(&mut self, from: &str, to: &str) -> Result<()> {
        if from == to {
            return Ok(());
        }
        ensure!(
            self.is_node_output(from),
            "cannot rename '{from}': not produced by any node"
        );
        ensure!(
            !self.value_exists(to),
            "cannot rename '{from}' to '{to}': name already in use"
        );

        for node in &mut self.nodes {
            for name in node.inputs.iter_mut().chain(node.outputs.iter_mut()) {
                if *name == from {
                    *name = to.to_string();
                }
            }
        }
        for io in &mut self.outputs {
            if io.name == from {
                io.name = to.to_string();
            }
        }
        Ok(())
    }

    /// Marks `axis` of a graph input or output as symbolic.
    pub fn set_dim_param(&mut self, value: &str, axis: usize, param: &str) -> Result<()> {
        let Some(io) = self
            .inputs
            .iter_mut()
            .chain(self.outputs.iter_mut())
            .find(|io| io.name == value)
        else {
            bail!("dynamic axis refers to unknown graph input/output '{value}'");
        };
        ensure!(
            axis < io.shape.len(),
            "dynamic axis {axis} out of range for '{value}' of rank {}",
            io.shape.len()
        );
        io.shape[axis] = -1;
        io.dim_params.insert(axis, param.to_string());
        Ok(())
    }

    /// Folds constant subgraphs and drops initializers nothing consumes.
    pub fn fold_constants(&mut self) -> Result<usize> {
        let protected: HashSet<String> = self.outputs.iter().map(|io| io.name.clone()).collect();
        let folded = fold::fold_constants(&mut self.nodes, &mut self.initializers, &protected)?;
        self.prune_initializers();
        Ok(folded)
    }

    fn prune_initializers(&mut self) {
        let used: HashSet<&str> = self
            .nodes
            .iter()
            .flat_map(|n| n.inputs.iter())
            .chain(self.outputs.iter().map(|io| &io.name))
            .map(String::as_str)
            .collect();
        let before = self.initializers.len();
        let kept: Vec<TensorData> = self
            .initializers
            .iter()
            .filter(|t| used.contains(t.name.as_str()))
            .cloned()
            .collect();
        self.initializers = kept;
        if before != self.initializers.len() {
            tracing::debug!(
                removed = before - self.initializers.len(),
                "pruned unused initializers"
            );
        }
    }

    /// Turns every initializer into a graph input so the file carries the
    /// structure without trained parameters.
    pub fn externalize_params(&mut self) {
        for tensor in self.initializers.drain(..) {
            self.inputs.push(IoSpec {
                name: tensor.name.clone(),
                shape: tensor.dims.clone(),
                elem_type: if tensor.is_float() { ONNX_FLOAT } else { ONNX_INT64 },
                dim_params: BTreeMap::new(),
            });
        }
    }

    pub fn to_model_proto(&self, meta: &ModelMeta) -> ModelProto {
        let graph = GraphProto {
            node: self.nodes.iter().map(node_to_proto).collect(),
            name: Some(self.name.clone()),
            initializer: self.initializers.iter().map(TensorData::to_proto).collect(),
            input: self.inputs.iter().map(value_info).collect(),
            output: self.outputs.iter().map(value_info).collect(),
            ..Default::default()
        };

        ModelProto {
            ir_version: Some(ir_version_for_opset(meta.opset_version)),
            opset_import: vec![OperatorSetIdProto {
                domain: None,
                version: Some(meta.opset_version),
            }],
            producer_name: Some(meta.producer_name.clone()),
            producer_version: Some(meta.producer_version.clone()),
            graph: Some(graph),
            ..Default::default()
        }
    }

    pub fn encode(&self, meta: &ModelMeta) -> Vec<u8> {
        self.to_model_proto(meta).encode_to_vec()
    }

    /// Encodes and writes the model, overwriting `path`. Returns the byte count.
    pub fn write(&self, path: &Path, meta: &ModelMeta) -> std::io::Result<usize> {
        let bytes = self.encode(meta);
        std::fs::write(path, &bytes)?;
        Ok(bytes.len())
    }
}

fn node_to_proto(node: &ParsedNode) -> NodeProto {
    NodeProto {
        input: node.inputs.clone(),
        output: node.outputs.clone(),
        name: Some(node.name.clone()),
        op_type: Some(node.op_type.clone()),
        domain: (!node.domain.is_empty()).then(|| node.domain.clone()),
        attribute: node
            .attributes
            .iter()
            .map(|(name, value)| attribute_to_proto(name, value))
            .collect(),
        ..Default::default()
    }
}

fn attribute_to_proto(name: &str, value: &AttrValue) -> AttributeProto {
    let mut attr = AttributeProto {
        name: Some(name.to_string()),
        ..Default::default()
    };
    let kind = match value {
        AttrValue::Float(f) => {
            attr.f = Some(*f);
            AttributeType::Float
        }
        AttrValue::Int(i) => {
            attr.i = Some(*i);
            AttributeType::Int
        }
        AttrValue::String(s) => {
            attr.s = Some(s.as_bytes().to_vec());
            AttributeType::String
        }
        AttrValue::Floats(v) => {
            attr.floats = v.clone();
            AttributeType::Floats
        }
        AttrValue::Ints(v) => {
            attr.ints = v.clone();
            AttributeType::Ints
        }
        AttrValue::Tensor(t) => {
            attr.t = Some(t.to_proto());
            AttributeType::Tensor
        }
    };
    attr.r#type = Some(kind as i32);
    attr
}

fn value_info(io: &IoSpec) -> ValueInfoProto {
    let dim = io
        .shape
        .iter()
        .enumerate()
        .map(|(axis, &d)| {
            let value = match io.dim_params.get(&axis) {
                Some(param) => tensor_shape_proto::dimension::Value::DimParam(param.clone()),
                None => tensor_shape_proto::dimension::Value::DimValue(d),
            };
            tensor_shape_proto::Dimension {
                value: Some(value),
                denotation: None,
            }
        })
        .collect();

    ValueInfoProto {
        name: Some(io.name.clone()),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: Some(io.elem_type),
                shape: Some(TensorShapeProto { dim }),
            })),
            denotation: None,
        }),
        doc_string: None,
    }
}
