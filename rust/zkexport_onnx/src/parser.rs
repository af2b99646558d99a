use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use ndarray::{ArrayD, IxDyn};
use prost::Message;

use super::proto::attribute_proto::AttributeType;
use super::proto::tensor_proto::DataType;
use super::proto::{
    tensor_shape_proto, type_proto, AttributeProto, GraphProto, ModelProto, NodeProto,
    TensorProto, ValueInfoProto,
};

pub const ONNX_FLOAT: i32 = DataType::Float as i32;
pub const ONNX_INT64: i32 = DataType::Int64 as i32;

pub struct ParsedModel {
    pub nodes: Vec<ParsedNode>,
    pub initializers: HashMap<String, TensorData>,
    pub inputs: Vec<IoSpec>,
    pub outputs: Vec<IoSpec>,
    pub opset_version: i64,
    pub ir_version: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedNode {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: BTreeMap<String, AttrValue>,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum AttrValue {
    Float(f32),
    Int(i64),
    String(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    Tensor(TensorData),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TensorData {
    pub name: String,
    pub dims: Vec<i64>,
    pub data_type: i32,
    pub float_data: Vec<f64>,
    pub int_data: Vec<i64>,
}

/// A graph input or output. Dynamic axes carry `-1` in `shape` and their
/// symbolic name in `dim_params`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IoSpec {
    pub name: String,
    pub shape: Vec<i64>,
    pub elem_type: i32,
    #[serde(default)]
    pub dim_params: BTreeMap<usize, String>,
}

pub fn parse_onnx(path: &Path) -> Result<ParsedModel> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading ONNX file {}", path.display()))?;
    parse_onnx_bytes(&bytes)
}

pub fn parse_onnx_bytes(bytes: &[u8]) -> Result<ParsedModel> {
    let model = ModelProto::decode(bytes).context("decoding ONNX protobuf")?;

    let opset_version = model
        .opset_import
        .iter()
        .filter(|o| o.domain.as_deref().unwrap_or("").is_empty())
        .map(|o| o.version.unwrap_or(0))
        .max()
        .unwrap_or(0);
    let ir_version = model.ir_version.unwrap_or(0);

    let graph = model.graph.context("model has no graph")?;

    let initializers = parse_initializers(&graph)?;
    let nodes = graph
        .node
        .iter()
        .enumerate()
        .map(|(idx, node)| parse_node(idx, node))
        .collect::<Result<Vec<_>>>()?;
    let inputs = parse_value_infos(&graph.input);
    let outputs = parse_value_infos(&graph.output);

    Ok(ParsedModel {
        nodes,
        initializers,
        inputs,
        outputs,
        opset_version,
        ir_version,
    })
}

fn parse_initializers(graph: &GraphProto) -> Result<HashMap<String, TensorData>> {
    graph
        .initializer
        .iter()
        .map(|init| extract_tensor_data(init).map(|td| (td.name.clone(), td)))
        .collect()
}

fn le_chunks<const N: usize>(raw: &[u8]) -> impl Iterator<Item = [u8; N]> + '_ {
    raw.chunks_exact(N).map(|chunk| {
        let mut buf = [0u8; N];
        buf.copy_from_slice(chunk);
        buf
    })
}

/// Decodes a tensor's payload. `raw_data` wins over the typed fields when
/// present, as ONNX requires.
fn extract_tensor_data(tensor: &TensorProto) -> Result<TensorData> {
    let data_type = tensor.data_type.unwrap_or(0);
    let mut out = TensorData {
        name: tensor.name.clone().unwrap_or_default(),
        dims: tensor.dims.clone(),
        data_type,
        float_data: vec![],
        int_data: vec![],
    };

    let Some(raw) = tensor.raw_data.as_deref() else {
        out.float_data = tensor
            .float_data
            .iter()
            .map(|&f| f64::from(f))
            .chain(tensor.double_data.iter().copied())
            .collect();
        out.int_data = tensor
            .int32_data
            .iter()
            .map(|&i| i64::from(i))
            .chain(tensor.int64_data.iter().copied())
            .collect();
        return Ok(out);
    };

    match DataType::try_from(data_type).unwrap_or(DataType::Undefined) {
        DataType::Float => {
            out.float_data = le_chunks::<4>(raw)
                .map(|b| f64::from(f32::from_le_bytes(b)))
                .collect();
        }
        DataType::Double => out.float_data = le_chunks::<8>(raw).map(f64::from_le_bytes).collect(),
        DataType::Int32 => {
            out.int_data = le_chunks::<4>(raw)
                .map(|b| i64::from(i32::from_le_bytes(b)))
                .collect();
        }
        DataType::Int64 => out.int_data = le_chunks::<8>(raw).map(i64::from_le_bytes).collect(),
        other => bail!("tensor '{}': cannot decode raw_data of type {other:?}", out.name),
    }
    Ok(out)
}

fn parse_node(idx: usize, node: &NodeProto) -> Result<ParsedNode> {
    let mut attributes = BTreeMap::new();
    for attr in &node.attribute {
        let Some(attr_name) = attr.name.as_ref() else {
            continue;
        };
        if let Some(value) = parse_attribute(attr)? {
            attributes.insert(attr_name.clone(), value);
        }
    }

    Ok(ParsedNode {
        name: node.name.clone().unwrap_or_else(|| format!("node_{idx}")),
        op_type: node.op_type.clone().unwrap_or_default(),
        inputs: node.input.clone(),
        outputs: node.output.clone(),
        attributes,
        domain: node.domain.clone().unwrap_or_default(),
    })
}

fn parse_attribute(attr: &AttributeProto) -> Result<Option<AttrValue>> {
    let attr_type = attr.r#type.and_then(|t| AttributeType::try_from(t).ok());

    match attr_type {
        Some(AttributeType::Float) => Ok(attr.f.map(AttrValue::Float)),
        Some(AttributeType::Int) => Ok(attr.i.map(AttrValue::Int)),
        Some(AttributeType::String) => Ok(attr
            .s
            .as_ref()
            .map(|s| AttrValue::String(String::from_utf8_lossy(s).to_string()))),
        Some(AttributeType::Floats) => Ok(Some(AttrValue::Floats(attr.floats.clone()))),
        Some(AttributeType::Ints) => Ok(Some(AttrValue::Ints(attr.ints.clone()))),
        Some(AttributeType::Tensor) => match attr.t {
            Some(ref t) => Ok(Some(AttrValue::Tensor(extract_tensor_data(t)?))),
            None => Ok(None),
        },
        _ => Ok(None),
    }
}

fn parse_value_infos(infos: &[ValueInfoProto]) -> Vec<IoSpec> {
    infos
        .iter()
        .map(|vi| {
            let name = vi.name.clone().unwrap_or_default();
            let tensor_type = vi.r#type.as_ref().and_then(|tp| match tp.value {
                Some(type_proto::Value::TensorType(ref tt)) => Some(tt),
                None => None,
            });
            let Some(tt) = tensor_type else {
                return IoSpec {
                    name,
                    shape: vec![],
                    elem_type: 0,
                    dim_params: BTreeMap::new(),
                };
            };

            let mut shape = Vec::new();
            let mut dim_params = BTreeMap::new();
            for (axis, d) in tt.shape.iter().flat_map(|s| s.dim.iter()).enumerate() {
                match d.value {
                    Some(tensor_shape_proto::dimension::Value::DimValue(dv)) => shape.push(dv),
                    Some(tensor_shape_proto::dimension::Value::DimParam(ref p)) => {
                        shape.push(-1);
                        dim_params.insert(axis, p.clone());
                    }
                    None => shape.push(-1),
                }
            }

            IoSpec {
                name,
                shape,
                elem_type: tt.elem_type.unwrap_or(0),
                dim_params,
            }
        })
        .collect()
}

impl TensorData {
    pub fn from_f64(name: impl Into<String>, dims: Vec<i64>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            dims,
            data_type: ONNX_FLOAT,
            float_data: values,
            int_data: vec![],
        }
    }

    pub fn from_i64(name: impl Into<String>, dims: Vec<i64>, values: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            dims,
            data_type: ONNX_INT64,
            float_data: vec![],
            int_data: values,
        }
    }

    pub fn from_f32_array(name: impl Into<String>, array: &ArrayD<f32>) -> Self {
        let dims = array.shape().iter().map(|&d| d as i64).collect();
        let values = array.iter().map(|&v| f64::from(v)).collect();
        Self::from_f64(name, dims, values)
    }

    pub fn from_f64_array(name: impl Into<String>, array: &ArrayD<f64>) -> Self {
        let dims = array.shape().iter().map(|&d| d as i64).collect();
        Self::from_f64(name, dims, array.iter().copied().collect())
    }

    pub fn from_i64_array(name: impl Into<String>, array: &ArrayD<i64>) -> Self {
        let dims = array.shape().iter().map(|&d| d as i64).collect();
        Self::from_i64(name, dims, array.iter().copied().collect())
    }

    pub fn total_elements(&self) -> usize {
        if self.dims.is_empty() {
            return 1;
        }
        self.dims.iter().map(|d| *d as usize).product()
    }

    pub fn is_float(&self) -> bool {
        matches!(
            DataType::try_from(self.data_type),
            Ok(DataType::Float | DataType::Double)
        )
    }

    pub fn as_f64_vec(&self) -> Vec<f64> {
        if !self.float_data.is_empty() {
            self.float_data.clone()
        } else {
            self.int_data.iter().map(|i| *i as f64).collect()
        }
    }

    pub fn as_i64_vec(&self) -> Vec<i64> {
        if !self.int_data.is_empty() {
            self.int_data.clone()
        } else {
            self.float_data.iter().map(|f| *f as i64).collect()
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        self.dims.iter().map(|d| *d as usize).collect()
    }

    pub fn to_f64_array(&self) -> Result<ArrayD<f64>> {
        let values = self.as_f64_vec();
        ensure!(
            values.len() == self.total_elements(),
            "tensor '{}' holds {} values but dims {:?} need {}",
            self.name,
            values.len(),
            self.dims,
            self.total_elements()
        );
        ArrayD::from_shape_vec(IxDyn(&self.shape()), values)
            .with_context(|| format!("shaping tensor '{}'", self.name))
    }

    pub fn to_i64_array(&self) -> Result<ArrayD<i64>> {
        let values = self.as_i64_vec();
        ensure!(
            values.len() == self.total_elements(),
            "tensor '{}' holds {} values but dims {:?} need {}",
            self.name,
            values.len(),
            self.dims,
            self.total_elements()
        );
        ArrayD::from_shape_vec(IxDyn(&self.shape()), values)
            .with_context(|| format!("shaping tensor '{}'", self.name))
    }

    /// Encodes the tensor with little-endian `raw_data`, the layout most
    /// exporters emit for embedded parameters.
    pub fn to_proto(&self) -> TensorProto {
        let raw = if self.is_float() {
            self.as_f64_vec()
                .iter()
                .flat_map(|v| (*v as f32).to_le_bytes())
                .collect()
        } else {
            self.as_i64_vec()
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect()
        };
        let data_type = if self.is_float() {
            ONNX_FLOAT
        } else {
            ONNX_INT64
        };

        TensorProto {
            dims: self.dims.clone(),
            data_type: Some(data_type),
            name: Some(self.name.clone()),
            raw_data: Some(raw),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_proto_roundtrip_keeps_f32_values() {
        let array = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![0.5f32, -1.25, 3.0, 0.1]).unwrap();
        let td = TensorData::from_f32_array("w", &array);
        let proto = td.to_proto();
        assert_eq!(proto.data_type, Some(ONNX_FLOAT));
        assert_eq!(proto.raw_data.as_ref().map(Vec::len), Some(16));

        let back = extract_tensor_data(&proto).unwrap();
        assert_eq!(back.dims, vec![2, 2]);
        assert_eq!(back.float_data, td.float_data);
    }

    #[test]
    fn int64_tensor_roundtrip() {
        let td = TensorData::from_i64("shape", vec![3], vec![0, -1, 4]);
        let back = extract_tensor_data(&td.to_proto()).unwrap();
        assert_eq!(back.int_data, vec![0, -1, 4]);
        assert!(!back.is_float());
    }

    #[test]
    fn to_array_rejects_wrong_length() {
        let td = TensorData::from_f64("bad", vec![2, 3], vec![1.0; 5]);
        let err = td.to_f64_array().unwrap_err();
        assert!(format!("{err:#}").contains("bad"));
    }

    #[test]
    fn scalar_tensor_has_one_element() {
        let td = TensorData::from_f64("s", vec![], vec![2.0]);
        assert_eq!(td.total_elements(), 1);
        assert_eq!(td.to_f64_array().unwrap().ndim(), 0);
    }

    #[test]
    fn garbage_bytes_fail_to_parse() {
        assert!(parse_onnx_bytes(&[0xFF, 0x00, 0x13]).is_err());
    }
}
