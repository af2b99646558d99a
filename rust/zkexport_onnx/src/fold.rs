use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};

use super::graph::OpType;
use super::ops::{apply_shape_op, broadcast_binary};
use super::parser::{AttrValue, ParsedNode, TensorData};

/// Evaluates every node whose inputs are all constants and replaces it with
/// an initializer holding its value, until no such node remains. Values named
/// in `protected` (graph outputs) are never folded away.
///
/// Returns the number of nodes removed.
pub(crate) fn fold_constants(
    nodes: &mut Vec<ParsedNode>,
    initializers: &mut Vec<TensorData>,
    protected: &HashSet<String>,
) -> Result<usize> {
    let mut folded = 0;
    let mut skipped: HashSet<String> = HashSet::new();

    loop {
        let known: HashMap<&str, usize> = initializers
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();

        let candidate = nodes.iter().position(|node| {
            !skipped.contains(&node.name)
                && node.outputs.len() == 1
                && !protected.contains(&node.outputs[0])
                && OpType::from_str(&node.op_type).is_ok_and(|op| op.is_foldable())
                && node.inputs.iter().all(|i| known.contains_key(i.as_str()))
        });
        let Some(idx) = candidate else {
            break;
        };

        let inputs: Vec<&TensorData> = nodes[idx]
            .inputs
            .iter()
            .map(|name| &initializers[known[name.as_str()]])
            .collect();

        match evaluate(&nodes[idx], &inputs)
            .with_context(|| format!("folding node {}", nodes[idx].name))?
        {
            Some(mut value) => {
                let node = nodes.remove(idx);
                tracing::debug!(node = %node.name, op = %node.op_type, "folded constant node");
                value.name = node.outputs[0].clone();
                initializers.push(value);
                folded += 1;
            }
            None => {
                skipped.insert(nodes[idx].name.clone());
            }
        }
    }

    Ok(folded)
}

fn evaluate(node: &ParsedNode, inputs: &[&TensorData]) -> Result<Option<TensorData>> {
    let op = OpType::from_str(&node.op_type)?;

    if op == OpType::Constant {
        return Ok(match node.attributes.get("value") {
            Some(AttrValue::Tensor(t)) => Some(t.clone()),
            _ => None,
        });
    }

    let Some(first) = inputs.first() else {
        return Ok(None);
    };

    if op.is_shape_only() {
        let shape_arg = inputs.get(1).map(|t| t.as_i64_vec());
        let value = if first.is_float() {
            let out = apply_shape_op(op, &node.attributes, first.to_f64_array()?, shape_arg.as_deref())?;
            TensorData::from_f64_array("", &out)
        } else {
            let out = apply_shape_op(op, &node.attributes, first.to_i64_array()?, shape_arg.as_deref())?;
            TensorData::from_i64_array("", &out)
        };
        return Ok(Some(value));
    }

    if op == OpType::Neg {
        let value = if first.is_float() {
            TensorData::from_f64_array("", &first.to_f64_array()?.mapv(|v| -v))
        } else {
            TensorData::from_i64_array("", &first.to_i64_array()?.mapv(|v| -v))
        };
        return Ok(Some(value));
    }

    let [a, b] = inputs else {
        return Ok(None);
    };
    if !a.is_float() || !b.is_float() {
        return Ok(None);
    }
    let (a, b) = (a.to_f64_array()?, b.to_f64_array()?);
    let out = match op {
        OpType::Add => broadcast_binary(&a, &b, |x, y| x + y)?,
        OpType::Sub => broadcast_binary(&a, &b, |x, y| x - y)?,
        OpType::Mul => broadcast_binary(&a, &b, |x, y| x * y)?,
        OpType::Div => broadcast_binary(&a, &b, |x, y| x / y)?,
        _ => return Ok(None),
    };
    Ok(Some(TensorData::from_f64_array("", &out)))
}
