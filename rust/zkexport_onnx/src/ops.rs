use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, ensure, Context, Result};
use ndarray::{ArrayD, IxDyn, Zip};

use super::graph::OpType;
use super::parser::AttrValue;

/// Power of `alpha` each constant input of `op` is scaled by, keyed by input
/// position. Positions absent from the plan are left in floating point.
pub fn get_scale_plan(op: OpType) -> HashMap<usize, u32> {
    match op {
        OpType::Gemm => HashMap::from([(1, 1), (2, 2)]),
        OpType::MatMul => HashMap::from([(1, 1)]),
        OpType::Add | OpType::Sub | OpType::Mul => HashMap::from([(0, 1), (1, 1)]),
        _ => HashMap::new(),
    }
}

pub fn int_attr(attrs: &BTreeMap<String, AttrValue>, name: &str) -> Option<i64> {
    match attrs.get(name)? {
        AttrValue::Int(v) => Some(*v),
        _ => None,
    }
}

pub fn ints_attr<'a>(attrs: &'a BTreeMap<String, AttrValue>, name: &str) -> Option<&'a [i64]> {
    match attrs.get(name)? {
        AttrValue::Ints(v) => Some(v),
        _ => None,
    }
}

pub fn float_attr(attrs: &BTreeMap<String, AttrValue>, name: &str) -> Option<f32> {
    match attrs.get(name)? {
        AttrValue::Float(v) => Some(*v),
        _ => None,
    }
}

fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let rank_i = rank as i64;
    let resolved = if axis < 0 { axis + rank_i } else { axis };
    ensure!(
        (0..=rank_i).contains(&resolved),
        "axis {axis} out of range for rank {rank}"
    );
    Ok(resolved as usize)
}

/// Output shape of ONNX `Flatten`: `[prod(dims[..axis]), prod(dims[axis..])]`.
pub fn flatten_shape(dims: &[usize], axis: i64) -> Result<Vec<usize>> {
    let axis = normalize_axis(axis, dims.len())?;
    let outer: usize = dims[..axis].iter().product();
    let inner: usize = dims[axis..].iter().product();
    Ok(vec![outer, inner])
}

/// Resolves an ONNX `Reshape` target: `0` copies the input dim at that
/// position and a single `-1` is inferred from the element count.
pub fn reshape_target(dims: &[usize], target: &[i64]) -> Result<Vec<usize>> {
    let total: usize = dims.iter().product();
    let mut out = Vec::with_capacity(target.len());
    let mut infer_at = None;

    for (i, &t) in target.iter().enumerate() {
        match t {
            0 => {
                let d = dims
                    .get(i)
                    .with_context(|| format!("reshape target {target:?} copies missing dim {i}"))?;
                out.push(*d);
            }
            -1 => {
                ensure!(
                    infer_at.is_none(),
                    "reshape target {target:?} has more than one -1"
                );
                infer_at = Some(i);
                out.push(1);
            }
            t if t < 0 => bail!("reshape target {target:?} has invalid dim {t}"),
            t => out.push(t as usize),
        }
    }

    let known: usize = out.iter().product();
    if let Some(i) = infer_at {
        ensure!(
            known > 0 && total % known == 0,
            "cannot infer reshape dim: {total} elements into {target:?}"
        );
        out[i] = total / known;
    }

    ensure!(
        out.iter().product::<usize>() == total,
        "reshape {dims:?} -> {target:?} changes element count"
    );
    Ok(out)
}

pub fn transpose_perm(rank: usize, perm: Option<&[i64]>) -> Result<Vec<usize>> {
    let Some(perm) = perm else {
        return Ok((0..rank).rev().collect());
    };
    ensure!(
        perm.len() == rank,
        "transpose perm {perm:?} does not match rank {rank}"
    );
    let resolved: Vec<usize> = perm
        .iter()
        .map(|&p| {
            let axis = if p < 0 { p + rank as i64 } else { p };
            ensure!(
                (0..rank as i64).contains(&axis),
                "transpose perm {perm:?} has out-of-range axis {p}"
            );
            Ok(axis as usize)
        })
        .collect::<Result<_>>()?;
    let mut seen = vec![false; rank];
    for &p in &resolved {
        ensure!(!seen[p], "transpose perm {perm:?} repeats axis {p}");
        seen[p] = true;
    }
    Ok(resolved)
}

/// Multidirectional (numpy-style) broadcast of two shapes.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0usize; rank];
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => bail!("shapes {a:?} and {b:?} cannot be broadcast"),
        };
    }
    Ok(out)
}

pub fn broadcast_binary<A, B, C, F>(a: &ArrayD<A>, b: &ArrayD<B>, f: F) -> Result<ArrayD<C>>
where
    F: Fn(&A, &B) -> C,
{
    let shape = broadcast_shape(a.shape(), b.shape())?;
    let av = a
        .broadcast(IxDyn(&shape))
        .with_context(|| format!("broadcasting {:?} to {shape:?}", a.shape()))?;
    let bv = b
        .broadcast(IxDyn(&shape))
        .with_context(|| format!("broadcasting {:?} to {shape:?}", b.shape()))?;
    Ok(Zip::from(&av).and(&bv).map_collect(|x, y| f(x, y)))
}

/// Like [`broadcast_binary`], but `f` may fail; the first error wins.
pub fn try_broadcast_binary<A, B, C, F>(a: &ArrayD<A>, b: &ArrayD<B>, f: F) -> Result<ArrayD<C>>
where
    F: Fn(&A, &B) -> Result<C>,
{
    let shape = broadcast_shape(a.shape(), b.shape())?;
    let av = a
        .broadcast(IxDyn(&shape))
        .with_context(|| format!("broadcasting {:?} to {shape:?}", a.shape()))?;
    let bv = b
        .broadcast(IxDyn(&shape))
        .with_context(|| format!("broadcasting {:?} to {shape:?}", b.shape()))?;
    let values = av
        .iter()
        .zip(bv.iter())
        .map(|(x, y)| f(x, y))
        .collect::<Result<Vec<C>>>()?;
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), values)?)
}

pub fn reshape_array<T: Clone>(array: ArrayD<T>, shape: &[usize]) -> Result<ArrayD<T>> {
    array
        .as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(shape))
        .with_context(|| format!("reshaping to {shape:?}"))
}

/// Applies a data-movement op. `shape_arg` is the target of `Reshape`.
pub fn apply_shape_op<T: Clone>(
    op: OpType,
    attrs: &BTreeMap<String, AttrValue>,
    data: ArrayD<T>,
    shape_arg: Option<&[i64]>,
) -> Result<ArrayD<T>> {
    match op {
        OpType::Identity => Ok(data),
        OpType::Flatten => {
            let axis = int_attr(attrs, "axis").unwrap_or(1);
            let shape = flatten_shape(data.shape(), axis)?;
            reshape_array(data, &shape)
        }
        OpType::Reshape => {
            let target = shape_arg.context("Reshape needs a constant shape input")?;
            let shape = reshape_target(data.shape(), target)?;
            reshape_array(data, &shape)
        }
        OpType::Transpose => {
            let perm = transpose_perm(data.ndim(), ints_attr(attrs, "perm"))?;
            Ok(data.permuted_axes(IxDyn(&perm)).as_standard_layout().into_owned())
        }
        other => bail!("{other:?} is not a shape op"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_shape_defaults_to_two_dims() {
        assert_eq!(flatten_shape(&[1, 9, 2], 1).unwrap(), vec![1, 18]);
        assert_eq!(flatten_shape(&[1, 3, 2, 3], -1).unwrap(), vec![6, 3]);
        assert_eq!(flatten_shape(&[4, 5], 0).unwrap(), vec![1, 20]);
        assert!(flatten_shape(&[4, 5], 3).is_err());
    }

    #[test]
    fn reshape_target_copies_and_infers() {
        assert_eq!(reshape_target(&[1, 3, 4], &[0, -1]).unwrap(), vec![1, 12]);
        assert_eq!(reshape_target(&[2, 6], &[3, 4]).unwrap(), vec![3, 4]);
        assert!(reshape_target(&[2, 6], &[-1, -1]).is_err());
        assert!(reshape_target(&[2, 6], &[5, -1]).is_err());
        assert!(reshape_target(&[2, 6], &[2, 2]).is_err());
    }

    #[test]
    fn broadcast_follows_numpy_rules() {
        assert_eq!(broadcast_shape(&[1, 4], &[4]).unwrap(), vec![1, 4]);
        assert_eq!(broadcast_shape(&[3, 1], &[1, 5]).unwrap(), vec![3, 5]);
        assert_eq!(broadcast_shape(&[], &[2, 2]).unwrap(), vec![2, 2]);
        assert!(broadcast_shape(&[3], &[4]).is_err());
    }

    #[test]
    fn transpose_reverses_by_default() {
        let a = ArrayD::from_shape_vec(IxDyn(&[2, 3]), (0..6).collect::<Vec<i64>>()).unwrap();
        let t = apply_shape_op(OpType::Transpose, &BTreeMap::new(), a, None).unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.iter().copied().collect::<Vec<_>>(), vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn broadcast_binary_adds_row_vector() {
        let a = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1i64, 2, 3, 4]).unwrap();
        let b = ArrayD::from_shape_vec(IxDyn(&[2]), vec![10i64, 20]).unwrap();
        let c = broadcast_binary(&a, &b, |x, y| x + y).unwrap();
        assert_eq!(c.iter().copied().collect::<Vec<_>>(), vec![11, 22, 13, 24]);
    }

    #[test]
    fn try_broadcast_binary_stops_at_first_error() {
        let a = ArrayD::from_shape_vec(IxDyn(&[2]), vec![i64::MAX, 1]).unwrap();
        let b = ArrayD::from_shape_vec(IxDyn(&[]), vec![1i64]).unwrap();
        let err = try_broadcast_binary(&a, &b, |x, y| {
            x.checked_add(*y).context("overflow")
        })
        .unwrap_err();
        assert!(err.to_string().contains("overflow"));

        let ok = try_broadcast_binary(&b, &a, |x, y| Ok(x - y)).unwrap();
        assert_eq!(ok.iter().copied().collect::<Vec<_>>(), vec![1 - i64::MAX, 0]);
    }

    #[test]
    fn gemm_scale_plan_scales_bias_twice() {
        let plan = get_scale_plan(OpType::Gemm);
        assert_eq!(plan.get(&1), Some(&1));
        assert_eq!(plan.get(&2), Some(&2));
        assert!(get_scale_plan(OpType::Div).is_empty());
    }
}
