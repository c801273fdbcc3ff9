//! Per-operator entry points.

use bfmix_core::{Tensor, TensorCompatError, TensorIndex};
use bfmix_kernel_cpu::{
    self as kernel, BatchNormParams, BinaryOp, Conv2dParams, ConvTranspose2dParams, PoolKind,
    PoolParams,
};
use bfmix_reorder::on_slice;
use bfmix_runtime::current;

use crate::{DispatchError, DispatchOutcome, OpKind, Prepared, Saved, prepare};

fn with_bias<'a>(weight: &'a Tensor, bias: Option<&'a Tensor>) -> Vec<&'a Tensor> {
    std::iter::once(weight).chain(bias).collect()
}

fn finish(prepared: Prepared, values: &[f32], shape: Vec<usize>) -> Result<DispatchOutcome, DispatchError> {
    let tensor = prepared.emit(values, shape)?;
    Ok(prepared.outcome(tensor, &[], Saved::None))
}

pub fn conv2d(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    params: &Conv2dParams,
) -> Result<DispatchOutcome, DispatchError> {
    let prepared = prepare(OpKind::Conv2d, input, &with_bias(weight, bias), &[], false)?;
    let weight = prepared.other(0)?;
    let bias = prepared.others.get(1).map(Tensor::gather_f32);
    let (values, shape) = kernel::conv2d(
        &prepared.primary.gather_f32(),
        prepared.primary.shape(),
        &weight.gather_f32(),
        weight.shape(),
        bias.as_deref(),
        params,
    )?;
    finish(prepared, &values, shape)
}

pub fn conv_transpose2d(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    params: &ConvTranspose2dParams,
) -> Result<DispatchOutcome, DispatchError> {
    let prepared = prepare(
        OpKind::ConvTranspose2d,
        input,
        &with_bias(weight, bias),
        &[],
        false,
    )?;
    let weight = prepared.other(0)?;
    let bias = prepared.others.get(1).map(Tensor::gather_f32);
    let (values, shape) = kernel::conv_transpose2d(
        &prepared.primary.gather_f32(),
        prepared.primary.shape(),
        &weight.gather_f32(),
        weight.shape(),
        bias.as_deref(),
        params,
    )?;
    finish(prepared, &values, shape)
}

pub fn linear(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
) -> Result<DispatchOutcome, DispatchError> {
    let prepared = prepare(OpKind::Linear, input, &with_bias(weight, bias), &[], false)?;
    let weight = prepared.other(0)?;
    let bias = prepared.others.get(1).map(Tensor::gather_f32);
    let (values, shape) = kernel::linear(
        &prepared.primary.gather_f32(),
        prepared.primary.shape(),
        &weight.gather_f32(),
        weight.shape(),
        bias.as_deref(),
    )?;
    finish(prepared, &values, shape)
}

pub fn mm(lhs: &Tensor, rhs: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    let prepared = prepare(OpKind::Mm, lhs, &[rhs], &[], false)?;
    let rhs = prepared.other(0)?;
    let (values, shape) = kernel::mm(
        &prepared.primary.gather_f32(),
        prepared.primary.shape(),
        &rhs.gather_f32(),
        rhs.shape(),
    )?;
    finish(prepared, &values, shape)
}

pub fn bmm(lhs: &Tensor, rhs: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    let prepared = prepare(OpKind::Bmm, lhs, &[rhs], &[], false)?;
    let rhs = prepared.other(0)?;
    let (values, shape) = kernel::bmm(
        &prepared.primary.gather_f32(),
        prepared.primary.shape(),
        &rhs.gather_f32(),
        rhs.shape(),
    )?;
    finish(prepared, &values, shape)
}

type ScaledProduct = fn(
    &[f32],
    &[usize],
    &[f32],
    &[usize],
    &[f32],
    &[usize],
    f32,
    f32,
) -> Result<(Vec<f32>, Vec<usize>), kernel::KernelError>;

fn scaled_product(
    op: OpKind,
    compute: ScaledProduct,
    input: &Tensor,
    lhs: &Tensor,
    rhs: &Tensor,
    beta: f32,
    alpha: f32,
) -> Result<DispatchOutcome, DispatchError> {
    let prepared = prepare(op, input, &[lhs, rhs], &[], false)?;
    let (lhs, rhs) = (prepared.other(0)?, prepared.other(1)?);
    let (values, shape) = compute(
        &prepared.primary.gather_f32(),
        prepared.primary.shape(),
        &lhs.gather_f32(),
        lhs.shape(),
        &rhs.gather_f32(),
        rhs.shape(),
        beta,
        alpha,
    )?;
    finish(prepared, &values, shape)
}

/// `beta * input + alpha * (mat1 @ mat2)`.
pub fn addmm(
    input: &Tensor,
    mat1: &Tensor,
    mat2: &Tensor,
    beta: f32,
    alpha: f32,
) -> Result<DispatchOutcome, DispatchError> {
    scaled_product(OpKind::Addmm, kernel::addmm, input, mat1, mat2, beta, alpha)
}

/// `beta * input + alpha * sum_b(batch1[b] @ batch2[b])`.
pub fn addbmm(
    input: &Tensor,
    batch1: &Tensor,
    batch2: &Tensor,
    beta: f32,
    alpha: f32,
) -> Result<DispatchOutcome, DispatchError> {
    scaled_product(OpKind::Addbmm, kernel::addbmm, input, batch1, batch2, beta, alpha)
}

pub fn baddbmm(
    input: &Tensor,
    batch1: &Tensor,
    batch2: &Tensor,
    beta: f32,
    alpha: f32,
) -> Result<DispatchOutcome, DispatchError> {
    scaled_product(OpKind::Baddbmm, kernel::baddbmm, input, batch1, batch2, beta, alpha)
}

/// Writes `result` into `out`, whose storage adopts the result's
/// representation.
fn adopt(op: &'static str, out: &Tensor, result: &Tensor) -> Result<(), DispatchError> {
    if out.shape() != result.shape() {
        return Err(TensorCompatError::ShapeMismatch {
            lhs: out.shape().to_vec(),
            rhs: result.shape().to_vec(),
        }
        .into());
    }
    if out.dtype() != result.dtype() {
        return Err(TensorCompatError::DTypeMismatch {
            lhs: out.dtype(),
            rhs: result.dtype(),
        }
        .into());
    }
    let owns_storage = out.is_contiguous()
        && out.storage_offset() == 0
        && out.read_storage().len() == out.numel();
    if !owns_storage {
        return Err(DispatchError::InvalidArgument {
            op,
            detail: "out= needs a contiguous tensor spanning its whole storage".to_string(),
        });
    }
    let buffer = result.read_storage().buffer().clone();
    out.write_storage().replace_buffer(buffer)?;
    Ok(())
}

pub fn mm_out(out: &Tensor, lhs: &Tensor, rhs: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    let mut outcome = mm(lhs, rhs)?;
    adopt("mm_out", out, &outcome.tensor)?;
    outcome.tensor = out.clone();
    Ok(outcome)
}

pub fn bmm_out(out: &Tensor, lhs: &Tensor, rhs: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    let mut outcome = bmm(lhs, rhs)?;
    adopt("bmm_out", out, &outcome.tensor)?;
    outcome.tensor = out.clone();
    Ok(outcome)
}

/// Batch normalization over dim 1. Affine parameters and running
/// statistics are read in their current representation and never
/// reordered. Running statistics are updated in place when training.
pub fn batch_norm(
    input: &Tensor,
    weight: Option<&Tensor>,
    bias: Option<&Tensor>,
    running_mean: Option<&Tensor>,
    running_var: Option<&Tensor>,
    params: &BatchNormParams,
) -> Result<DispatchOutcome, DispatchError> {
    let stats: Vec<&Tensor> = [weight, bias, running_mean, running_var]
        .into_iter()
        .flatten()
        .collect();
    let prepared = prepare(OpKind::BatchNorm, input, &[], &stats, false)?;
    let weight_values = weight.map(Tensor::gather_f32);
    let bias_values = bias.map(Tensor::gather_f32);
    let mut mean_values = running_mean.map(Tensor::gather_f32);
    let mut var_values = running_var.map(Tensor::gather_f32);
    let out = kernel::batch_norm(
        &prepared.primary.gather_f32(),
        prepared.primary.shape(),
        weight_values.as_deref(),
        bias_values.as_deref(),
        mean_values.as_deref_mut(),
        var_values.as_deref_mut(),
        params,
    )?;
    if params.training {
        for (tensor, values) in [(running_mean, &mean_values), (running_var, &var_values)] {
            if let (Some(tensor), Some(values)) = (tensor, values) {
                tensor.write_logical(values)?;
            }
        }
    }
    let tensor = prepared.emit(&out.output, prepared.primary.shape().to_vec())?;
    Ok(prepared.outcome(
        tensor,
        &stats,
        Saved::BatchNorm {
            save_mean: out.save_mean,
            save_invstd: out.save_invstd,
        },
    ))
}

fn pool(kind: PoolKind, input: &Tensor, params: &PoolParams) -> Result<DispatchOutcome, DispatchError> {
    let op = match (kind, params.spatial_rank()) {
        (PoolKind::Avg, 2) => OpKind::AvgPool2d,
        (PoolKind::Avg, 3) => OpKind::AvgPool3d,
        (PoolKind::Max, 2) => OpKind::MaxPool2d,
        (PoolKind::Max, 3) => OpKind::MaxPool3d,
        (_, rank) => {
            return Err(DispatchError::InvalidArgument {
                op: "pool",
                detail: format!("unsupported spatial rank {rank}"),
            });
        }
    };
    let prepared = prepare(op, input, &[], &[], false)?;
    let out = kernel::pool_nd(kind, &prepared.primary.gather_f32(), prepared.primary.shape(), params)?;
    let tensor = prepared.emit(&out.values, out.shape)?;
    let saved = match kind {
        PoolKind::Max => Saved::Argmax(out.argmax),
        PoolKind::Avg => Saved::None,
    };
    Ok(prepared.outcome(tensor, &[], saved))
}

/// Average pooling; the window rank (2 or 3) comes from `params`.
pub fn avg_pool(input: &Tensor, params: &PoolParams) -> Result<DispatchOutcome, DispatchError> {
    pool(PoolKind::Avg, input, params)
}

pub fn max_pool(input: &Tensor, params: &PoolParams) -> Result<DispatchOutcome, DispatchError> {
    pool(PoolKind::Max, input, params)
}

pub fn adaptive_avg_pool2d(
    input: &Tensor,
    output_size: [usize; 2],
) -> Result<DispatchOutcome, DispatchError> {
    let prepared = prepare(OpKind::AdaptiveAvgPool2d, input, &[], &[], false)?;
    let (values, shape) = kernel::adaptive_avg_pool2d(
        &prepared.primary.gather_f32(),
        prepared.primary.shape(),
        output_size,
    )?;
    finish(prepared, &values, shape)
}

fn unary(
    op: OpKind,
    input: &Tensor,
    compute: fn(&[f32]) -> Vec<f32>,
    in_place: bool,
) -> Result<DispatchOutcome, DispatchError> {
    let prepared = prepare(op, input, &[], &[], in_place)?;
    let values = compute(&prepared.primary.gather_f32());
    let tensor = if in_place {
        prepared.write_primary(&values)?
    } else {
        prepared.emit(&values, prepared.primary.shape().to_vec())?
    };
    Ok(prepared.outcome(tensor, &[], Saved::None))
}

pub fn relu(input: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    unary(OpKind::Relu, input, kernel::relu, false)
}

pub fn relu_(input: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    unary(OpKind::Relu, input, kernel::relu, true)
}

pub fn gelu(input: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    unary(OpKind::Gelu, input, kernel::gelu, false)
}

pub fn sigmoid(input: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    unary(OpKind::Sigmoid, input, kernel::sigmoid, false)
}

pub fn sigmoid_(input: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    unary(OpKind::Sigmoid, input, kernel::sigmoid, true)
}

pub fn softmax(input: &Tensor, dim: usize) -> Result<DispatchOutcome, DispatchError> {
    let prepared = prepare(OpKind::Softmax, input, &[], &[], false)?;
    let values = kernel::softmax(&prepared.primary.gather_f32(), prepared.primary.shape(), dim)?;
    let shape = prepared.primary.shape().to_vec();
    finish(prepared, &values, shape)
}

pub fn index_select(
    input: &Tensor,
    dim: usize,
    indices: &[usize],
) -> Result<DispatchOutcome, DispatchError> {
    let prepared = prepare(OpKind::IndexSelect, input, &[], &[], false)?;
    let (values, shape) = kernel::index_select(
        &prepared.primary.gather_f32(),
        prepared.primary.shape(),
        dim,
        indices,
    )?;
    finish(prepared, &values, shape)
}

fn binary(
    op: OpKind,
    kernel_op: BinaryOp,
    lhs: &Tensor,
    rhs: &Tensor,
    in_place: bool,
) -> Result<DispatchOutcome, DispatchError> {
    let prepared = prepare(op, lhs, &[rhs], &[], in_place)?;
    let rhs = prepared.other(0)?;
    let (values, shape) = kernel::binary(
        kernel_op,
        &prepared.primary.gather_f32(),
        prepared.primary.shape(),
        &rhs.gather_f32(),
        rhs.shape(),
    )?;
    if !in_place {
        return finish(prepared, &values, shape);
    }
    if shape != prepared.primary.shape() {
        return Err(TensorCompatError::ShapeMismatch {
            lhs: prepared.primary.shape().to_vec(),
            rhs: shape,
        }
        .into());
    }
    let tensor = prepared.write_primary(&values)?;
    Ok(prepared.outcome(tensor, &[], Saved::None))
}

pub fn add(lhs: &Tensor, rhs: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    binary(OpKind::Add, BinaryOp::Add, lhs, rhs, false)
}

pub fn add_(lhs: &Tensor, rhs: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    binary(OpKind::Add, BinaryOp::Add, lhs, rhs, true)
}

pub fn mul(lhs: &Tensor, rhs: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    binary(OpKind::Mul, BinaryOp::Mul, lhs, rhs, false)
}

pub fn mul_(lhs: &Tensor, rhs: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    binary(OpKind::Mul, BinaryOp::Mul, lhs, rhs, true)
}

pub fn sub(lhs: &Tensor, rhs: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    binary(OpKind::Sub, BinaryOp::Sub, lhs, rhs, false)
}

pub fn div(lhs: &Tensor, rhs: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    binary(OpKind::Div, BinaryOp::Div, lhs, rhs, false)
}

/// Sum of every element as a rank-0 tensor.
pub fn sum(input: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    let prepared = prepare(OpKind::Sum, input, &[], &[], false)?;
    let total = kernel::sum(&prepared.primary.gather_f32());
    finish(prepared, &[total], Vec::new())
}

/// Contiguous copy that keeps the source representation.
pub fn clone(input: &Tensor) -> Result<DispatchOutcome, DispatchError> {
    let prepared = prepare(OpKind::Clone, input, &[], &[], false)?;
    let values = prepared.primary.gather_f32();
    let shape = prepared.primary.shape().to_vec();
    finish(prepared, &values, shape)
}

pub fn cat(tensors: &[&Tensor], dim: usize) -> Result<DispatchOutcome, DispatchError> {
    let Some((first, rest)) = tensors.split_first() else {
        return Err(DispatchError::InvalidArgument {
            op: "cat",
            detail: "expected a non-empty list of tensors".to_string(),
        });
    };
    let prepared = prepare(OpKind::Cat, first, rest, &[], false)?;
    let values: Vec<Vec<f32>> = std::iter::once(&prepared.primary)
        .chain(&prepared.others)
        .map(Tensor::gather_f32)
        .collect();
    let parts: Vec<(&[f32], &[usize])> = values
        .iter()
        .zip(std::iter::once(&prepared.primary).chain(&prepared.others))
        .map(|(values, tensor)| (values.as_slice(), tensor.shape()))
        .collect();
    let (joined, shape) = kernel::cat(&parts, dim)?;
    finish(prepared, &joined, shape)
}

/// Indexing view. A full-precision accelerator tensor is reordered to the
/// bf16 plan first when auto-mix is active, so the view and its parent agree.
pub fn slice(tensor: &Tensor, indices: &[TensorIndex]) -> Result<Tensor, DispatchError> {
    let _ = on_slice(tensor, current());
    Ok(tensor.index_view(indices)?)
}

pub fn narrow(tensor: &Tensor, dim: usize, start: usize, len: usize) -> Result<Tensor, DispatchError> {
    let _ = on_slice(tensor, current());
    Ok(tensor.narrow_view(dim, start, len)?)
}

pub fn select(tensor: &Tensor, dim: usize, index: usize) -> Result<Tensor, DispatchError> {
    let _ = on_slice(tensor, current());
    Ok(tensor.select_view(dim, index)?)
}
