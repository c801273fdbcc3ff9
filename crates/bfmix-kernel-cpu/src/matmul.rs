use crate::elementwise::{expand_to, reduce_to_shape};
use crate::{KernelError, ensure_len, ensure_rank};

fn inner_dims(
    op: &'static str,
    lhs_shape: &[usize],
    rhs_shape: &[usize],
) -> Result<(usize, usize, usize), KernelError> {
    ensure_rank(op, lhs_shape, 2)?;
    ensure_rank(op, rhs_shape, 2)?;
    if lhs_shape[1] != rhs_shape[0] {
        return Err(KernelError::ShapeMismatch {
            op,
            lhs: lhs_shape.to_vec(),
            rhs: rhs_shape.to_vec(),
        });
    }
    Ok((lhs_shape[0], lhs_shape[1], rhs_shape[1]))
}

fn batch_dims(
    op: &'static str,
    lhs_shape: &[usize],
    rhs_shape: &[usize],
) -> Result<(usize, usize, usize, usize), KernelError> {
    ensure_rank(op, lhs_shape, 3)?;
    ensure_rank(op, rhs_shape, 3)?;
    if lhs_shape[0] != rhs_shape[0] || lhs_shape[2] != rhs_shape[1] {
        return Err(KernelError::ShapeMismatch {
            op,
            lhs: lhs_shape.to_vec(),
            rhs: rhs_shape.to_vec(),
        });
    }
    Ok((lhs_shape[0], lhs_shape[1], lhs_shape[2], rhs_shape[2]))
}

/// `out[m, n] = sum_k a[m, k] * b[k, n]` with an f32 accumulator.
fn gemm(a: &[f32], b: &[f32], m: usize, k: usize, n: usize, out: &mut [f32]) {
    for row in 0..m {
        for col in 0..n {
            let mut acc = 0.0f32;
            for inner in 0..k {
                acc += a[row * k + inner] * b[inner * n + col];
            }
            out[row * n + col] = acc;
        }
    }
}

fn transpose(values: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; values.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = values[r * cols + c];
        }
    }
    out
}

pub fn mm(
    lhs: &[f32],
    lhs_shape: &[usize],
    rhs: &[f32],
    rhs_shape: &[usize],
) -> Result<(Vec<f32>, Vec<usize>), KernelError> {
    let (m, k, n) = inner_dims("mm", lhs_shape, rhs_shape)?;
    ensure_len("mm", lhs, lhs_shape)?;
    ensure_len("mm", rhs, rhs_shape)?;
    let mut out = vec![0.0f32; m * n];
    gemm(lhs, rhs, m, k, n, &mut out);
    Ok((out, vec![m, n]))
}

pub fn mm_backward(
    grad: &[f32],
    lhs: &[f32],
    lhs_shape: &[usize],
    rhs: &[f32],
    rhs_shape: &[usize],
) -> Result<(Vec<f32>, Vec<f32>), KernelError> {
    let (m, k, n) = inner_dims("mm_backward", lhs_shape, rhs_shape)?;
    ensure_len("mm_backward", grad, &[m, n])?;
    let mut grad_lhs = vec![0.0f32; m * k];
    gemm(grad, &transpose(rhs, k, n), m, n, k, &mut grad_lhs);
    let mut grad_rhs = vec![0.0f32; k * n];
    gemm(&transpose(lhs, m, k), grad, k, m, n, &mut grad_rhs);
    Ok((grad_lhs, grad_rhs))
}

pub fn bmm(
    lhs: &[f32],
    lhs_shape: &[usize],
    rhs: &[f32],
    rhs_shape: &[usize],
) -> Result<(Vec<f32>, Vec<usize>), KernelError> {
    let (batch, m, k, n) = batch_dims("bmm", lhs_shape, rhs_shape)?;
    ensure_len("bmm", lhs, lhs_shape)?;
    ensure_len("bmm", rhs, rhs_shape)?;
    let mut out = vec![0.0f32; batch * m * n];
    for b in 0..batch {
        gemm(
            &lhs[b * m * k..(b + 1) * m * k],
            &rhs[b * k * n..(b + 1) * k * n],
            m,
            k,
            n,
            &mut out[b * m * n..(b + 1) * m * n],
        );
    }
    Ok((out, vec![batch, m, n]))
}

pub fn bmm_backward(
    grad: &[f32],
    lhs: &[f32],
    lhs_shape: &[usize],
    rhs: &[f32],
    rhs_shape: &[usize],
) -> Result<(Vec<f32>, Vec<f32>), KernelError> {
    let (batch, m, k, n) = batch_dims("bmm_backward", lhs_shape, rhs_shape)?;
    ensure_len("bmm_backward", grad, &[batch, m, n])?;
    let mut grad_lhs = vec![0.0f32; batch * m * k];
    let mut grad_rhs = vec![0.0f32; batch * k * n];
    for b in 0..batch {
        let g = &grad[b * m * n..(b + 1) * m * n];
        let a = &lhs[b * m * k..(b + 1) * m * k];
        let w = &rhs[b * k * n..(b + 1) * k * n];
        gemm(
            g,
            &transpose(w, k, n),
            m,
            n,
            k,
            &mut grad_lhs[b * m * k..(b + 1) * m * k],
        );
        gemm(
            &transpose(a, m, k),
            g,
            k,
            m,
            n,
            &mut grad_rhs[b * k * n..(b + 1) * k * n],
        );
    }
    Ok((grad_lhs, grad_rhs))
}

fn scaled_sum(
    input: &[f32],
    input_shape: &[usize],
    product: &[f32],
    out_shape: &[usize],
    beta: f32,
    alpha: f32,
) -> Result<Vec<f32>, KernelError> {
    let base = expand_to(input, input_shape, out_shape)?;
    Ok(base
        .iter()
        .zip(product)
        .map(|(i, p)| {
            // beta == 0 ignores the input entirely, including NaN.
            let scaled_input = if beta == 0.0 { 0.0 } else { beta * i };
            scaled_input + alpha * p
        })
        .collect())
}

/// `beta * input + alpha * (lhs @ rhs)`; `input` broadcasts to `[m, n]`.
pub fn addmm(
    input: &[f32],
    input_shape: &[usize],
    lhs: &[f32],
    lhs_shape: &[usize],
    rhs: &[f32],
    rhs_shape: &[usize],
    beta: f32,
    alpha: f32,
) -> Result<(Vec<f32>, Vec<usize>), KernelError> {
    let (product, shape) = mm(lhs, lhs_shape, rhs, rhs_shape)?;
    let out = scaled_sum(input, input_shape, &product, &shape, beta, alpha)?;
    Ok((out, shape))
}

/// `beta * input + alpha * sum_b batch1[b] @ batch2[b]`.
pub fn addbmm(
    input: &[f32],
    input_shape: &[usize],
    batch1: &[f32],
    batch1_shape: &[usize],
    batch2: &[f32],
    batch2_shape: &[usize],
    beta: f32,
    alpha: f32,
) -> Result<(Vec<f32>, Vec<usize>), KernelError> {
    let (batch, m, _, n) = batch_dims("addbmm", batch1_shape, batch2_shape)?;
    let (products, _) = bmm(batch1, batch1_shape, batch2, batch2_shape)?;
    let mut reduced = vec![0.0f32; m * n];
    for b in 0..batch {
        for (slot, value) in reduced.iter_mut().zip(&products[b * m * n..(b + 1) * m * n]) {
            *slot += value;
        }
    }
    let shape = vec![m, n];
    let out = scaled_sum(input, input_shape, &reduced, &shape, beta, alpha)?;
    Ok((out, shape))
}

/// `beta * input + alpha * bmm(batch1, batch2)`.
pub fn baddbmm(
    input: &[f32],
    input_shape: &[usize],
    batch1: &[f32],
    batch1_shape: &[usize],
    batch2: &[f32],
    batch2_shape: &[usize],
    beta: f32,
    alpha: f32,
) -> Result<(Vec<f32>, Vec<usize>), KernelError> {
    let (product, shape) = bmm(batch1, batch1_shape, batch2, batch2_shape)?;
    let out = scaled_sum(input, input_shape, &product, &shape, beta, alpha)?;
    Ok((out, shape))
}

/// Gradient of the `beta * input` term of the add-matmul family.
pub fn scaled_input_backward(
    grad: &[f32],
    grad_shape: &[usize],
    input_shape: &[usize],
    beta: f32,
) -> Result<Vec<f32>, KernelError> {
    let reduced = reduce_to_shape(grad, grad_shape, input_shape)?;
    Ok(reduced.into_iter().map(|g| g * beta).collect())
}

fn linear_dims(
    input_shape: &[usize],
    weight_shape: &[usize],
) -> Result<(usize, usize, usize), KernelError> {
    ensure_rank("linear", weight_shape, 2)?;
    let Some(&in_features) = input_shape.last() else {
        return Err(KernelError::RankMismatch {
            op: "linear",
            expected: 1,
            actual: 0,
        });
    };
    if in_features != weight_shape[1] {
        return Err(KernelError::ShapeMismatch {
            op: "linear",
            lhs: input_shape.to_vec(),
            rhs: weight_shape.to_vec(),
        });
    }
    let rows = input_shape[..input_shape.len() - 1].iter().product();
    Ok((rows, in_features, weight_shape[0]))
}

/// `input @ weight^T + bias` over the last input dimension.
pub fn linear(
    input: &[f32],
    input_shape: &[usize],
    weight: &[f32],
    weight_shape: &[usize],
    bias: Option<&[f32]>,
) -> Result<(Vec<f32>, Vec<usize>), KernelError> {
    let (rows, in_features, out_features) = linear_dims(input_shape, weight_shape)?;
    ensure_len("linear", input, input_shape)?;
    ensure_len("linear", weight, weight_shape)?;
    let mut out = vec![0.0f32; rows * out_features];
    gemm(
        input,
        &transpose(weight, out_features, in_features),
        rows,
        in_features,
        out_features,
        &mut out,
    );
    if let Some(bias) = bias {
        ensure_len("linear", bias, &[out_features])?;
        for row in out.chunks_mut(out_features.max(1)) {
            for (slot, b) in row.iter_mut().zip(bias) {
                *slot += b;
            }
        }
    }
    let mut shape = input_shape.to_vec();
    if let Some(last) = shape.last_mut() {
        *last = out_features;
    }
    Ok((out, shape))
}

/// Gradients with respect to input, weight and bias.
pub fn linear_backward(
    grad: &[f32],
    input: &[f32],
    input_shape: &[usize],
    weight: &[f32],
    weight_shape: &[usize],
) -> Result<(Vec<f32>, Vec<f32>, Vec<f32>), KernelError> {
    let (rows, in_features, out_features) = linear_dims(input_shape, weight_shape)?;
    ensure_len("linear_backward", grad, &[rows, out_features])?;
    let mut grad_input = vec![0.0f32; rows * in_features];
    gemm(grad, weight, rows, out_features, in_features, &mut grad_input);
    let mut grad_weight = vec![0.0f32; out_features * in_features];
    gemm(
        &transpose(grad, rows, out_features),
        input,
        out_features,
        rows,
        in_features,
        &mut grad_weight,
    );
    let mut grad_bias = vec![0.0f32; out_features];
    for row in grad.chunks(out_features.max(1)) {
        for (slot, g) in grad_bias.iter_mut().zip(row) {
            *slot += g;
        }
    }
    Ok((grad_input, grad_weight, grad_bias))
}
