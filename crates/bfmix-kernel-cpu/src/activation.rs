use std::f32::consts::{FRAC_1_SQRT_2, PI};

use crate::{KernelError, ensure_len, invalid};

#[must_use]
pub fn relu(values: &[f32]) -> Vec<f32> {
    values.iter().map(|v| v.max(0.0)).collect()
}

pub fn relu_backward(grad: &[f32], input: &[f32]) -> Result<Vec<f32>, KernelError> {
    same_len("relu_backward", grad, input)?;
    Ok(grad
        .iter()
        .zip(input)
        .map(|(g, x)| if *x > 0.0 { *g } else { 0.0 })
        .collect())
}

/// Exact (erf based) GELU.
#[must_use]
pub fn gelu(values: &[f32]) -> Vec<f32> {
    values
        .iter()
        .map(|x| 0.5 * x * (1.0 + libm::erff(x * FRAC_1_SQRT_2)))
        .collect()
}

pub fn gelu_backward(grad: &[f32], input: &[f32]) -> Result<Vec<f32>, KernelError> {
    same_len("gelu_backward", grad, input)?;
    let inv_sqrt_2pi = 1.0 / (2.0 * PI).sqrt();
    Ok(grad
        .iter()
        .zip(input)
        .map(|(g, x)| {
            let cdf = 0.5 * (1.0 + libm::erff(x * FRAC_1_SQRT_2));
            let pdf = inv_sqrt_2pi * (-0.5 * x * x).exp();
            g * (cdf + x * pdf)
        })
        .collect())
}

#[must_use]
pub fn sigmoid(values: &[f32]) -> Vec<f32> {
    values.iter().map(|x| 1.0 / (1.0 + (-x).exp())).collect()
}

/// Gradient expressed through the forward output `y`.
pub fn sigmoid_backward(grad: &[f32], output: &[f32]) -> Result<Vec<f32>, KernelError> {
    same_len("sigmoid_backward", grad, output)?;
    Ok(grad
        .iter()
        .zip(output)
        .map(|(g, y)| g * y * (1.0 - y))
        .collect())
}

pub fn softmax(values: &[f32], shape: &[usize], dim: usize) -> Result<Vec<f32>, KernelError> {
    ensure_len("softmax", values, shape)?;
    let (outer, size, inner) = split_dim("softmax", shape, dim)?;
    let mut out = vec![0.0f32; values.len()];
    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| (o * size + k) * inner + i;
            let max = (0..size)
                .map(|k| values[at(k)])
                .fold(f32::NEG_INFINITY, f32::max);
            let mut total = 0.0f32;
            for k in 0..size {
                let e = (values[at(k)] - max).exp();
                out[at(k)] = e;
                total += e;
            }
            for k in 0..size {
                out[at(k)] /= total;
            }
        }
    }
    Ok(out)
}

pub fn softmax_backward(
    grad: &[f32],
    output: &[f32],
    shape: &[usize],
    dim: usize,
) -> Result<Vec<f32>, KernelError> {
    ensure_len("softmax_backward", grad, shape)?;
    ensure_len("softmax_backward", output, shape)?;
    let (outer, size, inner) = split_dim("softmax_backward", shape, dim)?;
    let mut out = vec![0.0f32; grad.len()];
    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| (o * size + k) * inner + i;
            let dot: f32 = (0..size).map(|k| grad[at(k)] * output[at(k)]).sum();
            for k in 0..size {
                out[at(k)] = output[at(k)] * (grad[at(k)] - dot);
            }
        }
    }
    Ok(out)
}

/// `(outer, size, inner)` extents around `dim`.
pub(crate) fn split_dim(
    op: &'static str,
    shape: &[usize],
    dim: usize,
) -> Result<(usize, usize, usize), KernelError> {
    if dim >= shape.len() {
        return Err(invalid(
            op,
            format!("dim {dim} out of range for rank {}", shape.len()),
        ));
    }
    let outer = shape[..dim].iter().product();
    let inner = shape[dim + 1..].iter().product();
    Ok((outer, shape[dim], inner))
}

fn same_len(op: &'static str, lhs: &[f32], rhs: &[f32]) -> Result<(), KernelError> {
    if lhs.len() != rhs.len() {
        return Err(KernelError::LengthMismatch {
            op,
            expected: rhs.len(),
            actual: lhs.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        gelu, gelu_backward, relu, relu_backward, sigmoid, sigmoid_backward, softmax,
        softmax_backward,
    };
    use crate::test_support::{assert_close, numeric_grad, ramp};

    #[test]
    fn relu_clamps_and_masks_gradient() {
        assert_eq!(relu(&[-1.0, 0.0, 2.0]), vec![0.0, 0.0, 2.0]);
        let grad = relu_backward(&[1.0, 1.0, 1.0], &[-1.0, 0.0, 2.0]).expect("grad");
        assert_eq!(grad, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn gelu_matches_known_points() {
        let out = gelu(&[0.0, 1.0, -1.0]);
        assert_close(&out, &[0.0, 0.841_344_7, -0.158_655_26], 1e-5);
    }

    #[test]
    fn gelu_gradient_matches_finite_difference() {
        let input = ramp(8, 0.4);
        let weights = vec![1.0; 8];
        let analytic = gelu_backward(&weights, &input).expect("grad");
        let numeric = numeric_grad(&input, &weights, gelu);
        assert_close(&analytic, &numeric, 2e-2);
    }

    #[test]
    fn sigmoid_gradient_uses_output() {
        let y = sigmoid(&[0.0]);
        assert_close(&y, &[0.5], 1e-6);
        let grad = sigmoid_backward(&[1.0], &y).expect("grad");
        assert_close(&grad, &[0.25], 1e-6);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let input = ramp(12, 0.3);
        let out = softmax(&input, &[3, 4], 1).expect("softmax");
        for row in out.chunks(4) {
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
        let cols = softmax(&input, &[3, 4], 0).expect("softmax dim 0");
        let col0: f32 = (0..3).map(|r| cols[r * 4]).sum();
        assert!((col0 - 1.0).abs() < 1e-5);
        assert!(softmax(&input, &[3, 4], 2).is_err());
    }

    #[test]
    fn softmax_gradient_matches_finite_difference() {
        let input = ramp(6, 0.5);
        let weights: Vec<f32> = (0..6).map(|i| i as f32 * 0.1).collect();
        let out = softmax(&input, &[2, 3], 1).expect("softmax");
        let analytic = softmax_backward(&weights, &out, &[2, 3], 1).expect("grad");
        let numeric = numeric_grad(&input, &weights, |x| {
            softmax(x, &[2, 3], 1).expect("softmax")
        });
        assert_close(&analytic, &numeric, 2e-2);
    }
}
