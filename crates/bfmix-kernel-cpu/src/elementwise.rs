use crate::{KernelError, ensure_len, for_each_index, numel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
        }
    }

    fn apply(self, lhs: f32, rhs: f32) -> f32 {
        match self {
            Self::Add => lhs + rhs,
            Self::Sub => lhs - rhs,
            Self::Mul => lhs * rhs,
            Self::Div => lhs / rhs,
        }
    }
}

/// Trailing-dimension broadcast of two shapes.
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, KernelError> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![1usize; rank];
    for i in 0..rank {
        let l = lhs.len().checked_sub(rank - i).map_or(1, |j| lhs[j]);
        let r = rhs.len().checked_sub(rank - i).map_or(1, |j| rhs[j]);
        out[i] = match (l, r) {
            (l, r) if l == r => l,
            (1, r) => r,
            (l, 1) => l,
            _ => {
                return Err(KernelError::ShapeMismatch {
                    op: "broadcast",
                    lhs: lhs.to_vec(),
                    rhs: rhs.to_vec(),
                });
            }
        };
    }
    Ok(out)
}

/// Materializes `values` of `shape` broadcast to `target`.
pub fn expand_to(values: &[f32], shape: &[usize], target: &[usize]) -> Result<Vec<f32>, KernelError> {
    ensure_len("expand", values, shape)?;
    if broadcast_shape(shape, target)? != target {
        return Err(KernelError::ShapeMismatch {
            op: "expand",
            lhs: shape.to_vec(),
            rhs: target.to_vec(),
        });
    }
    let strides = broadcast_strides(shape, target.len());
    let mut out = Vec::with_capacity(numel(target));
    for_each_index(target, |idx| {
        let offset: usize = idx.iter().zip(&strides).map(|(i, s)| i * s).sum();
        out.push(values[offset]);
    });
    Ok(out)
}

/// Sums `grad` of `grad_shape` back down to `target` (the inverse of a broadcast).
pub fn reduce_to_shape(
    grad: &[f32],
    grad_shape: &[usize],
    target: &[usize],
) -> Result<Vec<f32>, KernelError> {
    ensure_len("reduce_to_shape", grad, grad_shape)?;
    if broadcast_shape(target, grad_shape)? != grad_shape {
        return Err(KernelError::ShapeMismatch {
            op: "reduce_to_shape",
            lhs: grad_shape.to_vec(),
            rhs: target.to_vec(),
        });
    }
    let strides = broadcast_strides(target, grad_shape.len());
    let mut out = vec![0.0f32; numel(target)];
    let mut position = 0usize;
    for_each_index(grad_shape, |idx| {
        let offset: usize = idx.iter().zip(&strides).map(|(i, s)| i * s).sum();
        out[offset] += grad[position];
        position += 1;
    });
    Ok(out)
}

fn broadcast_strides(shape: &[usize], rank: usize) -> Vec<usize> {
    let mut strides = vec![0usize; rank];
    let mut running = 1usize;
    for (k, size) in shape.iter().copied().enumerate().rev() {
        let slot = rank - (shape.len() - k);
        strides[slot] = if size == 1 { 0 } else { running };
        running *= size;
    }
    strides
}

/// Broadcasting binary op. Returns the output values and shape.
pub fn binary(
    op: BinaryOp,
    lhs: &[f32],
    lhs_shape: &[usize],
    rhs: &[f32],
    rhs_shape: &[usize],
) -> Result<(Vec<f32>, Vec<usize>), KernelError> {
    ensure_len(op.name(), lhs, lhs_shape)?;
    ensure_len(op.name(), rhs, rhs_shape)?;
    let out_shape = broadcast_shape(lhs_shape, rhs_shape)?;
    let values = if lhs_shape == rhs_shape {
        lhs.iter().zip(rhs).map(|(l, r)| op.apply(*l, *r)).collect()
    } else {
        let lhs = expand_to(lhs, lhs_shape, &out_shape)?;
        let rhs = expand_to(rhs, rhs_shape, &out_shape)?;
        lhs.iter().zip(&rhs).map(|(l, r)| op.apply(*l, *r)).collect()
    };
    Ok((values, out_shape))
}

/// Gradients of a broadcasting binary op with respect to both operands.
pub fn binary_backward(
    op: BinaryOp,
    grad: &[f32],
    lhs: &[f32],
    lhs_shape: &[usize],
    rhs: &[f32],
    rhs_shape: &[usize],
) -> Result<(Vec<f32>, Vec<f32>), KernelError> {
    let out_shape = broadcast_shape(lhs_shape, rhs_shape)?;
    ensure_len(op.name(), grad, &out_shape)?;
    let lhs_full = expand_to(lhs, lhs_shape, &out_shape)?;
    let rhs_full = expand_to(rhs, rhs_shape, &out_shape)?;
    let (grad_lhs, grad_rhs): (Vec<f32>, Vec<f32>) = grad
        .iter()
        .zip(lhs_full.iter().zip(&rhs_full))
        .map(|(g, (l, r))| match op {
            BinaryOp::Add => (*g, *g),
            BinaryOp::Sub => (*g, -*g),
            BinaryOp::Mul => (g * r, g * l),
            BinaryOp::Div => (g / r, -g * l / (r * r)),
        })
        .unzip();
    Ok((
        reduce_to_shape(&grad_lhs, &out_shape, lhs_shape)?,
        reduce_to_shape(&grad_rhs, &out_shape, rhs_shape)?,
    ))
}

#[must_use]
pub fn sum(values: &[f32]) -> f32 {
    values.iter().sum()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{BinaryOp, binary, binary_backward, broadcast_shape, expand_to, reduce_to_shape};

    #[test]
    fn same_shape_binary_ops() {
        let (out, shape) =
            binary(BinaryOp::Mul, &[1.0, 2.0, 3.0], &[3], &[4.0, 5.0, 6.0], &[3]).expect("mul");
        assert_eq!(shape, vec![3]);
        assert_eq!(out, vec![4.0, 10.0, 18.0]);
    }

    #[test]
    fn bias_style_broadcast() {
        let (out, shape) = binary(
            BinaryOp::Add,
            &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
            &[2, 3],
            &[10.0, 20.0, 30.0],
            &[3],
        )
        .expect("add");
        assert_eq!(shape, vec![2, 3]);
        assert_eq!(out, vec![10.0, 21.0, 32.0, 13.0, 24.0, 35.0]);
    }

    #[test]
    fn incompatible_shapes_fail() {
        assert!(broadcast_shape(&[2, 3], &[4]).is_err());
        assert!(expand_to(&[1.0, 2.0], &[2], &[3]).is_err());
    }

    #[test]
    fn broadcast_gradient_is_summed_back() {
        let (_, grad_rhs) = binary_backward(
            BinaryOp::Add,
            &[1.0; 6],
            &[0.0; 6],
            &[2, 3],
            &[0.0; 3],
            &[3],
        )
        .expect("backward");
        assert_eq!(grad_rhs, vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn division_gradients() {
        let (gl, gr) =
            binary_backward(BinaryOp::Div, &[1.0], &[6.0], &[1], &[2.0], &[1]).expect("div");
        assert_eq!(gl, vec![0.5]);
        assert_eq!(gr, vec![-1.5]);
    }

    proptest! {
        #[test]
        fn prop_reduce_inverts_expand_sum(rows in 1usize..5, cols in 1usize..5) {
            let row: Vec<f32> = (0..cols).map(|c| c as f32).collect();
            let expanded = expand_to(&row, &[1, cols], &[rows, cols]).expect("expand");
            let reduced = reduce_to_shape(&expanded, &[rows, cols], &[1, cols]).expect("reduce");
            let expected: Vec<f32> = row.iter().map(|v| v * rows as f32).collect();
            prop_assert_eq!(reduced, expected);
        }
    }
}
