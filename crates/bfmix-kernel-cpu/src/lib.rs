#![forbid(unsafe_code)]

//! Reference f32 kernels over dense row-major buffers.
//!
//! Every kernel takes the logical values of its inputs and returns freshly
//! allocated outputs. Storage layout and precision are the caller's concern.

pub mod activation;
pub mod conv;
pub mod elementwise;
pub mod index;
pub mod matmul;
pub mod norm;
pub mod pool;

use std::fmt;

pub use activation::{
    gelu, gelu_backward, relu, relu_backward, sigmoid, sigmoid_backward, softmax,
    softmax_backward,
};
pub use conv::{
    Conv2dParams, ConvTranspose2dParams, conv_transpose2d, conv_transpose2d_backward, conv2d,
    conv2d_backward,
};
pub use elementwise::{
    BinaryOp, binary, binary_backward, broadcast_shape, expand_to, reduce_to_shape, sum,
};
pub use index::{cat, index_select, index_select_backward, split_along};
pub use matmul::{
    addbmm, addmm, baddbmm, bmm, bmm_backward, linear, linear_backward, mm, mm_backward,
    scaled_input_backward,
};
pub use norm::{BatchNormOutput, BatchNormParams, batch_norm, batch_norm_backward};
pub use pool::{
    PoolKind, PoolOutput, PoolParams, adaptive_avg_pool2d, adaptive_avg_pool2d_backward,
    pool_backward, pool_nd,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    RankMismatch {
        op: &'static str,
        expected: usize,
        actual: usize,
    },
    LengthMismatch {
        op: &'static str,
        expected: usize,
        actual: usize,
    },
    InvalidParameter {
        op: &'static str,
        detail: String,
    },
    IndexOutOfRange {
        op: &'static str,
        index: usize,
        size: usize,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch { op, lhs, rhs } => {
                write!(f, "{op}: shape mismatch lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::RankMismatch {
                op,
                expected,
                actual,
            } => write!(f, "{op}: expected rank {expected}, got {actual}"),
            Self::LengthMismatch {
                op,
                expected,
                actual,
            } => write!(
                f,
                "{op}: buffer length mismatch expected={expected}, actual={actual}"
            ),
            Self::InvalidParameter { op, detail } => write!(f, "{op}: {detail}"),
            Self::IndexOutOfRange { op, index, size } => {
                write!(f, "{op}: index {index} out of range for size {size}")
            }
        }
    }
}

impl std::error::Error for KernelError {}

pub(crate) fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

pub(crate) fn ensure_len(
    op: &'static str,
    values: &[f32],
    shape: &[usize],
) -> Result<(), KernelError> {
    let expected = numel(shape);
    if values.len() != expected {
        return Err(KernelError::LengthMismatch {
            op,
            expected,
            actual: values.len(),
        });
    }
    Ok(())
}

pub(crate) fn ensure_rank(
    op: &'static str,
    shape: &[usize],
    expected: usize,
) -> Result<(), KernelError> {
    if shape.len() != expected {
        return Err(KernelError::RankMismatch {
            op,
            expected,
            actual: shape.len(),
        });
    }
    Ok(())
}

pub(crate) fn invalid(op: &'static str, detail: impl Into<String>) -> KernelError {
    KernelError::InvalidParameter {
        op,
        detail: detail.into(),
    }
}

/// Calls `f` with every multi-index inside `dims` in row-major order.
pub(crate) fn for_each_index(dims: &[usize], mut f: impl FnMut(&[usize])) {
    if dims.contains(&0) {
        return;
    }
    let mut cursor = vec![0usize; dims.len()];
    loop {
        f(&cursor);
        let mut dim = dims.len();
        loop {
            if dim == 0 {
                return;
            }
            dim -= 1;
            cursor[dim] += 1;
            if cursor[dim] < dims[dim] {
                break;
            }
            cursor[dim] = 0;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::for_each_index;

    #[test]
    fn index_walk_is_row_major() {
        let mut seen = Vec::new();
        for_each_index(&[2, 3], |idx| seen.push((idx[0], idx[1])));
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0], (0, 0));
        assert_eq!(seen[3], (1, 0));
        assert_eq!(seen[5], (1, 2));
    }

    #[test]
    fn index_walk_skips_empty_dims() {
        let mut count = 0;
        for_each_index(&[3, 0], |_| count += 1);
        assert_eq!(count, 0);
        for_each_index(&[], |_| count += 1);
        assert_eq!(count, 1);
    }
}
