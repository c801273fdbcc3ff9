use crate::activation::split_dim;
use crate::{KernelError, ensure_len, invalid};

/// Gathers `indices` along `dim`.
pub fn index_select(
    values: &[f32],
    shape: &[usize],
    dim: usize,
    indices: &[usize],
) -> Result<(Vec<f32>, Vec<usize>), KernelError> {
    ensure_len("index_select", values, shape)?;
    let (outer, size, inner) = split_dim("index_select", shape, dim)?;
    if let Some(&bad) = indices.iter().find(|&&i| i >= size) {
        return Err(KernelError::IndexOutOfRange {
            op: "index_select",
            index: bad,
            size,
        });
    }
    let mut out = Vec::with_capacity(outer * indices.len() * inner);
    for o in 0..outer {
        for &i in indices {
            let start = (o * size + i) * inner;
            out.extend_from_slice(&values[start..start + inner]);
        }
    }
    let mut out_shape = shape.to_vec();
    out_shape[dim] = indices.len();
    Ok((out, out_shape))
}

/// Scatter-adds `grad` back into an input of `input_shape`.
pub fn index_select_backward(
    grad: &[f32],
    input_shape: &[usize],
    dim: usize,
    indices: &[usize],
) -> Result<Vec<f32>, KernelError> {
    let (outer, size, inner) = split_dim("index_select_backward", input_shape, dim)?;
    let expected = outer * indices.len() * inner;
    if grad.len() != expected {
        return Err(KernelError::LengthMismatch {
            op: "index_select_backward",
            expected,
            actual: grad.len(),
        });
    }
    let mut out = vec![0.0f32; outer * size * inner];
    let mut position = 0usize;
    for o in 0..outer {
        for &i in indices {
            if i >= size {
                return Err(KernelError::IndexOutOfRange {
                    op: "index_select_backward",
                    index: i,
                    size,
                });
            }
            let start = (o * size + i) * inner;
            for (slot, g) in out[start..start + inner]
                .iter_mut()
                .zip(&grad[position..position + inner])
            {
                *slot += g;
            }
            position += inner;
        }
    }
    Ok(out)
}

/// Concatenates parts along `dim`. All other extents must agree.
pub fn cat(parts: &[(&[f32], &[usize])], dim: usize) -> Result<(Vec<f32>, Vec<usize>), KernelError> {
    let Some((_, first_shape)) = parts.first() else {
        return Err(invalid("cat", "expected a non-empty list of tensors"));
    };
    let rank = first_shape.len();
    if dim >= rank {
        return Err(invalid("cat", format!("dim {dim} out of range for rank {rank}")));
    }
    let mut out_shape = first_shape.to_vec();
    out_shape[dim] = 0;
    for (values, shape) in parts {
        ensure_len("cat", values, shape)?;
        let agrees = shape.len() == rank
            && shape
                .iter()
                .zip(first_shape.iter())
                .enumerate()
                .all(|(d, (a, b))| d == dim || a == b);
        if !agrees {
            return Err(KernelError::ShapeMismatch {
                op: "cat",
                lhs: first_shape.to_vec(),
                rhs: shape.to_vec(),
            });
        }
        out_shape[dim] += shape[dim];
    }
    let outer: usize = first_shape[..dim].iter().product();
    let inner: usize = first_shape[dim + 1..].iter().product();
    let mut out = Vec::with_capacity(out_shape.iter().product());
    for o in 0..outer {
        for (values, shape) in parts {
            let chunk = shape[dim] * inner;
            out.extend_from_slice(&values[o * chunk..(o + 1) * chunk]);
        }
    }
    Ok((out, out_shape))
}

/// Splits `values` along `dim` into chunks of the given sizes.
pub fn split_along(
    values: &[f32],
    shape: &[usize],
    dim: usize,
    sizes: &[usize],
) -> Result<Vec<Vec<f32>>, KernelError> {
    ensure_len("split", values, shape)?;
    let (outer, size, inner) = split_dim("split", shape, dim)?;
    if sizes.iter().sum::<usize>() != size {
        return Err(invalid(
            "split",
            format!("sizes {sizes:?} do not sum to extent {size}"),
        ));
    }
    let mut parts: Vec<Vec<f32>> = sizes
        .iter()
        .map(|s| Vec::with_capacity(outer * s * inner))
        .collect();
    for o in 0..outer {
        let mut offset = 0usize;
        for (part, s) in parts.iter_mut().zip(sizes) {
            let start = (o * size + offset) * inner;
            part.extend_from_slice(&values[start..start + s * inner]);
            offset += s;
        }
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::{cat, index_select, index_select_backward, split_along};

    #[test]
    fn index_select_rows_and_columns() {
        let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let (rows, shape) = index_select(&values, &[3, 4], 0, &[2, 0]).expect("rows");
        assert_eq!(shape, vec![2, 4]);
        assert_eq!(rows, vec![8.0, 9.0, 10.0, 11.0, 0.0, 1.0, 2.0, 3.0]);

        let (cols, shape) = index_select(&values, &[3, 4], 1, &[3, 3]).expect("cols");
        assert_eq!(shape, vec![3, 2]);
        assert_eq!(cols, vec![3.0, 3.0, 7.0, 7.0, 11.0, 11.0]);
        assert!(index_select(&values, &[3, 4], 1, &[4]).is_err());
    }

    #[test]
    fn index_select_backward_accumulates_duplicates() {
        let grad = index_select_backward(&[1.0; 6], &[3, 4], 1, &[3, 3]).expect("grad");
        assert_eq!(grad, vec![0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 2.0]);
    }

    #[test]
    fn cat_then_split_restores_parts() {
        let a: Vec<f32> = (0..6).map(|v| v as f32).collect();
        let b: Vec<f32> = (6..10).map(|v| v as f32).collect();
        let a_shape = [2usize, 3];
        let b_shape = [2usize, 2];
        let (joined, shape) = cat(
            &[(a.as_slice(), &a_shape[..]), (b.as_slice(), &b_shape[..])],
            1,
        )
        .expect("cat");
        assert_eq!(shape, vec![2, 5]);
        assert_eq!(joined, vec![0.0, 1.0, 2.0, 6.0, 7.0, 3.0, 4.0, 5.0, 8.0, 9.0]);
        let parts = split_along(&joined, &shape, 1, &[3, 2]).expect("split");
        assert_eq!(parts, vec![a, b]);
    }

    #[test]
    fn cat_rejects_mismatched_extents() {
        let a = [0.0f32; 6];
        let b = [0.0f32; 6];
        let a_shape = [2usize, 3];
        let b_shape = [3usize, 2];
        assert!(cat(&[(&a[..], &a_shape[..]), (&b[..], &b_shape[..])], 1).is_err());
        assert!(cat(&[], 0).is_err());
    }
}
