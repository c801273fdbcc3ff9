use crate::{KernelError, ensure_len, for_each_index, invalid, numel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Avg,
    Max,
}

/// Window parameters for 2-d or 3-d pooling. Spatial vectors hold one entry
/// per spatial dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolParams {
    pub kernel: Vec<usize>,
    pub stride: Vec<usize>,
    pub padding: Vec<usize>,
    pub ceil_mode: bool,
    pub count_include_pad: bool,
}

impl PoolParams {
    /// Square window with stride equal to the kernel.
    #[must_use]
    pub fn window(spatial: usize, kernel: usize) -> Self {
        Self {
            kernel: vec![kernel; spatial],
            stride: vec![kernel; spatial],
            padding: vec![0; spatial],
            ceil_mode: false,
            count_include_pad: true,
        }
    }

    #[must_use]
    pub fn spatial_rank(&self) -> usize {
        self.kernel.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolOutput {
    pub values: Vec<f32>,
    pub shape: Vec<usize>,
    /// Flat input index of each max-pool winner; empty for average pooling.
    pub argmax: Vec<usize>,
}

/// Output extent along one axis, mirroring the usual ceil-mode rule that the
/// last window must start inside the input or left padding.
fn pooled_extent(
    size: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    ceil_mode: bool,
) -> Option<usize> {
    let padded = size + 2 * padding;
    if padded < kernel {
        return None;
    }
    let span = padded - kernel;
    let mut out = if ceil_mode {
        span.div_ceil(stride) + 1
    } else {
        span / stride + 1
    };
    if ceil_mode && (out - 1) * stride >= size + padding {
        out -= 1;
    }
    Some(out)
}

struct Layout {
    planes: usize,
    in_spatial: Vec<usize>,
    out_spatial: Vec<usize>,
    out_shape: Vec<usize>,
}

fn layout(shape: &[usize], params: &PoolParams, op: &'static str) -> Result<Layout, KernelError> {
    let spatial = params.spatial_rank();
    if spatial == 0 || params.stride.len() != spatial || params.padding.len() != spatial {
        return Err(invalid(op, "kernel, stride and padding must share one rank"));
    }
    if shape.len() != spatial + 2 {
        return Err(KernelError::RankMismatch {
            op,
            expected: spatial + 2,
            actual: shape.len(),
        });
    }
    let in_spatial = shape[2..].to_vec();
    let mut out_spatial = Vec::with_capacity(spatial);
    for axis in 0..spatial {
        let (kernel, stride, padding) = (
            params.kernel[axis],
            params.stride[axis],
            params.padding[axis],
        );
        if kernel == 0 || stride == 0 {
            return Err(invalid(op, "kernel and stride must be positive"));
        }
        if padding > kernel / 2 {
            return Err(invalid(
                op,
                format!("padding {padding} should be at most half of kernel {kernel}"),
            ));
        }
        let extent = pooled_extent(in_spatial[axis], kernel, stride, padding, params.ceil_mode)
            .ok_or_else(|| invalid(op, format!("window larger than input on axis {axis}")))?;
        out_spatial.push(extent);
    }
    let mut out_shape = shape[..2].to_vec();
    out_shape.extend_from_slice(&out_spatial);
    Ok(Layout {
        planes: shape[0] * shape[1],
        in_spatial,
        out_spatial,
        out_shape,
    })
}

/// Per-axis clipped window `[start, end)` plus the padded window size used as
/// the `count_include_pad` divisor.
fn window(
    out: usize,
    axis: usize,
    params: &PoolParams,
    size: usize,
) -> (usize, usize, usize) {
    let start = (out * params.stride[axis]) as isize - params.padding[axis] as isize;
    let padded_end = (start + params.kernel[axis] as isize).min((size + params.padding[axis]) as isize);
    let padded_len = (padded_end - start).max(0) as usize;
    let clipped_start = start.max(0) as usize;
    let clipped_end = padded_end.min(size as isize).max(0) as usize;
    (clipped_start, clipped_end.max(clipped_start), padded_len)
}

fn flat(index: &[usize], dims: &[usize]) -> usize {
    index.iter().zip(dims).fold(0, |acc, (i, d)| acc * d + i)
}

/// Calls `f(out_flat, window_flat_indices, divisor)` for every output
/// position of one plane.
fn visit_windows(
    layout: &Layout,
    params: &PoolParams,
    mut f: impl FnMut(usize, &[usize], usize),
) {
    let spatial = layout.in_spatial.len();
    let mut members = Vec::new();
    for_each_index(&layout.out_spatial, |out_index| {
        let mut ranges = Vec::with_capacity(spatial);
        let mut padded_count = 1usize;
        for axis in 0..spatial {
            let (start, end, padded_len) =
                window(out_index[axis], axis, params, layout.in_spatial[axis]);
            ranges.push((start, end));
            padded_count *= padded_len;
        }
        members.clear();
        let extents: Vec<usize> = ranges.iter().map(|(s, e)| e - s).collect();
        for_each_index(&extents, |offset| {
            let position: Vec<usize> = offset
                .iter()
                .zip(&ranges)
                .map(|(o, (s, _))| o + s)
                .collect();
            members.push(flat(&position, &layout.in_spatial));
        });
        let divisor = if params.count_include_pad {
            padded_count
        } else {
            members.len()
        };
        f(flat(out_index, &layout.out_spatial), &members, divisor);
    });
}

/// Average or max pooling over `[N, C, spatial...]`.
pub fn pool_nd(
    kind: PoolKind,
    input: &[f32],
    shape: &[usize],
    params: &PoolParams,
) -> Result<PoolOutput, KernelError> {
    let op = match kind {
        PoolKind::Avg => "avg_pool",
        PoolKind::Max => "max_pool",
    };
    ensure_len(op, input, shape)?;
    let layout = layout(shape, params, op)?;
    let in_plane = numel(&layout.in_spatial);
    let out_plane = numel(&layout.out_spatial);
    let mut values = vec![0.0f32; layout.planes * out_plane];
    let mut argmax = match kind {
        PoolKind::Avg => Vec::new(),
        PoolKind::Max => vec![0usize; values.len()],
    };
    for plane in 0..layout.planes {
        let source = &input[plane * in_plane..(plane + 1) * in_plane];
        visit_windows(&layout, params, |out, members, divisor| {
            let slot = plane * out_plane + out;
            match kind {
                PoolKind::Avg => {
                    let total: f32 = members.iter().map(|&i| source[i]).sum();
                    values[slot] = if divisor == 0 {
                        0.0
                    } else {
                        total / divisor as f32
                    };
                }
                PoolKind::Max => {
                    let mut best = f32::NEG_INFINITY;
                    let mut best_index = members.first().copied().unwrap_or(0);
                    for &i in members {
                        let v = source[i];
                        if v > best || v.is_nan() {
                            best = v;
                            best_index = i;
                            if v.is_nan() {
                                break;
                            }
                        }
                    }
                    values[slot] = best;
                    argmax[slot] = plane * in_plane + best_index;
                }
            }
        });
    }
    Ok(PoolOutput {
        values,
        shape: layout.out_shape,
        argmax,
    })
}

/// Gradient of [`pool_nd`] with respect to its input. `argmax` must come from
/// the forward pass for max pooling.
pub fn pool_backward(
    kind: PoolKind,
    grad: &[f32],
    input_shape: &[usize],
    params: &PoolParams,
    argmax: &[usize],
) -> Result<Vec<f32>, KernelError> {
    let op = "pool_backward";
    let layout = layout(input_shape, params, op)?;
    ensure_len(op, grad, &layout.out_shape)?;
    let in_plane = numel(&layout.in_spatial);
    let out_plane = numel(&layout.out_spatial);
    let mut grad_input = vec![0.0f32; numel(input_shape)];
    match kind {
        PoolKind::Max => {
            if argmax.len() != grad.len() {
                return Err(KernelError::LengthMismatch {
                    op,
                    expected: grad.len(),
                    actual: argmax.len(),
                });
            }
            for (g, &index) in grad.iter().zip(argmax) {
                let slot = grad_input.get_mut(index).ok_or(KernelError::IndexOutOfRange {
                    op,
                    index,
                    size: in_plane * layout.planes,
                })?;
                *slot += g;
            }
        }
        PoolKind::Avg => {
            for plane in 0..layout.planes {
                let target = &mut grad_input[plane * in_plane..(plane + 1) * in_plane];
                visit_windows(&layout, params, |out, members, divisor| {
                    if divisor == 0 {
                        return;
                    }
                    let share = grad[plane * out_plane + out] / divisor as f32;
                    for &i in members {
                        target[i] += share;
                    }
                });
            }
        }
    }
    Ok(grad_input)
}

fn adaptive_bounds(out: usize, out_size: usize, in_size: usize) -> (usize, usize) {
    let start = (out * in_size) / out_size;
    let end = ((out + 1) * in_size).div_ceil(out_size);
    (start, end)
}

fn adaptive_check(shape: &[usize], output_size: [usize; 2]) -> Result<(), KernelError> {
    if shape.len() != 4 {
        return Err(KernelError::RankMismatch {
            op: "adaptive_avg_pool2d",
            expected: 4,
            actual: shape.len(),
        });
    }
    if output_size.contains(&0) {
        return Err(invalid("adaptive_avg_pool2d", "output size must be positive"));
    }
    Ok(())
}

/// Adaptive average pooling of `[N, C, H, W]` to `[N, C, oh, ow]`.
pub fn adaptive_avg_pool2d(
    input: &[f32],
    shape: &[usize],
    output_size: [usize; 2],
) -> Result<(Vec<f32>, Vec<usize>), KernelError> {
    adaptive_check(shape, output_size)?;
    ensure_len("adaptive_avg_pool2d", input, shape)?;
    let (planes, h, w) = (shape[0] * shape[1], shape[2], shape[3]);
    let [oh, ow] = output_size;
    let mut out = vec![0.0f32; planes * oh * ow];
    for plane in 0..planes {
        let source = &input[plane * h * w..(plane + 1) * h * w];
        for oy in 0..oh {
            let (y0, y1) = adaptive_bounds(oy, oh, h);
            for ox in 0..ow {
                let (x0, x1) = adaptive_bounds(ox, ow, w);
                let mut total = 0.0f32;
                for y in y0..y1 {
                    for x in x0..x1 {
                        total += source[y * w + x];
                    }
                }
                let count = (y1 - y0) * (x1 - x0);
                out[(plane * oh + oy) * ow + ox] = if count == 0 {
                    0.0
                } else {
                    total / count as f32
                };
            }
        }
    }
    Ok((out, vec![shape[0], shape[1], oh, ow]))
}

pub fn adaptive_avg_pool2d_backward(
    grad: &[f32],
    input_shape: &[usize],
    output_size: [usize; 2],
) -> Result<Vec<f32>, KernelError> {
    adaptive_check(input_shape, output_size)?;
    let (planes, h, w) = (
        input_shape[0] * input_shape[1],
        input_shape[2],
        input_shape[3],
    );
    let [oh, ow] = output_size;
    ensure_len(
        "adaptive_avg_pool2d_backward",
        grad,
        &[input_shape[0], input_shape[1], oh, ow],
    )?;
    let mut grad_input = vec![0.0f32; planes * h * w];
    for plane in 0..planes {
        for oy in 0..oh {
            let (y0, y1) = adaptive_bounds(oy, oh, h);
            for ox in 0..ow {
                let (x0, x1) = adaptive_bounds(ox, ow, w);
                let count = (y1 - y0) * (x1 - x0);
                if count == 0 {
                    continue;
                }
                let share = grad[(plane * oh + oy) * ow + ox] / count as f32;
                for y in y0..y1 {
                    for x in x0..x1 {
                        grad_input[plane * h * w + y * w + x] += share;
                    }
                }
            }
        }
    }
    Ok(grad_input)
}
