use crate::{KernelError, ensure_len, ensure_rank, invalid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dParams {
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    pub groups: usize,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self {
            stride: [1, 1],
            padding: [0, 0],
            dilation: [1, 1],
            groups: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvTranspose2dParams {
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub output_padding: [usize; 2],
    pub dilation: [usize; 2],
    pub groups: usize,
}

impl Default for ConvTranspose2dParams {
    fn default() -> Self {
        Self {
            stride: [1, 1],
            padding: [0, 0],
            output_padding: [0, 0],
            dilation: [1, 1],
            groups: 1,
        }
    }
}

/// Resolved geometry of one convolution. `x` is the image side of the
/// weights (input for conv, output for the transposed conv).
#[derive(Debug, Clone, Copy)]
struct Geometry {
    batch: usize,
    groups: usize,
    x_channels: usize,
    x_hw: [usize; 2],
    y_channels: usize,
    y_hw: [usize; 2],
    kernel: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
    dilation: [usize; 2],
}

impl Geometry {
    /// Calls `f(x_index, y_index, weight_index)` for every multiply-add of a
    /// forward convolution from `x` to `y`, where the weight is laid out
    /// `[y_channels, x_channels / groups, kh, kw]`.
    fn visit(&self, mut f: impl FnMut(usize, usize, usize)) {
        let x_per_group = self.x_channels / self.groups;
        let y_per_group = self.y_channels / self.groups;
        let [xh, xw] = self.x_hw;
        let [yh, yw] = self.y_hw;
        let [kh, kw] = self.kernel;
        for n in 0..self.batch {
            for g in 0..self.groups {
                for yc in 0..y_per_group {
                    let oc = g * y_per_group + yc;
                    for xc in 0..x_per_group {
                        let ic = g * x_per_group + xc;
                        for oy in 0..yh {
                            for ox in 0..yw {
                                let y_index = ((n * self.y_channels + oc) * yh + oy) * yw + ox;
                                for ky in 0..kh {
                                    let Some(iy) = self.source(oy, ky, 0, xh) else {
                                        continue;
                                    };
                                    for kx in 0..kw {
                                        let Some(ix) = self.source(ox, kx, 1, xw) else {
                                            continue;
                                        };
                                        let x_index =
                                            ((n * self.x_channels + ic) * xh + iy) * xw + ix;
                                        let w_index = ((oc * x_per_group + xc) * kh + ky) * kw + kx;
                                        f(x_index, y_index, w_index);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn source(&self, out: usize, k: usize, axis: usize, size: usize) -> Option<usize> {
        let pos = (out * self.stride[axis] + k * self.dilation[axis]).checked_sub(self.padding[axis])?;
        (pos < size).then_some(pos)
    }

    fn x_len(&self) -> usize {
        self.batch * self.x_channels * self.x_hw[0] * self.x_hw[1]
    }

    fn y_len(&self) -> usize {
        self.batch * self.y_channels * self.y_hw[0] * self.y_hw[1]
    }

    fn w_len(&self) -> usize {
        self.y_channels * (self.x_channels / self.groups) * self.kernel[0] * self.kernel[1]
    }
}

fn check_common(
    op: &'static str,
    input_shape: &[usize],
    weight_shape: &[usize],
    stride: [usize; 2],
    dilation: [usize; 2],
    groups: usize,
) -> Result<(), KernelError> {
    ensure_rank(op, input_shape, 4)?;
    ensure_rank(op, weight_shape, 4)?;
    if groups == 0 {
        return Err(invalid(op, "groups must be positive"));
    }
    if stride.contains(&0) || dilation.contains(&0) {
        return Err(invalid(op, "stride and dilation must be positive"));
    }
    Ok(())
}

fn conv2d_geometry(
    input_shape: &[usize],
    weight_shape: &[usize],
    params: &Conv2dParams,
) -> Result<Geometry, KernelError> {
    let op = "conv2d";
    check_common(
        op,
        input_shape,
        weight_shape,
        params.stride,
        params.dilation,
        params.groups,
    )?;
    let (batch, channels) = (input_shape[0], input_shape[1]);
    let out_channels = weight_shape[0];
    if channels % params.groups != 0 || out_channels % params.groups != 0 {
        return Err(invalid(
            op,
            format!(
                "channels {channels} and {out_channels} must be divisible by groups {}",
                params.groups
            ),
        ));
    }
    if weight_shape[1] != channels / params.groups {
        return Err(KernelError::ShapeMismatch {
            op,
            lhs: input_shape.to_vec(),
            rhs: weight_shape.to_vec(),
        });
    }
    let kernel = [weight_shape[2], weight_shape[3]];
    let mut out_hw = [0usize; 2];
    for axis in 0..2 {
        let padded = input_shape[2 + axis] + 2 * params.padding[axis];
        let span = params.dilation[axis] * (kernel[axis].saturating_sub(1)) + 1;
        if kernel[axis] == 0 || padded < span {
            return Err(invalid(
                op,
                format!(
                    "kernel span {span} larger than padded input {padded} on axis {axis}"
                ),
            ));
        }
        out_hw[axis] = (padded - span) / params.stride[axis] + 1;
    }
    Ok(Geometry {
        batch,
        groups: params.groups,
        x_channels: channels,
        x_hw: [input_shape[2], input_shape[3]],
        y_channels: out_channels,
        y_hw: out_hw,
        kernel,
        stride: params.stride,
        padding: params.padding,
        dilation: params.dilation,
    })
}

fn add_bias(
    op: &'static str,
    out: &mut [f32],
    bias: Option<&[f32]>,
    channels: usize,
    plane: usize,
) -> Result<(), KernelError> {
    let Some(bias) = bias else {
        return Ok(());
    };
    ensure_len(op, bias, &[channels])?;
    for (position, slot) in out.iter_mut().enumerate() {
        *slot += bias[(position / plane.max(1)) % channels.max(1)];
    }
    Ok(())
}

fn bias_grad(grad: &[f32], channels: usize, plane: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; channels];
    for (position, g) in grad.iter().enumerate() {
        out[(position / plane.max(1)) % channels.max(1)] += g;
    }
    out
}

/// 2-d cross-correlation over `[N, C, H, W]` with weight `[O, C / groups, kH, kW]`.
pub fn conv2d(
    input: &[f32],
    input_shape: &[usize],
    weight: &[f32],
    weight_shape: &[usize],
    bias: Option<&[f32]>,
    params: &Conv2dParams,
) -> Result<(Vec<f32>, Vec<usize>), KernelError> {
    let geometry = conv2d_geometry(input_shape, weight_shape, params)?;
    ensure_len("conv2d", input, input_shape)?;
    ensure_len("conv2d", weight, weight_shape)?;
    let mut out = vec![0.0f32; geometry.y_len()];
    geometry.visit(|x, y, w| out[y] += input[x] * weight[w]);
    let plane = geometry.y_hw[0] * geometry.y_hw[1];
    add_bias("conv2d", &mut out, bias, geometry.y_channels, plane)?;
    let shape = vec![
        geometry.batch,
        geometry.y_channels,
        geometry.y_hw[0],
        geometry.y_hw[1],
    ];
    Ok((out, shape))
}

/// Gradients with respect to input, weight and bias.
pub fn conv2d_backward(
    grad: &[f32],
    input: &[f32],
    input_shape: &[usize],
    weight: &[f32],
    weight_shape: &[usize],
    params: &Conv2dParams,
) -> Result<(Vec<f32>, Vec<f32>, Vec<f32>), KernelError> {
    let geometry = conv2d_geometry(input_shape, weight_shape, params)?;
    if grad.len() != geometry.y_len() {
        return Err(KernelError::LengthMismatch {
            op: "conv2d_backward",
            expected: geometry.y_len(),
            actual: grad.len(),
        });
    }
    let mut grad_input = vec![0.0f32; geometry.x_len()];
    let mut grad_weight = vec![0.0f32; geometry.w_len()];
    geometry.visit(|x, y, w| {
        grad_input[x] += grad[y] * weight[w];
        grad_weight[w] += grad[y] * input[x];
    });
    let plane = geometry.y_hw[0] * geometry.y_hw[1];
    let grad_bias = bias_grad(grad, geometry.y_channels, plane);
    Ok((grad_input, grad_weight, grad_bias))
}

fn conv_transpose2d_geometry(
    input_shape: &[usize],
    weight_shape: &[usize],
    params: &ConvTranspose2dParams,
) -> Result<Geometry, KernelError> {
    let op = "conv_transpose2d";
    check_common(
        op,
        input_shape,
        weight_shape,
        params.stride,
        params.dilation,
        params.groups,
    )?;
    let (batch, channels) = (input_shape[0], input_shape[1]);
    if weight_shape[0] != channels || channels % params.groups != 0 {
        return Err(KernelError::ShapeMismatch {
            op,
            lhs: input_shape.to_vec(),
            rhs: weight_shape.to_vec(),
        });
    }
    let out_channels = weight_shape[1] * params.groups;
    let kernel = [weight_shape[2], weight_shape[3]];
    let mut out_hw = [0usize; 2];
    for axis in 0..2 {
        let output_padding = params.output_padding[axis];
        if output_padding >= params.stride[axis] && output_padding >= params.dilation[axis] {
            return Err(invalid(
                op,
                "output_padding must be smaller than either stride or dilation",
            ));
        }
        let full = (input_shape[2 + axis].saturating_sub(1)) * params.stride[axis]
            + params.dilation[axis] * kernel[axis].saturating_sub(1)
            + output_padding
            + 1;
        let trimmed = 2 * params.padding[axis];
        if kernel[axis] == 0 || input_shape[2 + axis] == 0 || full <= trimmed {
            return Err(invalid(op, format!("empty output on axis {axis}")));
        }
        out_hw[axis] = full - trimmed;
    }
    // The transposed conv is the adjoint of a conv from its output back to its
    // input, so the geometry is expressed with the roles swapped.
    Ok(Geometry {
        batch,
        groups: params.groups,
        x_channels: out_channels,
        x_hw: out_hw,
        y_channels: channels,
        y_hw: [input_shape[2], input_shape[3]],
        kernel,
        stride: params.stride,
        padding: params.padding,
        dilation: params.dilation,
    })
}

/// Transposed 2-d convolution over `[N, C, H, W]` with weight
/// `[C, O / groups, kH, kW]`.
pub fn conv_transpose2d(
    input: &[f32],
    input_shape: &[usize],
    weight: &[f32],
    weight_shape: &[usize],
    bias: Option<&[f32]>,
    params: &ConvTranspose2dParams,
) -> Result<(Vec<f32>, Vec<usize>), KernelError> {
    let geometry = conv_transpose2d_geometry(input_shape, weight_shape, params)?;
    ensure_len("conv_transpose2d", input, input_shape)?;
    ensure_len("conv_transpose2d", weight, weight_shape)?;
    let mut out = vec![0.0f32; geometry.x_len()];
    geometry.visit(|x, y, w| out[x] += input[y] * weight[w]);
    let plane = geometry.x_hw[0] * geometry.x_hw[1];
    add_bias("conv_transpose2d", &mut out, bias, geometry.x_channels, plane)?;
    let shape = vec![
        geometry.batch,
        geometry.x_channels,
        geometry.x_hw[0],
        geometry.x_hw[1],
    ];
    Ok((out, shape))
}

pub fn conv_transpose2d_backward(
    grad: &[f32],
    input: &[f32],
    input_shape: &[usize],
    weight: &[f32],
    weight_shape: &[usize],
    params: &ConvTranspose2dParams,
) -> Result<(Vec<f32>, Vec<f32>, Vec<f32>), KernelError> {
    let geometry = conv_transpose2d_geometry(input_shape, weight_shape, params)?;
    if grad.len() != geometry.x_len() {
        return Err(KernelError::LengthMismatch {
            op: "conv_transpose2d_backward",
            expected: geometry.x_len(),
            actual: grad.len(),
        });
    }
    let mut grad_input = vec![0.0f32; geometry.y_len()];
    let mut grad_weight = vec![0.0f32; geometry.w_len()];
    geometry.visit(|x, y, w| {
        grad_input[y] += grad[x] * weight[w];
        grad_weight[w] += grad[x] * input[y];
    });
    let plane = geometry.x_hw[0] * geometry.x_hw[1];
    let grad_bias = bias_grad(grad, geometry.x_channels, plane);
    Ok((grad_input, grad_weight, grad_bias))
}

#[cfg(test)]
mod tests {
    use super::{
        Conv2dParams, ConvTranspose2dParams, conv_transpose2d, conv_transpose2d_backward, conv2d,
        conv2d_backward,
    };
    use crate::test_support::{assert_close, numeric_grad, ramp};

    #[test]
    fn identity_kernel_copies_input() {
        let input = ramp(9, 1.0);
        let (out, shape) = conv2d(
            &input,
            &[1, 1, 3, 3],
            &[1.0],
            &[1, 1, 1, 1],
            Some(&[0.5][..]),
            &Conv2dParams::default(),
        )
        .expect("conv");
        assert_eq!(shape, vec![1, 1, 3, 3]);
        let expected: Vec<f32> = input.iter().map(|v| v + 0.5).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn strided_padded_dilated_output_shape() {
        let params = Conv2dParams {
            stride: [2, 2],
            padding: [1, 1],
            dilation: [2, 1],
            groups: 1,
        };
        let input = ramp(2 * 3 * 10 * 10, 0.01);
        let weight = ramp(4 * 3 * 3 * 3, 0.02);
        let (_, shape) =
            conv2d(&input, &[2, 3, 10, 10], &weight, &[4, 3, 3, 3], None, &params).expect("conv");
        // (10 + 2 - 2*2 - 1) / 2 + 1 = 4 and (10 + 2 - 2 - 1) / 2 + 1 = 5
        assert_eq!(shape, vec![2, 4, 4, 5]);
    }

    #[test]
    fn grouped_conv_checks_channels() {
        let params = Conv2dParams {
            groups: 2,
            ..Conv2dParams::default()
        };
        let err = conv2d(&[0.0; 27], &[1, 3, 3, 3], &[0.0; 4], &[4, 1, 1, 1], None, &params)
            .expect_err("3 channels cannot split into 2 groups");
        assert!(err.to_string().contains("divisible"));
    }

    #[test]
    fn conv2d_gradients_match_finite_difference() {
        let params = Conv2dParams {
            stride: [2, 1],
            padding: [1, 0],
            dilation: [1, 1],
            groups: 2,
        };
        let input_shape = [1, 2, 4, 3];
        let weight_shape = [2, 1, 2, 2];
        let input = ramp(24, 0.1);
        let weight = ramp(8, 0.2);
        let (out, _) =
            conv2d(&input, &input_shape, &weight, &weight_shape, None, &params).expect("conv");
        let g = ramp(out.len(), 0.05);
        let (gi, gw, gb) =
            conv2d_backward(&g, &input, &input_shape, &weight, &weight_shape, &params)
                .expect("grad");
        let ni = numeric_grad(&input, &g, |x| {
            conv2d(x, &input_shape, &weight, &weight_shape, None, &params)
                .expect("conv")
                .0
        });
        let nw = numeric_grad(&weight, &g, |w| {
            conv2d(&input, &input_shape, w, &weight_shape, None, &params)
                .expect("conv")
                .0
        });
        assert_close(&gi, &ni, 1e-2);
        assert_close(&gw, &nw, 1e-2);
        assert_eq!(gb.len(), 2);
    }

    #[test]
    fn transposed_conv_upsamples() {
        let params = ConvTranspose2dParams {
            stride: [2, 2],
            padding: [1, 1],
            output_padding: [1, 1],
            dilation: [1, 1],
            groups: 1,
        };
        let input = ramp(2 * 3 * 4 * 4, 0.1);
        let weight = ramp(3 * 5 * 3 * 3, 0.1);
        let (out, shape) = conv_transpose2d(
            &input,
            &[2, 3, 4, 4],
            &weight,
            &[3, 5, 3, 3],
            Some(&[0.0; 5][..]),
            &params,
        )
        .expect("deconv");
        // (4 - 1) * 2 - 2 + 2 + 1 + 1 = 8
        assert_eq!(shape, vec![2, 5, 8, 8]);
        assert_eq!(out.len(), 2 * 5 * 64);
    }

    #[test]
    fn transposed_conv_is_adjoint_of_conv() {
        let conv_params = Conv2dParams {
            stride: [2, 2],
            ..Conv2dParams::default()
        };
        let deconv_params = ConvTranspose2dParams {
            stride: [2, 2],
            ..ConvTranspose2dParams::default()
        };
        let x = ramp(25, 0.1);
        let w = ramp(4, 0.3);
        let (y, y_shape) = conv2d(&x, &[1, 1, 5, 5], &w, &[1, 1, 2, 2], None, &conv_params)
            .expect("conv");
        let z = ramp(y.len(), 0.2);
        let (back, back_shape) =
            conv_transpose2d(&z, &y_shape, &w, &[1, 1, 2, 2], None, &deconv_params)
                .expect("deconv");
        assert_eq!(back_shape, vec![1, 1, 4, 4]);
        // <conv(x), z> == <x, conv_transpose(z)> over the covered region.
        let lhs: f32 = y.iter().zip(&z).map(|(a, b)| a * b).sum();
        let rhs: f32 = (0..4)
            .flat_map(|r| (0..4).map(move |c| (r, c)))
            .map(|(r, c)| x[r * 5 + c] * back[r * 4 + c])
            .sum();
        assert!((lhs - rhs).abs() < 1e-3);
    }

    #[test]
    fn transposed_conv_gradients_match_finite_difference() {
        let params = ConvTranspose2dParams {
            stride: [2, 1],
            padding: [0, 1],
            output_padding: [1, 0],
            dilation: [1, 1],
            groups: 1,
        };
        let input_shape = [1, 2, 2, 3];
        let weight_shape = [2, 1, 2, 3];
        let input = ramp(12, 0.1);
        let weight = ramp(12, 0.2);
        let (out, _) =
            conv_transpose2d(&input, &input_shape, &weight, &weight_shape, None, &params)
                .expect("deconv");
        let g = ramp(out.len(), 0.05);
        let (gi, gw, _) =
            conv_transpose2d_backward(&g, &input, &input_shape, &weight, &weight_shape, &params)
                .expect("grad");
        let ni = numeric_grad(&input, &g, |x| {
            conv_transpose2d(x, &input_shape, &weight, &weight_shape, None, &params)
                .expect("deconv")
                .0
        });
        let nw = numeric_grad(&weight, &g, |w| {
            conv_transpose2d(&input, &input_shape, w, &weight_shape, None, &params)
                .expect("deconv")
                .0
        });
        assert_close(&gi, &ni, 1e-2);
        assert_close(&gw, &nw, 1e-2);
    }

    #[test]
    fn output_padding_must_be_smaller_than_stride_or_dilation() {
        let params = ConvTranspose2dParams {
            output_padding: [1, 0],
            ..ConvTranspose2dParams::default()
        };
        assert!(
            conv_transpose2d(&[0.0; 4], &[1, 1, 2, 2], &[0.0; 4], &[1, 1, 2, 2], None, &params)
                .is_err()
        );
    }
}
