use crate::{KernelError, ensure_len, invalid};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormParams {
    pub training: bool,
    pub momentum: f32,
    pub eps: f32,
}

impl Default for BatchNormParams {
    fn default() -> Self {
        Self {
            training: true,
            momentum: 0.1,
            eps: 1e-5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormOutput {
    pub output: Vec<f32>,
    /// Per-channel mean used for normalization.
    pub save_mean: Vec<f32>,
    /// Per-channel `1 / sqrt(var + eps)` used for normalization.
    pub save_invstd: Vec<f32>,
}

struct ChannelLayout {
    batch: usize,
    channels: usize,
    plane: usize,
}

impl ChannelLayout {
    fn new(shape: &[usize]) -> Result<Self, KernelError> {
        if shape.len() < 2 {
            return Err(KernelError::RankMismatch {
                op: "batch_norm",
                expected: 2,
                actual: shape.len(),
            });
        }
        Ok(Self {
            batch: shape[0],
            channels: shape[1],
            plane: shape[2..].iter().product(),
        })
    }

    fn count(&self) -> usize {
        self.batch * self.plane
    }

    fn for_channel(&self, c: usize, mut f: impl FnMut(usize)) {
        for n in 0..self.batch {
            let base = (n * self.channels + c) * self.plane;
            for i in 0..self.plane {
                f(base + i);
            }
        }
    }
}

fn optional_param(
    name: &str,
    values: Option<&[f32]>,
    channels: usize,
) -> Result<(), KernelError> {
    match values {
        Some(values) if values.len() != channels => Err(invalid(
            "batch_norm",
            format!("{name} has {} entries for {channels} channels", values.len()),
        )),
        _ => Ok(()),
    }
}

/// Batch normalization over dim 1 of `[N, C, *]`.
///
/// Training normalizes with the biased batch variance and folds the unbiased
/// variance into the running estimate. Evaluation requires running stats.
pub fn batch_norm(
    input: &[f32],
    shape: &[usize],
    weight: Option<&[f32]>,
    bias: Option<&[f32]>,
    running_mean: Option<&mut [f32]>,
    running_var: Option<&mut [f32]>,
    params: &BatchNormParams,
) -> Result<BatchNormOutput, KernelError> {
    ensure_len("batch_norm", input, shape)?;
    let layout = ChannelLayout::new(shape)?;
    let channels = layout.channels;
    optional_param("weight", weight, channels)?;
    optional_param("bias", bias, channels)?;
    optional_param("running_mean", running_mean.as_deref(), channels)?;
    optional_param("running_var", running_var.as_deref(), channels)?;

    let mut save_mean = vec![0.0f32; channels];
    let mut save_invstd = vec![0.0f32; channels];
    if params.training {
        let count = layout.count();
        if count <= 1 {
            return Err(invalid(
                "batch_norm",
                format!("expected more than 1 value per channel when training, got {count}"),
            ));
        }
        let mut batch_var = vec![0.0f32; channels];
        for c in 0..channels {
            let mut total = 0.0f32;
            layout.for_channel(c, |i| total += input[i]);
            let mean = total / count as f32;
            let mut squares = 0.0f32;
            layout.for_channel(c, |i| {
                let d = input[i] - mean;
                squares += d * d;
            });
            save_mean[c] = mean;
            batch_var[c] = squares / count as f32;
            save_invstd[c] = 1.0 / (batch_var[c] + params.eps).sqrt();
        }
        let unbias = count as f32 / (count - 1) as f32;
        if let Some(running_mean) = running_mean {
            for (slot, mean) in running_mean.iter_mut().zip(&save_mean) {
                *slot = (1.0 - params.momentum) * *slot + params.momentum * mean;
            }
        }
        if let Some(running_var) = running_var {
            for (slot, var) in running_var.iter_mut().zip(&batch_var) {
                *slot = (1.0 - params.momentum) * *slot + params.momentum * var * unbias;
            }
        }
    } else {
        let (Some(running_mean), Some(running_var)) = (running_mean, running_var) else {
            return Err(invalid(
                "batch_norm",
                "running_mean and running_var are required in evaluation",
            ));
        };
        save_mean.copy_from_slice(running_mean);
        for (slot, var) in save_invstd.iter_mut().zip(running_var.iter()) {
            *slot = 1.0 / (var + params.eps).sqrt();
        }
    }

    let mut output = vec![0.0f32; input.len()];
    for c in 0..channels {
        let scale = weight.map_or(1.0, |w| w[c]);
        let shift = bias.map_or(0.0, |b| b[c]);
        let (mean, invstd) = (save_mean[c], save_invstd[c]);
        layout.for_channel(c, |i| {
            output[i] = (input[i] - mean) * invstd * scale + shift;
        });
    }
    Ok(BatchNormOutput {
        output,
        save_mean,
        save_invstd,
    })
}

/// Gradients with respect to input, weight and bias. `save_mean` and
/// `save_invstd` come from the forward pass.
pub fn batch_norm_backward(
    grad: &[f32],
    input: &[f32],
    shape: &[usize],
    weight: Option<&[f32]>,
    save_mean: &[f32],
    save_invstd: &[f32],
    training: bool,
) -> Result<(Vec<f32>, Vec<f32>, Vec<f32>), KernelError> {
    ensure_len("batch_norm_backward", input, shape)?;
    ensure_len("batch_norm_backward", grad, shape)?;
    let layout = ChannelLayout::new(shape)?;
    let channels = layout.channels;
    optional_param("weight", weight, channels)?;
    optional_param("save_mean", Some(save_mean), channels)?;
    optional_param("save_invstd", Some(save_invstd), channels)?;

    let count = layout.count() as f32;
    let mut grad_input = vec![0.0f32; input.len()];
    let mut grad_weight = vec![0.0f32; channels];
    let mut grad_bias = vec![0.0f32; channels];
    for c in 0..channels {
        let (mean, invstd) = (save_mean[c], save_invstd[c]);
        let scale = weight.map_or(1.0, |w| w[c]);
        let mut sum_g = 0.0f32;
        let mut sum_g_xhat = 0.0f32;
        layout.for_channel(c, |i| {
            let xhat = (input[i] - mean) * invstd;
            sum_g += grad[i];
            sum_g_xhat += grad[i] * xhat;
        });
        grad_bias[c] = sum_g;
        grad_weight[c] = sum_g_xhat;
        layout.for_channel(c, |i| {
            grad_input[i] = if training {
                let xhat = (input[i] - mean) * invstd;
                scale * invstd / count * (count * grad[i] - sum_g - xhat * sum_g_xhat)
            } else {
                grad[i] * scale * invstd
            };
        });
    }
    Ok((grad_input, grad_weight, grad_bias))
}

#[cfg(test)]
mod tests {
    use super::{BatchNormParams, batch_norm, batch_norm_backward};
    use crate::test_support::{assert_close, numeric_grad, ramp};

    #[test]
    fn training_normalizes_and_updates_running_stats() {
        let input = vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0];
        let shape = [2, 2, 2];
        let mut running_mean = vec![0.0; 2];
        let mut running_var = vec![1.0; 2];
        let out = batch_norm(
            &input,
            &shape,
            None,
            None,
            Some(running_mean.as_mut_slice()),
            Some(running_var.as_mut_slice()),
            &BatchNormParams::default(),
        )
        .expect("bn");
        // channel 0 holds {1, 2, 10, 20}
        assert_close(&out.save_mean, &[8.25, 19.25], 1e-6);
        let mean_out: f32 = [0usize, 1, 4, 5].iter().map(|&i| out.output[i]).sum();
        assert!(mean_out.abs() < 1e-4);
        assert_close(&running_mean, &[0.825, 1.925], 1e-6);
        let biased: f32 = [1.0f32, 2.0, 10.0, 20.0]
            .iter()
            .map(|v| (v - 8.25) * (v - 8.25))
            .sum::<f32>()
            / 4.0;
        assert_close(&running_var[..1], &[0.9 + 0.1 * biased * 4.0 / 3.0], 1e-5);
    }

    #[test]
    fn evaluation_uses_running_stats() {
        let mut running_mean = vec![1.0];
        let mut running_var = vec![4.0];
        let params = BatchNormParams {
            training: false,
            momentum: 0.1,
            eps: 0.0,
        };
        let out = batch_norm(
            &[3.0, 5.0],
            &[2, 1],
            Some(&[2.0][..]),
            Some(&[1.0][..]),
            Some(running_mean.as_mut_slice()),
            Some(running_var.as_mut_slice()),
            &params,
        )
        .expect("bn");
        assert_close(&out.output, &[3.0, 5.0], 1e-6);
        assert_eq!(running_mean, vec![1.0]);
        assert!(
            batch_norm(&[1.0, 2.0], &[2, 1], None, None, None, None, &params).is_err()
        );
    }

    #[test]
    fn training_rejects_single_value_channels() {
        let err = batch_norm(
            &[1.0, 2.0],
            &[1, 2],
            None,
            None,
            None,
            None,
            &BatchNormParams::default(),
        )
        .expect_err("one value per channel");
        assert!(err.to_string().contains("more than 1 value"));
    }

    #[test]
    fn training_gradients_match_finite_difference() {
        let shape = [3, 2, 2];
        let input = ramp(12, 0.4);
        let weight = [1.5, -0.5];
        let bias = [0.1, 0.2];
        let params = BatchNormParams::default();
        let forward = |x: &[f32]| {
            batch_norm(x, &shape, Some(&weight[..]), Some(&bias[..]), None, None, &params)
                .expect("bn")
        };
        let out = forward(&input);
        let g = ramp(12, 0.07);
        let (gi, gw, gb) = batch_norm_backward(
            &g,
            &input,
            &shape,
            Some(&weight[..]),
            &out.save_mean,
            &out.save_invstd,
            true,
        )
        .expect("grad");
        let numeric = numeric_grad(&input, &g, |x| forward(x).output);
        assert_close(&gi, &numeric, 3e-2);
        assert_eq!(gw.len(), 2);
        let total: f32 = g.iter().sum();
        assert!((gb.iter().sum::<f32>() - total).abs() < 1e-5);
    }
}
