#![forbid(unsafe_code)]

//! Layer modules over the autograd tape.
//!
//! A module owns its parameters and buffers as tensors. Every forward pass
//! binds the parameters to leaves of the caller's tape, so reorders applied
//! by the interceptor land in the module's own storage and persist across
//! iterations.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use bfmix_autograd::{AutogradError, BackwardReport, NodeId, Tape};
use bfmix_core::{DType, Device, Tensor, TensorError};
use bfmix_device::DeviceError;
use bfmix_kernel_cpu::{BatchNormParams, Conv2dParams, ConvTranspose2dParams, PoolParams};
use bfmix_serialize::{DecodeMode, SerializeError};

#[derive(Debug, Clone, PartialEq)]
pub enum ModuleError {
    InvalidConfig {
        layer: &'static str,
        reason: String,
    },
    Autograd(AutogradError),
    Device(DeviceError),
    Tensor(TensorError),
    Serialize(SerializeError),
    MissingKey(String),
    UnexpectedKey(String),
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { layer, reason } => write!(f, "{layer}: {reason}"),
            Self::Autograd(error) => write!(f, "{error}"),
            Self::Device(error) => write!(f, "{error}"),
            Self::Tensor(error) => write!(f, "{error}"),
            Self::Serialize(error) => write!(f, "{error}"),
            Self::MissingKey(name) => write!(f, "missing state-dict key '{name}'"),
            Self::UnexpectedKey(name) => write!(f, "unexpected state-dict key '{name}'"),
            Self::ShapeMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "state-dict entry '{name}' has shape {actual:?}, module expects {expected:?}"
            ),
        }
    }
}

impl std::error::Error for ModuleError {}

impl From<AutogradError> for ModuleError {
    fn from(value: AutogradError) -> Self {
        Self::Autograd(value)
    }
}

impl From<DeviceError> for ModuleError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

impl From<TensorError> for ModuleError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

impl From<SerializeError> for ModuleError {
    fn from(value: SerializeError) -> Self {
        Self::Serialize(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Trainable, receives gradients.
    Parameter,
    /// Trainable normalization scale or shift. Stays full precision when the
    /// module is cast.
    NormParameter,
    /// State such as running statistics. Never cast with the parameters.
    Buffer,
}

impl Slot {
    #[must_use]
    pub const fn is_trainable(self) -> bool {
        matches!(self, Self::Parameter | Self::NormParameter)
    }

    /// Whether a module dtype cast applies to tensors in this slot.
    #[must_use]
    pub const fn follows_module_dtype(self) -> bool {
        matches!(self, Self::Parameter)
    }
}

/// Trait for neural network modules.
pub trait Module {
    /// Records the forward computation on `tape`, returning the output node.
    fn forward(&self, tape: &mut Tape, input: NodeId) -> Result<NodeId, ModuleError>;

    /// Parameters and buffers by dotted name.
    fn named_tensors(&self) -> Vec<(String, Slot, &Tensor)> {
        Vec::new()
    }

    fn named_tensors_mut(&mut self) -> Vec<(String, Slot, &mut Tensor)> {
        Vec::new()
    }

    fn set_training(&mut self, _training: bool) {}
}

/// Parameter tensors of `module` in declaration order.
pub fn parameters<M: Module + ?Sized>(module: &M) -> Vec<(String, &Tensor)> {
    module
        .named_tensors()
        .into_iter()
        .filter(|(_, slot, _)| slot.is_trainable())
        .map(|(name, _, tensor)| (name, tensor))
        .collect()
}

/// Aliases of every parameter and buffer, keyed by name.
pub fn state_dict<M: Module + ?Sized>(module: &M) -> BTreeMap<String, Tensor> {
    module
        .named_tensors()
        .into_iter()
        .map(|(name, _, tensor)| (name, tensor.clone()))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

/// Copies `state` into the module's existing storage. Values are written
/// through the destination's representation, so an engine-managed
/// parameter stays managed. With `strict`, missing or unexpected keys fail
/// before anything is written.
pub fn load_state_dict<M: Module + ?Sized>(
    module: &mut M,
    state: &BTreeMap<String, Tensor>,
    strict: bool,
) -> Result<LoadReport, ModuleError> {
    let mut report = LoadReport::default();
    let targets = module.named_tensors_mut();
    for (name, _, _) in &targets {
        if !state.contains_key(name) {
            report.missing.push(name.clone());
        }
    }
    for name in state.keys() {
        if !targets.iter().any(|(target, _, _)| target == name) {
            report.unexpected.push(name.clone());
        }
    }
    if strict {
        if let Some(name) = report.missing.first() {
            return Err(ModuleError::MissingKey(name.clone()));
        }
        if let Some(name) = report.unexpected.first() {
            return Err(ModuleError::UnexpectedKey(name.clone()));
        }
    }
    for (name, _, target) in &targets {
        let Some(source) = state.get(name) else {
            continue;
        };
        if source.shape() != target.shape() {
            return Err(ModuleError::ShapeMismatch {
                name: name.clone(),
                expected: target.shape().to_vec(),
                actual: source.shape().to_vec(),
            });
        }
    }
    for (name, _, target) in targets {
        if let Some(source) = state.get(&name) {
            target.write_logical(&source.gather_f32())?;
            report.loaded.push(name);
        }
    }
    tracing::debug!(
        target: "bfmix::nn",
        loaded = report.loaded.len(),
        missing = report.missing.len(),
        unexpected = report.unexpected.len(),
        "state dict loaded"
    );
    Ok(report)
}

pub fn save<M: Module + ?Sized>(module: &M, path: impl AsRef<Path>) -> Result<(), ModuleError> {
    bfmix_serialize::save_state_dict(&state_dict(module), path)?;
    Ok(())
}

pub fn load<M: Module + ?Sized>(
    module: &mut M,
    path: impl AsRef<Path>,
) -> Result<LoadReport, ModuleError> {
    let state = bfmix_serialize::load_state_dict(path, DecodeMode::Strict)?;
    load_state_dict(module, &state, true)
}

/// Casts every parameter to `dtype` (manual mixed precision). Buffers and
/// normalization scale/shift keep their dtype.
pub fn to_dtype<M: Module + ?Sized>(module: &mut M, dtype: DType) -> Result<(), ModuleError> {
    for (_, slot, tensor) in module.named_tensors_mut() {
        if slot.follows_module_dtype() {
            *tensor = bfmix_device::to_dtype(tensor, dtype)?;
        }
    }
    Ok(())
}

pub fn to_device<M: Module + ?Sized>(module: &mut M, device: Device) -> Result<(), ModuleError> {
    for (_, _, tensor) in module.named_tensors_mut() {
        *tensor = bfmix_device::to_device(tensor, device)?;
    }
    Ok(())
}

/// Gradients of the module's parameters from a backward run over `tape`.
/// Parameters the forward pass never read are absent.
pub fn gradients<M: Module + ?Sized>(
    module: &M,
    tape: &Tape,
    report: &BackwardReport,
) -> BTreeMap<String, Tensor> {
    parameters(module)
        .into_iter()
        .filter_map(|(name, tensor)| {
            let node = tape.leaf_for(tensor)?;
            report.gradient(node).map(|grad| (name, grad.clone()))
        })
        .collect()
}

/// Deterministic `U(-bound, bound)` initialization.
fn uniform(shape: Vec<usize>, bound: f32, seed: u64, device: Device) -> Result<Tensor, ModuleError> {
    let numel: usize = shape.iter().product();
    let mut state = seed | 1;
    let values: Vec<f32> = (0..numel)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            let unit = (state >> 40) as f32 / (1u64 << 24) as f32;
            (2.0 * unit - 1.0) * bound
        })
        .collect();
    Ok(Tensor::new(&values, shape, DType::F32, device)?.with_requires_grad(true))
}

fn init_seed(layer: &str, dims: &[usize]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    let bytes = layer
        .bytes()
        .chain(dims.iter().flat_map(|dim| (*dim as u64).to_le_bytes()));
    for byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn filled(len: usize, value: f32, device: Device, trainable: bool) -> Result<Tensor, ModuleError> {
    Ok(Tensor::full(vec![len], value, DType::F32, device)?.with_requires_grad(trainable))
}

fn require_positive(layer: &'static str, what: &str, value: usize) -> Result<(), ModuleError> {
    if value == 0 {
        return Err(ModuleError::InvalidConfig {
            layer,
            reason: format!("{what} must be > 0"),
        });
    }
    Ok(())
}

fn weight_and_bias<'a>(
    weight: &'a Tensor,
    bias: Option<&'a Tensor>,
) -> Vec<(String, Slot, &'a Tensor)> {
    let mut out = vec![("weight".to_string(), Slot::Parameter, weight)];
    if let Some(bias) = bias {
        out.push(("bias".to_string(), Slot::Parameter, bias));
    }
    out
}

fn weight_and_bias_mut<'a>(
    weight: &'a mut Tensor,
    bias: Option<&'a mut Tensor>,
) -> Vec<(String, Slot, &'a mut Tensor)> {
    let mut out = vec![("weight".to_string(), Slot::Parameter, weight)];
    if let Some(bias) = bias {
        out.push(("bias".to_string(), Slot::Parameter, bias));
    }
    out
}

/// Fully connected layer: `input @ weight^T + bias`, weight `[out, in]`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    pub fn new(
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        device: Device,
    ) -> Result<Self, ModuleError> {
        require_positive("linear", "in_features", in_features)?;
        require_positive("linear", "out_features", out_features)?;
        let bound = 1.0 / (in_features as f32).sqrt();
        let seed = init_seed("linear", &[out_features, in_features]);
        let weight = uniform(vec![out_features, in_features], bound, seed, device)?;
        let bias = if use_bias {
            Some(uniform(vec![out_features], bound, seed ^ 0xb1a5, device)?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    #[must_use]
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    #[must_use]
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}

impl Module for Linear {
    fn forward(&self, tape: &mut Tape, input: NodeId) -> Result<NodeId, ModuleError> {
        let weight = tape.parameter(&self.weight);
        let bias = self.bias.as_ref().map(|bias| tape.parameter(bias));
        Ok(tape.linear(input, weight, bias)?.0)
    }

    fn named_tensors(&self) -> Vec<(String, Slot, &Tensor)> {
        weight_and_bias(&self.weight, self.bias.as_ref())
    }

    fn named_tensors_mut(&mut self) -> Vec<(String, Slot, &mut Tensor)> {
        weight_and_bias_mut(&mut self.weight, self.bias.as_mut())
    }
}

/// 2-d convolution, weight `[out, in / groups, kH, kW]`.
#[derive(Debug, Clone)]
pub struct Conv2d {
    weight: Tensor,
    bias: Option<Tensor>,
    params: Conv2dParams,
}

impl Conv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: [usize; 2],
        params: Conv2dParams,
        use_bias: bool,
        device: Device,
    ) -> Result<Self, ModuleError> {
        require_positive("conv2d", "groups", params.groups)?;
        if in_channels % params.groups != 0 || out_channels % params.groups != 0 {
            return Err(ModuleError::InvalidConfig {
                layer: "conv2d",
                reason: format!(
                    "channels {in_channels}->{out_channels} not divisible by groups {}",
                    params.groups
                ),
            });
        }
        let per_group = in_channels / params.groups;
        require_positive("conv2d", "in_channels / groups", per_group)?;
        let shape = vec![out_channels, per_group, kernel_size[0], kernel_size[1]];
        let fan_in = per_group * kernel_size[0] * kernel_size[1];
        require_positive("conv2d", "kernel volume", fan_in)?;
        let bound = 1.0 / (fan_in as f32).sqrt();
        let seed = init_seed("conv2d", &shape);
        let weight = uniform(shape, bound, seed, device)?;
        let bias = if use_bias {
            Some(uniform(vec![out_channels], bound, seed ^ 0xb1a5, device)?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            params,
        })
    }

    #[must_use]
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

impl Module for Conv2d {
    fn forward(&self, tape: &mut Tape, input: NodeId) -> Result<NodeId, ModuleError> {
        let weight = tape.parameter(&self.weight);
        let bias = self.bias.as_ref().map(|bias| tape.parameter(bias));
        Ok(tape.conv2d(input, weight, bias, &self.params)?.0)
    }

    fn named_tensors(&self) -> Vec<(String, Slot, &Tensor)> {
        weight_and_bias(&self.weight, self.bias.as_ref())
    }

    fn named_tensors_mut(&mut self) -> Vec<(String, Slot, &mut Tensor)> {
        weight_and_bias_mut(&mut self.weight, self.bias.as_mut())
    }
}

/// Transposed 2-d convolution, weight `[in, out / groups, kH, kW]`.
#[derive(Debug, Clone)]
pub struct ConvTranspose2d {
    weight: Tensor,
    bias: Option<Tensor>,
    params: ConvTranspose2dParams,
}

impl ConvTranspose2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: [usize; 2],
        params: ConvTranspose2dParams,
        use_bias: bool,
        device: Device,
    ) -> Result<Self, ModuleError> {
        require_positive("conv_transpose2d", "groups", params.groups)?;
        if in_channels % params.groups != 0 || out_channels % params.groups != 0 {
            return Err(ModuleError::InvalidConfig {
                layer: "conv_transpose2d",
                reason: format!(
                    "channels {in_channels}->{out_channels} not divisible by groups {}",
                    params.groups
                ),
            });
        }
        let per_group = out_channels / params.groups;
        require_positive("conv_transpose2d", "out_channels / groups", per_group)?;
        let shape = vec![in_channels, per_group, kernel_size[0], kernel_size[1]];
        let fan_in = per_group * kernel_size[0] * kernel_size[1];
        require_positive("conv_transpose2d", "kernel volume", fan_in)?;
        let bound = 1.0 / (fan_in as f32).sqrt();
        let seed = init_seed("conv_transpose2d", &shape);
        let weight = uniform(shape, bound, seed, device)?;
        let bias = if use_bias {
            Some(uniform(vec![out_channels], bound, seed ^ 0xb1a5, device)?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            params,
        })
    }
}

impl Module for ConvTranspose2d {
    fn forward(&self, tape: &mut Tape, input: NodeId) -> Result<NodeId, ModuleError> {
        let weight = tape.parameter(&self.weight);
        let bias = self.bias.as_ref().map(|bias| tape.parameter(bias));
        Ok(tape.conv_transpose2d(input, weight, bias, &self.params)?.0)
    }

    fn named_tensors(&self) -> Vec<(String, Slot, &Tensor)> {
        weight_and_bias(&self.weight, self.bias.as_ref())
    }

    fn named_tensors_mut(&mut self) -> Vec<(String, Slot, &mut Tensor)> {
        weight_and_bias_mut(&mut self.weight, self.bias.as_mut())
    }
}

/// Batch normalization over `[N, C, ...]` with 2 or 3 spatial dims.
///
/// Weight (gamma) starts at ones, bias (beta) at zeros, running mean at
/// zeros and running variance at ones. Running statistics are plain f32
/// buffers; the interceptor never reorders them.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    weight: Tensor,
    bias: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
    spatial_rank: usize,
    eps: f32,
    momentum: f32,
    training: bool,
}

impl BatchNorm {
    pub fn new_2d(num_features: usize, device: Device) -> Result<Self, ModuleError> {
        Self::with_rank(num_features, 2, device)
    }

    pub fn new_3d(num_features: usize, device: Device) -> Result<Self, ModuleError> {
        Self::with_rank(num_features, 3, device)
    }

    fn with_rank(num_features: usize, spatial_rank: usize, device: Device) -> Result<Self, ModuleError> {
        require_positive("batch_norm", "num_features", num_features)?;
        let defaults = BatchNormParams::default();
        Ok(Self {
            weight: filled(num_features, 1.0, device, true)?,
            bias: filled(num_features, 0.0, device, true)?,
            running_mean: filled(num_features, 0.0, device, false)?,
            running_var: filled(num_features, 1.0, device, false)?,
            spatial_rank,
            eps: defaults.eps,
            momentum: defaults.momentum,
            training: true,
        })
    }

    #[must_use]
    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    #[must_use]
    pub fn is_training(&self) -> bool {
        self.training
    }

    #[must_use]
    pub fn running_mean(&self) -> &Tensor {
        &self.running_mean
    }

    #[must_use]
    pub fn running_var(&self) -> &Tensor {
        &self.running_var
    }
}

impl Module for BatchNorm {
    fn forward(&self, tape: &mut Tape, input: NodeId) -> Result<NodeId, ModuleError> {
        let rank = tape.tensor(input)?.rank();
        if rank != self.spatial_rank + 2 {
            return Err(ModuleError::InvalidConfig {
                layer: "batch_norm",
                reason: format!(
                    "expected rank {} input, got rank {rank}",
                    self.spatial_rank + 2
                ),
            });
        }
        let weight = tape.parameter(&self.weight);
        let bias = tape.parameter(&self.bias);
        let params = BatchNormParams {
            training: self.training,
            momentum: self.momentum,
            eps: self.eps,
        };
        let (out, _) = tape.batch_norm(
            input,
            Some(weight),
            Some(bias),
            Some(&self.running_mean),
            Some(&self.running_var),
            &params,
        )?;
        Ok(out)
    }

    fn named_tensors(&self) -> Vec<(String, Slot, &Tensor)> {
        vec![
            ("weight".to_string(), Slot::NormParameter, &self.weight),
            ("bias".to_string(), Slot::NormParameter, &self.bias),
            ("running_mean".to_string(), Slot::Buffer, &self.running_mean),
            ("running_var".to_string(), Slot::Buffer, &self.running_var),
        ]
    }

    fn named_tensors_mut(&mut self) -> Vec<(String, Slot, &mut Tensor)> {
        vec![
            ("weight".to_string(), Slot::NormParameter, &mut self.weight),
            ("bias".to_string(), Slot::NormParameter, &mut self.bias),
            ("running_mean".to_string(), Slot::Buffer, &mut self.running_mean),
            ("running_var".to_string(), Slot::Buffer, &mut self.running_var),
        ]
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

/// Max pooling over 2 or 3 spatial dims.
#[derive(Debug, Clone)]
pub struct MaxPool {
    params: PoolParams,
}

impl MaxPool {
    #[must_use]
    pub fn new(params: PoolParams) -> Self {
        Self { params }
    }
}

impl Module for MaxPool {
    fn forward(&self, tape: &mut Tape, input: NodeId) -> Result<NodeId, ModuleError> {
        Ok(tape.max_pool(input, &self.params)?.0)
    }
}

/// Average pooling over 2 or 3 spatial dims.
#[derive(Debug, Clone)]
pub struct AvgPool {
    params: PoolParams,
}

impl AvgPool {
    #[must_use]
    pub fn new(params: PoolParams) -> Self {
        Self { params }
    }
}

impl Module for AvgPool {
    fn forward(&self, tape: &mut Tape, input: NodeId) -> Result<NodeId, ModuleError> {
        Ok(tape.avg_pool(input, &self.params)?.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdaptiveAvgPool2d {
    output_size: [usize; 2],
}

impl AdaptiveAvgPool2d {
    #[must_use]
    pub fn new(output_size: [usize; 2]) -> Self {
        Self { output_size }
    }
}

impl Module for AdaptiveAvgPool2d {
    fn forward(&self, tape: &mut Tape, input: NodeId) -> Result<NodeId, ModuleError> {
        Ok(tape.adaptive_avg_pool2d(input, self.output_size)?.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReLU;

impl Module for ReLU {
    fn forward(&self, tape: &mut Tape, input: NodeId) -> Result<NodeId, ModuleError> {
        Ok(tape.relu(input)?.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GELU;

impl Module for GELU {
    fn forward(&self, tape: &mut Tape, input: NodeId) -> Result<NodeId, ModuleError> {
        Ok(tape.gelu(input)?.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sigmoid;

impl Module for Sigmoid {
    fn forward(&self, tape: &mut Tape, input: NodeId) -> Result<NodeId, ModuleError> {
        Ok(tape.sigmoid(input)?.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Softmax {
    dim: usize,
}

impl Softmax {
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Module for Softmax {
    fn forward(&self, tape: &mut Tape, input: NodeId) -> Result<NodeId, ModuleError> {
        Ok(tape.softmax(input, self.dim)?.0)
    }
}

/// Children run in insertion order; their tensors are named `"{index}.{name}"`.
#[derive(Default)]
pub struct Sequential {
    children: Vec<Box<dyn Module>>,
}

impl Sequential {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, module: Box<dyn Module>) {
        self.children.push(module);
    }

    #[must_use]
    pub fn with(mut self, module: impl Module + 'static) -> Self {
        self.children.push(Box::new(module));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, tape: &mut Tape, input: NodeId) -> Result<NodeId, ModuleError> {
        let mut current = input;
        for child in &self.children {
            current = child.forward(tape, current)?;
        }
        Ok(current)
    }

    fn named_tensors(&self) -> Vec<(String, Slot, &Tensor)> {
        self.children
            .iter()
            .enumerate()
            .flat_map(|(index, child)| {
                child
                    .named_tensors()
                    .into_iter()
                    .map(move |(name, slot, tensor)| (format!("{index}.{name}"), slot, tensor))
            })
            .collect()
    }

    fn named_tensors_mut(&mut self) -> Vec<(String, Slot, &mut Tensor)> {
        self.children
            .iter_mut()
            .enumerate()
            .flat_map(|(index, child)| {
                child
                    .named_tensors_mut()
                    .into_iter()
                    .map(move |(name, slot, tensor)| (format!("{index}.{name}"), slot, tensor))
            })
            .collect()
    }

    fn set_training(&mut self, training: bool) {
        for child in &mut self.children {
            child.set_training(training);
        }
    }
}
