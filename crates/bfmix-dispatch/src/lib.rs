#![forbid(unsafe_code)]

//! Operator dispatch interceptor.
//!
//! Every operator entry point reads the effective mode frame, builds a
//! [`DispatchKeySet`] from the inputs, resolves a [`DispatchPath`] and
//! applies the reorder policy of the operator's class before the reference
//! kernel runs. The output representation follows the primary input.

pub mod keys;
mod ops;

use std::fmt;

use bfmix_core::{
    DType, Device, PhysicalRepr, StorageDescriptor, Tensor, TensorCompatError, TensorError,
};
use bfmix_device::{DeviceError, common_device, to_dtype};
use bfmix_kernel_cpu::KernelError;
use bfmix_reorder::{
    ReorderEngine, ReorderError, ReorderOutcome, conform_second_operand, on_plain_read,
};
use bfmix_runtime::{ModeContext, autocast_target, cached_cast, current};

pub use keys::{DispatchKey, DispatchKeyError, DispatchKeySet};
pub use ops::{
    adaptive_avg_pool2d, add, add_, addbmm, addmm, avg_pool, baddbmm, batch_norm, bmm, bmm_out,
    cat, clone, conv_transpose2d, conv2d, div, gelu, index_select, linear, max_pool, mm, mm_out,
    mul, mul_, narrow, relu, relu_, select, sigmoid, sigmoid_, slice, softmax, sub, sum,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// Reorders activations and weights whenever auto-mix is active.
    Compute,
    /// Reorders its primary input only in inference.
    DataDriven,
    /// The second operand conforms to the first.
    Binary,
    /// No bf16 path.
    FallbackOnly,
    /// Copies values and keeps the source representation.
    DataMovement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Conv2d,
    ConvTranspose2d,
    Linear,
    Mm,
    Bmm,
    Addmm,
    Addbmm,
    Baddbmm,
    BatchNorm,
    AvgPool2d,
    AvgPool3d,
    MaxPool2d,
    MaxPool3d,
    AdaptiveAvgPool2d,
    Relu,
    Gelu,
    Sigmoid,
    Softmax,
    IndexSelect,
    Add,
    Mul,
    Sub,
    Div,
    Sum,
    Clone,
    Cat,
}

impl OpKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Conv2d => "conv2d",
            Self::ConvTranspose2d => "conv_transpose2d",
            Self::Linear => "linear",
            Self::Mm => "mm",
            Self::Bmm => "bmm",
            Self::Addmm => "addmm",
            Self::Addbmm => "addbmm",
            Self::Baddbmm => "baddbmm",
            Self::BatchNorm => "batch_norm",
            Self::AvgPool2d => "avg_pool2d",
            Self::AvgPool3d => "avg_pool3d",
            Self::MaxPool2d => "max_pool2d",
            Self::MaxPool3d => "max_pool3d",
            Self::AdaptiveAvgPool2d => "adaptive_avg_pool2d",
            Self::Relu => "relu",
            Self::Gelu => "gelu",
            Self::Sigmoid => "sigmoid",
            Self::Softmax => "softmax",
            Self::IndexSelect => "index_select",
            Self::Add => "add",
            Self::Mul => "mul",
            Self::Sub => "sub",
            Self::Div => "div",
            Self::Sum => "sum",
            Self::Clone => "clone",
            Self::Cat => "cat",
        }
    }

    #[must_use]
    pub const fn class(self) -> OpClass {
        match self {
            Self::Conv2d
            | Self::ConvTranspose2d
            | Self::Linear
            | Self::Mm
            | Self::Bmm
            | Self::Addmm
            | Self::Addbmm
            | Self::Baddbmm => OpClass::Compute,
            Self::BatchNorm
            | Self::AvgPool2d
            | Self::AvgPool3d
            | Self::MaxPool2d
            | Self::MaxPool3d
            | Self::AdaptiveAvgPool2d
            | Self::Relu
            | Self::Gelu
            | Self::Sigmoid
            | Self::Softmax
            | Self::IndexSelect => OpClass::DataDriven,
            Self::Add | Self::Mul => OpClass::Binary,
            Self::Sub | Self::Div | Self::Sum => OpClass::FallbackOnly,
            Self::Clone | Self::Cat => OpClass::DataMovement,
        }
    }

    #[must_use]
    pub const fn supports_bf16(self) -> bool {
        !matches!(self.class(), OpClass::FallbackOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchPath {
    /// CPU inputs or engine disabled. Inputs are not reordered and the
    /// output inherits the primary input's representation.
    Reference,
    /// Engine on, auto-mix off. Output is engine-managed when bf16.
    ManualPrecision,
    AutoMix,
    /// Auto-mix requested for an operator without a bf16 path.
    Fallback,
}

impl DispatchPath {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::ManualPrecision => "manual_precision",
            Self::AutoMix => "auto_mix",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub path: DispatchPath,
    pub selected_key: DispatchKey,
    pub backend_key: DispatchKey,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchDecision {
    pub op: OpKind,
    pub path: DispatchPath,
    pub mode: ModeContext,
    pub kernel: &'static str,
    pub selected_key: DispatchKey,
    pub backend_key: DispatchKey,
    pub keyset_bits: u64,
    pub fallback_used: bool,
    pub in_place: bool,
    /// Target dtype when autocast cast the inputs.
    pub autocast: Option<DType>,
}

/// Forward state the backward pass needs besides the operands.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Saved {
    #[default]
    None,
    BatchNorm {
        save_mean: Vec<f32>,
        save_invstd: Vec<f32>,
    },
    Argmax(Vec<usize>),
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub tensor: Tensor,
    pub decision: DispatchDecision,
    /// Inputs as the kernel consumed them, after reorders and autocast
    /// casts, in argument order.
    pub operands: Vec<Tensor>,
    pub saved: Saved,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    Kernel(KernelError),
    Key(DispatchKeyError),
    Tensor(TensorError),
    Compat(TensorCompatError),
    Device(DeviceError),
    Reorder(ReorderError),
    InvalidArgument { op: &'static str, detail: String },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel(error) => write!(f, "kernel dispatch failure: {error}"),
            Self::Key(error) => write!(f, "dispatch key failure: {error}"),
            Self::Tensor(error) => write!(f, "tensor failure during dispatch: {error}"),
            Self::Compat(error) => write!(f, "incompatible operands: {error}"),
            Self::Device(error) => write!(f, "device failure during dispatch: {error}"),
            Self::Reorder(error) => write!(f, "reorder failure during dispatch: {error}"),
            Self::InvalidArgument { op, detail } => write!(f, "{op}: {detail}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<KernelError> for DispatchError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<DispatchKeyError> for DispatchError {
    fn from(value: DispatchKeyError) -> Self {
        Self::Key(value)
    }
}

impl From<TensorError> for DispatchError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

impl From<TensorCompatError> for DispatchError {
    fn from(value: TensorCompatError) -> Self {
        Self::Compat(value)
    }
}

impl From<DeviceError> for DispatchError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

impl From<ReorderError> for DispatchError {
    fn from(value: ReorderError) -> Self {
        Self::Reorder(value)
    }
}

#[must_use]
pub fn dispatch_keyset(
    device: Device,
    mode: ModeContext,
    autocast: bool,
    requires_grad: bool,
) -> DispatchKeySet {
    let mut keyset = DispatchKeySet::empty();
    keyset.add(DispatchKey::BackendSelect);
    match device {
        Device::Cpu => keyset.add(DispatchKey::CPU),
        Device::Xpu => {
            keyset.add(DispatchKey::XPU);
            if mode.engine_enabled {
                keyset.add(DispatchKey::EnginePrecision);
            }
            if mode.auto_mix_active() {
                keyset.add(DispatchKey::AutoMixPrecision);
            }
            if autocast {
                keyset.add(DispatchKey::AutocastXPU);
            }
        }
    }
    if requires_grad {
        keyset.add(DispatchKey::Autograd);
    }
    keyset
}

pub fn resolve_route(op: OpKind, keyset: DispatchKeySet) -> Result<Route, DispatchKeyError> {
    keyset.validate()?;
    let selected_key = keyset.highest_priority_type_id()?;
    let backend_key = keyset.highest_priority_backend_type_id()?;
    // Autocast is a cast in front of whatever the remaining keys select.
    let effective = match selected_key {
        DispatchKey::AutocastXPU => keyset
            .without(DispatchKey::AutocastXPU)
            .highest_priority_type_id()?,
        key => key,
    };
    let (path, fallback_used) = match effective {
        DispatchKey::AutoMixPrecision if op.supports_bf16() => (DispatchPath::AutoMix, false),
        DispatchKey::AutoMixPrecision => (DispatchPath::Fallback, true),
        DispatchKey::EnginePrecision => (DispatchPath::ManualPrecision, false),
        DispatchKey::XPU | DispatchKey::CPU => (DispatchPath::Reference, false),
        DispatchKey::BackendSelect => return Err(DispatchKeyError::NoBackendKey),
        DispatchKey::AutocastXPU | DispatchKey::Autograd | DispatchKey::Undefined => {
            return Err(DispatchKeyError::NoTypeKey);
        }
    };
    Ok(Route {
        path,
        selected_key,
        backend_key,
        fallback_used,
    })
}

/// Output representation for a result computed from `primary`.
#[must_use]
pub fn output_descriptor(op: OpKind, path: DispatchPath, primary: StorageDescriptor) -> StorageDescriptor {
    let logical_dtype = primary.logical_dtype;
    match (op.class(), path) {
        (OpClass::DataMovement, _) => primary,
        (OpClass::FallbackOnly, DispatchPath::Reference) => StorageDescriptor::plain(logical_dtype),
        (_, DispatchPath::Reference) => primary,
        (_, DispatchPath::ManualPrecision | DispatchPath::AutoMix) if primary.is_bf16_tagged() => {
            StorageDescriptor {
                physical_repr: PhysicalRepr::BFloat16Plan,
                managed_by_engine: true,
                logical_dtype,
            }
        }
        _ => StorageDescriptor::plain(logical_dtype),
    }
}

fn kernel_name(backend_key: DispatchKey, output: StorageDescriptor) -> &'static str {
    match (backend_key, output.is_bf16_tagged()) {
        (DispatchKey::CPU, _) => "cpu::reference",
        (_, true) => "xpu::bf16",
        (_, false) => "xpu::fp32",
    }
}

fn autocast_cast(tensor: &Tensor, target: DType) -> Result<Tensor, DispatchError> {
    if tensor.dtype() != DType::F32 || target == DType::F32 {
        return Ok(tensor.clone());
    }
    Ok(cached_cast(tensor, target, |source| to_dtype(source, target))?)
}

fn log_reorder(op: OpKind, role: &'static str, tensor: &Tensor, outcome: &ReorderOutcome) {
    if outcome.changed() {
        tracing::debug!(
            target: "bfmix::dispatch",
            op = op.name(),
            role,
            storage_id = tensor.storage_id(),
            "input reordered at operator entry"
        );
    }
}

/// Inputs after the mode-dependent reorder policy, ready for a kernel.
pub(crate) struct Prepared {
    pub(crate) decision: DispatchDecision,
    pub(crate) primary: Tensor,
    pub(crate) others: Vec<Tensor>,
    output: StorageDescriptor,
    device: Device,
    engine: ReorderEngine,
}

impl Prepared {
    /// Stores kernel output in the representation chosen for this call.
    pub(crate) fn emit(&self, values: &[f32], shape: Vec<usize>) -> Result<Tensor, DispatchError> {
        Ok(self
            .engine
            .materialize(values, shape, self.device, self.output)?)
    }

    /// Writes `values` through the primary input's storage.
    pub(crate) fn write_primary(&self, values: &[f32]) -> Result<Tensor, DispatchError> {
        self.primary.write_logical(values)?;
        Ok(self.primary.clone())
    }

    pub(crate) fn other(&self, index: usize) -> Result<&Tensor, DispatchError> {
        self.others
            .get(index)
            .ok_or_else(|| DispatchError::InvalidArgument {
                op: self.decision.op.name(),
                detail: format!("missing operand {index}"),
            })
    }

    pub(crate) fn outcome(self, tensor: Tensor, stats: &[&Tensor], saved: Saved) -> DispatchOutcome {
        let mut operands = Vec::with_capacity(1 + self.others.len() + stats.len());
        operands.push(self.primary);
        operands.extend(self.others);
        operands.extend(stats.iter().map(|tensor| (*tensor).clone()));
        DispatchOutcome {
            tensor,
            decision: self.decision,
            operands,
            saved,
        }
    }
}

/// Resolves the path for one call and applies the reorder policy.
///
/// `others` are reorderable operands (weights, bias, second operand, further
/// `cat` parts). `stats` are read-only parameters such as batch-norm
/// statistics and are never reordered or cast.
pub(crate) fn prepare(
    op: OpKind,
    primary: &Tensor,
    others: &[&Tensor],
    stats: &[&Tensor],
    in_place: bool,
) -> Result<Prepared, DispatchError> {
    let all = || {
        std::iter::once(primary)
            .chain(others.iter().copied())
            .chain(stats.iter().copied())
    };
    let device = common_device(all())?.unwrap_or_else(|| primary.device());
    let mode = current();
    let autocast = match (device, op.class()) {
        (Device::Xpu, OpClass::Compute) if !in_place => autocast_target(Device::Xpu),
        _ => None,
    };
    let requires_grad = all().any(Tensor::requires_grad);
    let keyset = dispatch_keyset(device, mode, autocast.is_some(), requires_grad);
    let route = resolve_route(op, keyset)?;

    let (primary, others) = match autocast {
        Some(target) => (
            autocast_cast(primary, target)?,
            others
                .iter()
                .map(|tensor| autocast_cast(tensor, target))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        None => (
            primary.clone(),
            others.iter().map(|tensor| (*tensor).clone()).collect(),
        ),
    };
    if matches!(op.class(), OpClass::Compute | OpClass::Binary | OpClass::DataMovement) {
        for other in &others {
            if other.dtype() != primary.dtype() {
                return Err(TensorCompatError::DTypeMismatch {
                    lhs: primary.dtype(),
                    rhs: other.dtype(),
                }
                .into());
            }
        }
    }

    let engine = ReorderEngine::default();
    apply_policy(&engine, op, route.path, mode, &primary, &others);

    let output = if in_place {
        primary.descriptor()
    } else {
        output_descriptor(op, route.path, primary.descriptor())
    };
    let decision = DispatchDecision {
        op,
        path: route.path,
        mode,
        kernel: kernel_name(route.backend_key, output),
        selected_key: route.selected_key,
        backend_key: route.backend_key,
        keyset_bits: keyset.bits(),
        fallback_used: route.fallback_used,
        in_place,
        autocast,
    };
    tracing::debug!(
        target: "bfmix::dispatch",
        op = op.name(),
        path = route.path.name(),
        kernel = decision.kernel,
        keyset_bits = decision.keyset_bits,
        fallback_used = decision.fallback_used,
        training = mode.is_training(),
        in_place,
        autocast = autocast.map(DType::name),
        "dispatch decision"
    );
    Ok(Prepared {
        decision,
        primary,
        others,
        output,
        device,
        engine,
    })
}

fn apply_policy(
    engine: &ReorderEngine,
    op: OpKind,
    path: DispatchPath,
    mode: ModeContext,
    primary: &Tensor,
    others: &[Tensor],
) {
    let reorder = |role: &'static str, tensor: &Tensor| {
        if tensor.dtype() == DType::F32 {
            let outcome = engine.to_plan_bf16(tensor.storage());
            log_reorder(op, role, tensor, &outcome);
        }
    };
    match (path, op.class()) {
        (DispatchPath::AutoMix, OpClass::Compute) => {
            reorder("input", primary);
            for other in others {
                reorder("weight", other);
            }
        }
        (DispatchPath::AutoMix, OpClass::DataDriven) if !mode.is_training() => {
            reorder("input", primary);
        }
        (DispatchPath::AutoMix, OpClass::Binary) => {
            for other in others {
                let outcome = conform_second_operand(primary, other);
                log_reorder(op, "other", other, &outcome);
            }
        }
        (DispatchPath::Fallback, _) => {
            for tensor in std::iter::once(primary).chain(others) {
                let outcome = on_plain_read(tensor);
                log_reorder(op, "plain_read", tensor, &outcome);
            }
        }
        _ => {}
    }
}
