#![forbid(unsafe_code)]

use std::fmt;

use bfmix_core::{DType, Device, Storage, Tensor, TensorError, TensorMeta};
use bfmix_reorder::read_plain;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    Mismatch { expected: Device, actual: Device },
    Tensor(TensorError),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch { expected, actual } => write!(
                f,
                "device mismatch: expected {}, got {}",
                expected.name(),
                actual.name()
            ),
            Self::Tensor(error) => write!(f, "tensor error during transfer: {error}"),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<TensorError> for DeviceError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGuard {
    device: Device,
}

impl DeviceGuard {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    #[must_use]
    pub fn device(self) -> Device {
        self.device
    }

    pub fn ensure_tensor_device(&self, tensor: &Tensor) -> Result<(), DeviceError> {
        if tensor.device() != self.device {
            return Err(DeviceError::Mismatch {
                expected: self.device,
                actual: tensor.device(),
            });
        }
        Ok(())
    }
}

pub fn ensure_same_device(lhs: &Tensor, rhs: &Tensor) -> Result<Device, DeviceError> {
    let guard = DeviceGuard::new(lhs.device());
    guard.ensure_tensor_device(rhs)?;
    Ok(guard.device())
}

/// Common device of all `tensors`. `None` for an empty list.
pub fn common_device<'a>(
    tensors: impl IntoIterator<Item = &'a Tensor>,
) -> Result<Option<Device>, DeviceError> {
    let mut guard: Option<DeviceGuard> = None;
    for tensor in tensors {
        match guard {
            Some(guard) => guard.ensure_tensor_device(tensor)?,
            None => guard = Some(DeviceGuard::new(tensor.device())),
        }
    }
    Ok(guard.map(DeviceGuard::device))
}

/// Copies `tensor` to `device`. The source is read plainly, so an
/// engine-managed source returns to its plain layout first. The copy is
/// contiguous, plain and keeps the logical dtype. Same-device requests
/// return an alias of the source.
pub fn to_device(tensor: &Tensor, device: Device) -> Result<Tensor, DeviceError> {
    if tensor.device() == device {
        return Ok(tensor.clone());
    }
    let values = read_plain(tensor);
    let dtype = tensor.dtype();
    let meta = TensorMeta::from_shape(tensor.shape().to_vec(), device);
    let copy = Tensor::from_storage(Storage::from_values(&values, dtype), meta)?
        .with_requires_grad(tensor.requires_grad());
    tracing::debug!(
        target: "bfmix::device",
        from = tensor.device().name(),
        to = device.name(),
        numel = copy.numel(),
        dtype = dtype.name(),
        "tensor transferred"
    );
    Ok(copy)
}

/// Explicit cast to a new logical dtype. The result owns fresh plain
/// storage; the source representation is left alone.
pub fn to_dtype(tensor: &Tensor, dtype: DType) -> Result<Tensor, DeviceError> {
    if tensor.dtype() == dtype {
        return Ok(tensor.clone());
    }
    let values = tensor.gather_f32();
    let cast = Tensor::new(&values, tensor.shape().to_vec(), dtype, tensor.device())?
        .with_requires_grad(tensor.requires_grad());
    tracing::trace!(
        target: "bfmix::device",
        from = tensor.dtype().name(),
        to = dtype.name(),
        numel = cast.numel(),
        "tensor cast"
    );
    Ok(cast)
}
