#![forbid(unsafe_code)]

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use half::bf16;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Default width of one block in the engine-managed packed layout.
pub const DEFAULT_ENGINE_BLOCK: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F32,
    BF16,
}

impl DType {
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::BF16 => 2,
        }
    }

    #[must_use]
    pub const fn is_reduced_precision(self) -> bool {
        matches!(self, Self::BF16)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F32 => "float32",
            Self::BF16 => "bfloat16",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Cpu,
    Xpu,
}

impl Device {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Xpu => "xpu",
        }
    }
}

/// Train flag carried by every mode frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    Inference,
    Training,
}

impl ExecutionMode {
    #[must_use]
    pub const fn from_train(train: bool) -> Self {
        if train {
            Self::Training
        } else {
            Self::Inference
        }
    }

    #[must_use]
    pub const fn is_training(self) -> bool {
        matches!(self, Self::Training)
    }
}

/// Element encoding actually held by a storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicalRepr {
    FullPrecision,
    BFloat16Plan,
}

/// Per-storage precision metadata. Shared by every view of the storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageDescriptor {
    pub physical_repr: PhysicalRepr,
    pub managed_by_engine: bool,
    pub logical_dtype: DType,
}

impl StorageDescriptor {
    #[must_use]
    pub const fn plain(logical_dtype: DType) -> Self {
        Self {
            physical_repr: match logical_dtype {
                DType::F32 => PhysicalRepr::FullPrecision,
                DType::BF16 => PhysicalRepr::BFloat16Plan,
            },
            managed_by_engine: false,
            logical_dtype,
        }
    }

    /// True when the storage physically holds bf16 elements.
    #[must_use]
    pub const fn is_bf16_tagged(&self) -> bool {
        matches!(self.physical_repr, PhysicalRepr::BFloat16Plan)
    }

    /// True for the float32-appears / bf16-stored duality.
    #[must_use]
    pub const fn is_lazy_bf16(&self) -> bool {
        self.is_bf16_tagged() && matches!(self.logical_dtype, DType::F32)
    }
}

#[must_use]
pub fn round_to_bf16(value: f32) -> f32 {
    bf16::from_f32(value).to_f32()
}

/// Engine-managed bf16 layout: elements are grouped in fixed-width blocks and
/// the trailing block is zero padded.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedBf16 {
    block: usize,
    len: usize,
    data: Vec<bf16>,
}

impl PackedBf16 {
    pub fn pack(values: &[bf16], block: usize) -> Result<Self, TensorError> {
        if block == 0 {
            return Err(TensorError::InvalidBlock { block });
        }
        let blocks = values.len().div_ceil(block);
        let padded = blocks
            .checked_mul(block)
            .ok_or(TensorError::InvalidBlock { block })?;
        let mut data = Vec::with_capacity(padded);
        data.extend_from_slice(values);
        data.resize(padded, bf16::ZERO);
        Ok(Self {
            block,
            len: values.len(),
            data,
        })
    }

    #[must_use]
    pub fn unpack(&self) -> Vec<bf16> {
        self.data[..self.len].to_vec()
    }

    #[must_use]
    pub fn block(&self) -> usize {
        self.block
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.data.len() / self.block
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn get(&self, index: usize) -> Option<bf16> {
        if index >= self.len {
            return None;
        }
        let (block, lane) = (index / self.block, index % self.block);
        self.data.get(block * self.block + lane).copied()
    }

    fn set(&mut self, index: usize, value: bf16) -> bool {
        if index >= self.len {
            return false;
        }
        let (block, lane) = (index / self.block, index % self.block);
        match self.data.get_mut(block * self.block + lane) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    F32(Vec<f32>),
    Bf16(Vec<bf16>),
    Packed(PackedBf16),
}

impl Buffer {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(values) => values.len(),
            Self::Bf16(values) => values.len(),
            Self::Packed(packed) => packed.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<f32> {
        match self {
            Self::F32(values) => values.get(index).copied(),
            Self::Bf16(values) => values.get(index).map(|value| value.to_f32()),
            Self::Packed(packed) => packed.get(index).map(bf16::to_f32),
        }
    }

    /// Writes one element, rounding to nearest-even when the encoding is bf16.
    pub fn set(&mut self, index: usize, value: f32) -> bool {
        match self {
            Self::F32(values) => match values.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            Self::Bf16(values) => match values.get_mut(index) {
                Some(slot) => {
                    *slot = bf16::from_f32(value);
                    true
                }
                None => false,
            },
            Self::Packed(packed) => packed.set(index, bf16::from_f32(value)),
        }
    }

    #[must_use]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            Self::F32(values) => values.clone(),
            Self::Bf16(values) => values.iter().map(|value| value.to_f32()).collect(),
            Self::Packed(packed) => packed.unpack().into_iter().map(bf16::to_f32).collect(),
        }
    }

    #[must_use]
    pub const fn physical_repr(&self) -> PhysicalRepr {
        match self {
            Self::F32(_) => PhysicalRepr::FullPrecision,
            Self::Bf16(_) | Self::Packed(_) => PhysicalRepr::BFloat16Plan,
        }
    }

    #[must_use]
    pub const fn is_engine_managed(&self) -> bool {
        matches!(self, Self::Packed(_))
    }
}

/// Shared backing store of one or more tensor views.
#[derive(Debug, Clone, PartialEq)]
pub struct Storage {
    id: u64,
    version: u64,
    logical_dtype: DType,
    buffer: Buffer,
}

impl Storage {
    pub fn new(buffer: Buffer, logical_dtype: DType) -> Result<Self, TensorError> {
        ensure_buffer_fits_dtype(&buffer, logical_dtype)?;
        Ok(Self {
            id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            version: 0,
            logical_dtype,
            buffer,
        })
    }

    /// Plain storage holding `values` encoded as `dtype`.
    #[must_use]
    pub fn from_values(values: &[f32], dtype: DType) -> Self {
        let buffer = match dtype {
            DType::F32 => Buffer::F32(values.to_vec()),
            DType::BF16 => Buffer::Bf16(values.iter().copied().map(bf16::from_f32).collect()),
        };
        Self {
            id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            version: 0,
            logical_dtype: dtype,
            buffer,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[must_use]
    pub fn logical_dtype(&self) -> DType {
        self.logical_dtype
    }

    #[must_use]
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    #[must_use]
    pub fn descriptor(&self) -> StorageDescriptor {
        StorageDescriptor {
            physical_repr: self.buffer.physical_repr(),
            managed_by_engine: self.buffer.is_engine_managed(),
            logical_dtype: self.logical_dtype,
        }
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<f32> {
        self.buffer.get(index)
    }

    pub fn set(&mut self, index: usize, value: f32) -> Result<(), TensorError> {
        if !self.buffer.set(index, value) {
            return Err(TensorError::StorageIndexOutOfRange {
                index,
                len: self.buffer.len(),
            });
        }
        self.version = self.version.saturating_add(1);
        Ok(())
    }

    /// Swaps the physical buffer in place. The element count and the logical
    /// dtype are fixed for the lifetime of the storage.
    pub fn replace_buffer(&mut self, buffer: Buffer) -> Result<Buffer, TensorError> {
        if buffer.len() != self.buffer.len() {
            return Err(TensorError::LengthMismatch {
                expected: self.buffer.len(),
                actual: buffer.len(),
            });
        }
        ensure_buffer_fits_dtype(&buffer, self.logical_dtype)?;
        Ok(std::mem::replace(&mut self.buffer, buffer))
    }
}

fn ensure_buffer_fits_dtype(buffer: &Buffer, dtype: DType) -> Result<(), TensorError> {
    match (buffer, dtype) {
        (Buffer::F32(_), DType::F32) | (Buffer::Bf16(_), DType::BF16) | (Buffer::Packed(_), _) => {
            Ok(())
        }
        (Buffer::F32(_), DType::BF16) => Err(TensorError::EncodingMismatch {
            logical: dtype,
            physical: PhysicalRepr::FullPrecision,
        }),
        (Buffer::Bf16(_), DType::F32) => Err(TensorError::EncodingMismatch {
            logical: dtype,
            physical: PhysicalRepr::BFloat16Plan,
        }),
    }
}

pub type StorageHandle = Arc<RwLock<Storage>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    strides: Vec<usize>,
    storage_offset: usize,
    device: Device,
}

impl TensorMeta {
    #[must_use]
    pub fn scalar(device: Device) -> Self {
        Self {
            shape: Vec::new(),
            strides: Vec::new(),
            storage_offset: 0,
            device,
        }
    }

    #[must_use]
    pub fn from_shape(shape: Vec<usize>, device: Device) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            storage_offset: 0,
            device,
        }
    }

    pub fn from_shape_and_strides(
        shape: Vec<usize>,
        strides: Vec<usize>,
        storage_offset: usize,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        let meta = Self {
            shape,
            strides,
            storage_offset,
            device,
        };
        meta.validate()?;
        Ok(meta)
    }

    #[must_use]
    pub fn with_storage_offset(mut self, storage_offset: usize) -> Self {
        self.storage_offset = storage_offset;
        self
    }

    pub fn validate(&self) -> Result<(), TensorMetaError> {
        self.max_linear_offset().map(|_| ())
    }

    fn max_linear_offset(&self) -> Result<usize, TensorMetaError> {
        if self.shape.len() != self.strides.len() {
            return Err(TensorMetaError::RankStrideMismatch {
                rank: self.shape.len(),
                strides: self.strides.len(),
            });
        }

        let mut max_linear_offset = 0usize;
        for (size, stride) in self.shape.iter().copied().zip(self.strides.iter().copied()) {
            if size == 0 {
                continue;
            }

            let span = stride
                .checked_mul(size.saturating_sub(1))
                .ok_or(TensorMetaError::StrideOverflow { size, stride })?;
            max_linear_offset = max_linear_offset.checked_add(span).ok_or(
                TensorMetaError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset,
                },
            )?;
        }

        self.storage_offset.checked_add(max_linear_offset).ok_or(
            TensorMetaError::StorageOffsetOverflow {
                storage_offset: self.storage_offset,
                max_linear_offset,
            },
        )
    }

    /// Number of storage elements this view needs, `0` for empty views.
    pub fn required_storage_len(&self) -> Result<usize, TensorMetaError> {
        if self.numel() == 0 {
            return Ok(0);
        }
        Ok(self.max_linear_offset()? + 1)
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        if self.shape.is_empty() {
            return 1;
        }
        self.shape.iter().copied().product()
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        if self.shape.len() != self.strides.len() {
            return false;
        }

        let mut expected_stride = 1usize;
        for (size, stride) in self
            .shape
            .iter()
            .copied()
            .zip(self.strides.iter().copied())
            .rev()
        {
            // Singleton dimensions are contiguous regardless of stride.
            if size == 1 {
                continue;
            }
            if stride != expected_stride {
                return false;
            }
            let Some(next_expected) = expected_stride.checked_mul(size) else {
                return false;
            };
            expected_stride = next_expected;
        }
        true
    }

    pub fn storage_index_for(&self, index: &[usize]) -> Result<usize, TensorMetaError> {
        if index.len() != self.shape.len() {
            return Err(TensorMetaError::IndexRankMismatch {
                expected: self.shape.len(),
                actual: index.len(),
            });
        }

        let mut linear = self.storage_offset;
        for (dim, ((idx, dim_size), stride)) in index
            .iter()
            .copied()
            .zip(self.shape.iter().copied())
            .zip(self.strides.iter().copied())
            .enumerate()
        {
            if idx >= dim_size {
                return Err(TensorMetaError::IndexOutOfBounds {
                    dim,
                    index: idx,
                    size: dim_size,
                });
            }

            let step = idx
                .checked_mul(stride)
                .ok_or(TensorMetaError::StrideOverflow { size: idx, stride })?;
            linear = linear
                .checked_add(step)
                .ok_or(TensorMetaError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset: step,
                })?;
        }

        Ok(linear)
    }

    /// Storage indices of every element in row-major logical order.
    #[must_use]
    pub fn storage_indices(&self) -> Vec<usize> {
        let numel = self.numel();
        let mut out = Vec::with_capacity(numel);
        if numel == 0 {
            return out;
        }
        let rank = self.shape.len();
        let mut cursor = vec![0usize; rank];
        let mut linear = self.storage_offset;
        loop {
            out.push(linear);
            let mut dim = rank;
            loop {
                if dim == 0 {
                    return out;
                }
                dim -= 1;
                cursor[dim] += 1;
                linear += self.strides[dim];
                if cursor[dim] < self.shape[dim] {
                    break;
                }
                linear -= self.strides[dim] * cursor[dim];
                cursor[dim] = 0;
            }
        }
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.shape.hash(&mut hasher);
        self.strides.hash(&mut hasher);
        self.storage_offset.hash(&mut hasher);
        self.device.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorMetaError {
    RankStrideMismatch {
        rank: usize,
        strides: usize,
    },
    StrideOverflow {
        size: usize,
        stride: usize,
    },
    StorageOffsetOverflow {
        storage_offset: usize,
        max_linear_offset: usize,
    },
    IndexRankMismatch {
        expected: usize,
        actual: usize,
    },
    IndexOutOfBounds {
        dim: usize,
        index: usize,
        size: usize,
    },
}

impl fmt::Display for TensorMetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankStrideMismatch { rank, strides } => {
                write!(f, "shape rank {rank} does not match strides rank {strides}")
            }
            Self::StrideOverflow { size, stride } => {
                write!(f, "stride overflow for size={size}, stride={stride}")
            }
            Self::StorageOffsetOverflow {
                storage_offset,
                max_linear_offset,
            } => write!(
                f,
                "storage offset overflow for storage_offset={storage_offset}, max_linear_offset={max_linear_offset}"
            ),
            Self::IndexRankMismatch { expected, actual } => {
                write!(
                    f,
                    "index rank mismatch expected={expected}, actual={actual}"
                )
            }
            Self::IndexOutOfBounds { dim, index, size } => {
                write!(
                    f,
                    "index out of bounds at dim={dim}: index={index}, size={size}"
                )
            }
        }
    }
}

impl std::error::Error for TensorMetaError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    Meta(TensorMetaError),
    DimOutOfRange {
        dim: usize,
        rank: usize,
    },
    SliceOutOfRange {
        dim: usize,
        start: usize,
        end: usize,
        size: usize,
    },
    LengthMismatch {
        expected: usize,
        actual: usize,
    },
    StorageTooSmall {
        needed: usize,
        available: usize,
    },
    StorageIndexOutOfRange {
        index: usize,
        len: usize,
    },
    EncodingMismatch {
        logical: DType,
        physical: PhysicalRepr,
    },
    InvalidBlock {
        block: usize,
    },
    NotContiguous,
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meta(error) => write!(f, "invalid tensor metadata: {error}"),
            Self::DimOutOfRange { dim, rank } => {
                write!(f, "dimension {dim} out of range for rank {rank}")
            }
            Self::SliceOutOfRange {
                dim,
                start,
                end,
                size,
            } => write!(
                f,
                "slice {start}..{end} out of range for dim={dim} with size={size}"
            ),
            Self::LengthMismatch { expected, actual } => {
                write!(f, "length mismatch: expected={expected}, actual={actual}")
            }
            Self::StorageTooSmall { needed, available } => write!(
                f,
                "storage too small for view: needed={needed}, available={available}"
            ),
            Self::StorageIndexOutOfRange { index, len } => {
                write!(f, "storage index {index} out of range for len={len}")
            }
            Self::EncodingMismatch { logical, physical } => write!(
                f,
                "buffer encoding {physical:?} cannot back logical dtype {}",
                logical.name()
            ),
            Self::InvalidBlock { block } => write!(f, "invalid engine block width {block}"),
            Self::NotContiguous => write!(f, "operation requires a contiguous view"),
        }
    }
}

impl std::error::Error for TensorError {}

impl From<TensorMetaError> for TensorError {
    fn from(value: TensorMetaError) -> Self {
        Self::Meta(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorCompatError {
    DTypeMismatch { lhs: DType, rhs: DType },
    DeviceMismatch { lhs: Device, rhs: Device },
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
}

impl fmt::Display for TensorCompatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DTypeMismatch { lhs, rhs } => {
                write!(f, "dtype mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::DeviceMismatch { lhs, rhs } => {
                write!(f, "device mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::ShapeMismatch { lhs, rhs } => {
                write!(f, "shape mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
        }
    }
}

impl std::error::Error for TensorCompatError {}

/// One component of a multi-dimensional index expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorIndex {
    Full,
    Range { start: usize, end: usize },
    Single(usize),
}

/// A strided view over shared storage.
#[derive(Debug, Clone)]
pub struct Tensor {
    id: u64,
    meta: TensorMeta,
    storage: StorageHandle,
    requires_grad: bool,
}

impl Tensor {
    pub fn from_storage(storage: Storage, meta: TensorMeta) -> Result<Self, TensorError> {
        Self::from_handle(Arc::new(RwLock::new(storage)), meta)
    }

    pub fn from_handle(storage: StorageHandle, meta: TensorMeta) -> Result<Self, TensorError> {
        meta.validate()?;
        let needed = meta.required_storage_len()?;
        let available = storage.read().len();
        if needed > available {
            return Err(TensorError::StorageTooSmall { needed, available });
        }
        Ok(Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            meta,
            storage,
            requires_grad: false,
        })
    }

    /// Contiguous tensor whose elements are `values` encoded as `dtype`.
    pub fn new(
        values: &[f32],
        shape: Vec<usize>,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorError> {
        let meta = TensorMeta::from_shape(shape, device);
        if meta.numel() != values.len() {
            return Err(TensorError::LengthMismatch {
                expected: meta.numel(),
                actual: values.len(),
            });
        }
        Self::from_storage(Storage::from_values(values, dtype), meta)
    }

    pub fn from_f32(values: Vec<f32>, shape: Vec<usize>, device: Device) -> Result<Self, TensorError> {
        let meta = TensorMeta::from_shape(shape, device);
        if meta.numel() != values.len() {
            return Err(TensorError::LengthMismatch {
                expected: meta.numel(),
                actual: values.len(),
            });
        }
        let storage = Storage::new(Buffer::F32(values), DType::F32)?;
        Self::from_storage(storage, meta)
    }

    pub fn full(
        shape: Vec<usize>,
        value: f32,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorError> {
        let numel = TensorMeta::from_shape(shape.clone(), device).numel();
        Self::new(&vec![value; numel], shape, dtype, device)
    }

    pub fn zeros(shape: Vec<usize>, dtype: DType, device: Device) -> Result<Self, TensorError> {
        Self::full(shape, 0.0, dtype, device)
    }

    #[must_use]
    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        self.meta.strides()
    }

    #[must_use]
    pub fn storage_offset(&self) -> usize {
        self.meta.storage_offset()
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.meta.device()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.meta.numel()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.meta.rank()
    }

    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Logical dtype as reported to callers. Never reflects internal reorders.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.storage.read().logical_dtype()
    }

    #[must_use]
    pub fn descriptor(&self) -> StorageDescriptor {
        self.storage.read().descriptor()
    }

    #[must_use]
    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    #[must_use]
    pub fn storage_id(&self) -> u64 {
        self.storage.read().id()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.storage.read().version()
    }

    #[must_use]
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    pub fn read_storage(&self) -> RwLockReadGuard<'_, Storage> {
        self.storage.read()
    }

    pub fn write_storage(&self) -> RwLockWriteGuard<'_, Storage> {
        self.storage.write()
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.meta.is_contiguous()
    }

    /// Reads every element in logical order as f32 without touching the
    /// storage representation.
    #[must_use]
    pub fn gather_f32(&self) -> Vec<f32> {
        let storage = self.storage.read();
        self.meta
            .storage_indices()
            .into_iter()
            .map(|index| storage.get(index).unwrap_or(0.0))
            .collect()
    }

    /// Overwrites every element of this view in logical order. bf16 encoded
    /// storages round each value to nearest-even.
    pub fn write_logical(&self, values: &[f32]) -> Result<(), TensorError> {
        if values.len() != self.numel() {
            return Err(TensorError::LengthMismatch {
                expected: self.numel(),
                actual: values.len(),
            });
        }
        let mut storage = self.storage.write();
        for (index, value) in self.meta.storage_indices().into_iter().zip(values) {
            storage.set(index, *value)?;
        }
        Ok(())
    }

    /// New view with a fresh id over the same storage.
    pub fn alias_view(&self, meta: TensorMeta) -> Result<Self, TensorError> {
        Self::from_handle(Arc::clone(&self.storage), meta)
    }

    pub fn narrow_view(&self, dim: usize, start: usize, len: usize) -> Result<Self, TensorError> {
        let meta = narrow_meta(&self.meta, dim, start, len)?;
        self.alias_view(meta)
    }

    pub fn select_view(&self, dim: usize, index: usize) -> Result<Self, TensorError> {
        let meta = select_meta(&self.meta, dim, index)?;
        self.alias_view(meta)
    }

    pub fn index_view(&self, indices: &[TensorIndex]) -> Result<Self, TensorError> {
        if indices.len() > self.rank() {
            return Err(TensorError::DimOutOfRange {
                dim: indices.len(),
                rank: self.rank(),
            });
        }
        let mut meta = self.meta.clone();
        let mut dim = 0usize;
        for index in indices {
            match *index {
                TensorIndex::Full => dim += 1,
                TensorIndex::Range { start, end } => {
                    if end < start {
                        return Err(TensorError::SliceOutOfRange {
                            dim,
                            start,
                            end,
                            size: meta.shape[dim],
                        });
                    }
                    meta = narrow_meta(&meta, dim, start, end - start)?;
                    dim += 1;
                }
                TensorIndex::Single(position) => {
                    meta = select_meta(&meta, dim, position)?;
                }
            }
        }
        self.alias_view(meta)
    }

    pub fn transpose_view(&self, dim0: usize, dim1: usize) -> Result<Self, TensorError> {
        let rank = self.rank();
        for dim in [dim0, dim1] {
            if dim >= rank {
                return Err(TensorError::DimOutOfRange { dim, rank });
            }
        }
        let mut shape = self.meta.shape.clone();
        let mut strides = self.meta.strides.clone();
        shape.swap(dim0, dim1);
        strides.swap(dim0, dim1);
        let meta = TensorMeta::from_shape_and_strides(
            shape,
            strides,
            self.meta.storage_offset,
            self.meta.device,
        )?;
        self.alias_view(meta)
    }

    /// Reinterprets a contiguous view with a new shape of equal element count.
    pub fn reshape_view(&self, shape: Vec<usize>) -> Result<Self, TensorError> {
        if !self.is_contiguous() {
            return Err(TensorError::NotContiguous);
        }
        let meta = TensorMeta::from_shape(shape, self.device())
            .with_storage_offset(self.storage_offset());
        if meta.numel() != self.numel() {
            return Err(TensorError::LengthMismatch {
                expected: self.numel(),
                actual: meta.numel(),
            });
        }
        self.alias_view(meta)
    }

    #[must_use]
    pub fn evidence_fingerprint64(&self) -> u64 {
        let storage = self.storage.read();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.id.hash(&mut hasher);
        storage.id().hash(&mut hasher);
        storage.version().hash(&mut hasher);
        storage.descriptor().hash(&mut hasher);
        self.meta.fingerprint64().hash(&mut hasher);
        hasher.finish()
    }
}

fn narrow_meta(
    meta: &TensorMeta,
    dim: usize,
    start: usize,
    len: usize,
) -> Result<TensorMeta, TensorError> {
    let rank = meta.rank();
    if dim >= rank {
        return Err(TensorError::DimOutOfRange { dim, rank });
    }
    let size = meta.shape[dim];
    let end = start.saturating_add(len);
    if end > size {
        return Err(TensorError::SliceOutOfRange {
            dim,
            start,
            end,
            size,
        });
    }
    let mut shape = meta.shape.clone();
    shape[dim] = len;
    let offset = if len == 0 {
        meta.storage_offset
    } else {
        meta.storage_offset + start * meta.strides[dim]
    };
    Ok(TensorMeta::from_shape_and_strides(
        shape,
        meta.strides.clone(),
        offset,
        meta.device,
    )?)
}

fn select_meta(meta: &TensorMeta, dim: usize, index: usize) -> Result<TensorMeta, TensorError> {
    let rank = meta.rank();
    if dim >= rank {
        return Err(TensorError::DimOutOfRange { dim, rank });
    }
    let size = meta.shape[dim];
    if index >= size {
        return Err(TensorError::SliceOutOfRange {
            dim,
            start: index,
            end: index + 1,
            size,
        });
    }
    let mut shape = meta.shape.clone();
    let mut strides = meta.strides.clone();
    let stride = strides.remove(dim);
    shape.remove(dim);
    Ok(TensorMeta::from_shape_and_strides(
        shape,
        strides,
        meta.storage_offset + index * stride,
        meta.device,
    )?)
}

pub fn ensure_compatible(lhs: &Tensor, rhs: &Tensor) -> Result<(), TensorCompatError> {
    if lhs.dtype() != rhs.dtype() {
        return Err(TensorCompatError::DTypeMismatch {
            lhs: lhs.dtype(),
            rhs: rhs.dtype(),
        });
    }

    if lhs.device() != rhs.device() {
        return Err(TensorCompatError::DeviceMismatch {
            lhs: lhs.device(),
            rhs: rhs.device(),
        });
    }

    Ok(())
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}

#[cfg(test)]
mod tests {
    use half::bf16;
    use proptest::prelude::*;

    use super::{
        Buffer, DType, Device, PackedBf16, PhysicalRepr, Storage, StorageDescriptor, Tensor,
        TensorError, TensorIndex, TensorMeta, TensorMetaError, contiguous_strides,
        ensure_compatible, round_to_bf16,
    };

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| i as f32 * 0.25 - 3.0).collect()
    }

    #[test]
    fn scalar_meta_is_valid() {
        let meta = TensorMeta::scalar(Device::Cpu);
        assert!(meta.validate().is_ok());
        assert!(meta.shape().is_empty());
        assert_eq!(meta.numel(), 1);
        assert!(meta.is_contiguous());
        assert_eq!(meta.storage_indices(), vec![0]);
    }

    #[test]
    fn shape_builds_contiguous_strides() {
        let meta = TensorMeta::from_shape(vec![2, 3, 4], Device::Xpu);
        assert_eq!(meta.strides(), &[12, 4, 1]);
        assert_eq!(meta.numel(), 24);
        assert!(meta.is_contiguous());
    }

    #[test]
    fn custom_strides_validate_and_index_into_storage() {
        let meta = TensorMeta::from_shape_and_strides(vec![2, 2], vec![4, 1], 3, Device::Cpu)
            .expect("meta should validate");

        assert_eq!(meta.storage_index_for(&[0, 0]).expect("index 0,0"), 3);
        assert_eq!(meta.storage_index_for(&[1, 1]).expect("index 1,1"), 8);
        assert_eq!(meta.storage_indices(), vec![3, 4, 7, 8]);
        assert_eq!(meta.required_storage_len().expect("span"), 9);
    }

    #[test]
    fn index_rank_and_bounds_are_guarded() {
        let meta = TensorMeta::from_shape(vec![2, 3], Device::Cpu);
        let err = meta
            .storage_index_for(&[2, 0])
            .expect_err("out-of-bounds index should fail");
        assert!(matches!(
            err,
            TensorMetaError::IndexOutOfBounds {
                dim: 0,
                index: 2,
                size: 2
            }
        ));
    }

    #[test]
    fn plain_descriptors_follow_logical_dtype() {
        let f32_desc = StorageDescriptor::plain(DType::F32);
        assert_eq!(f32_desc.physical_repr, PhysicalRepr::FullPrecision);
        assert!(!f32_desc.is_bf16_tagged());

        let bf16_desc = StorageDescriptor::plain(DType::BF16);
        assert!(bf16_desc.is_bf16_tagged());
        assert!(!bf16_desc.is_lazy_bf16());
        assert!(!bf16_desc.managed_by_engine);
    }

    #[test]
    fn storage_rejects_buffer_that_cannot_back_logical_dtype() {
        let err = Storage::new(Buffer::F32(vec![1.0]), DType::BF16).expect_err("must fail");
        assert!(matches!(err, TensorError::EncodingMismatch { .. }));
    }

    #[test]
    fn replace_buffer_keeps_length_and_logical_dtype() {
        let mut storage = Storage::from_values(&[1.0, 2.0, 3.0], DType::F32);
        let packed = PackedBf16::pack(&[bf16::ONE, bf16::ONE, bf16::ONE], 2).expect("pack");
        storage
            .replace_buffer(Buffer::Packed(packed))
            .expect("same length swap");
        let desc = storage.descriptor();
        assert!(desc.is_lazy_bf16());
        assert!(desc.managed_by_engine);
        assert_eq!(storage.logical_dtype(), DType::F32);

        let short = Buffer::F32(vec![0.0]);
        let err = storage.replace_buffer(short).expect_err("length change must fail");
        assert!(matches!(err, TensorError::LengthMismatch { .. }));
    }

    #[test]
    fn packed_layout_pads_last_block() {
        let values: Vec<bf16> = (0..5).map(|i| bf16::from_f32(i as f32)).collect();
        let packed = PackedBf16::pack(&values, 4).expect("pack");
        assert_eq!(packed.block_count(), 2);
        assert_eq!(packed.len(), 5);
        assert_eq!(packed.unpack(), values);
        assert!(PackedBf16::pack(&values, 0).is_err());
    }

    #[test]
    fn bf16_tensor_rounds_on_creation() {
        let value = 1.0 + 1.0 / 512.0;
        let tensor = Tensor::new(&[value], vec![1], DType::BF16, Device::Xpu).expect("tensor");
        assert_eq!(tensor.dtype(), DType::BF16);
        assert_eq!(tensor.gather_f32(), vec![round_to_bf16(value)]);
    }

    #[test]
    fn slicing_shares_storage_and_keeps_strides() {
        let tensor =
            Tensor::from_f32(ramp(1000), vec![10, 10, 10], Device::Xpu).expect("tensor");
        let slice = tensor
            .index_view(&[
                TensorIndex::Range { start: 3, end: 7 },
                TensorIndex::Range { start: 3, end: 7 },
                TensorIndex::Single(5),
            ])
            .expect("slice");

        assert!(slice.shares_storage(&tensor));
        assert_ne!(slice.id(), tensor.id());
        assert_eq!(slice.shape(), &[4, 4]);
        assert_eq!(slice.strides(), &[100, 10]);
        assert_eq!(slice.storage_offset(), 3 * 100 + 3 * 10 + 5);

        let values = slice.gather_f32();
        assert_eq!(values[0], ramp(1000)[335]);
        assert_eq!(values[15], ramp(1000)[665]);
    }

    #[test]
    fn slice_bounds_are_checked() {
        let tensor = Tensor::from_f32(ramp(10), vec![10], Device::Cpu).expect("tensor");
        let err = tensor.narrow_view(0, 8, 3).expect_err("must fail");
        assert!(matches!(err, TensorError::SliceOutOfRange { dim: 0, .. }));
        let err = tensor.select_view(1, 0).expect_err("must fail");
        assert!(matches!(err, TensorError::DimOutOfRange { dim: 1, rank: 1 }));
    }

    #[test]
    fn write_through_view_is_visible_to_parent() {
        let tensor = Tensor::from_f32(vec![0.0; 6], vec![2, 3], Device::Xpu).expect("tensor");
        let row = tensor.select_view(0, 1).expect("row");
        row.write_logical(&[1.0, 2.0, 3.0]).expect("write");
        assert_eq!(tensor.gather_f32(), vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0]);
        assert_eq!(tensor.version(), 3);
    }

    #[test]
    fn transpose_and_reshape_views() {
        let tensor = Tensor::from_f32(ramp(6), vec![2, 3], Device::Cpu).expect("tensor");
        let transposed = tensor.transpose_view(0, 1).expect("transpose");
        assert_eq!(transposed.shape(), &[3, 2]);
        assert!(!transposed.is_contiguous());
        assert!(transposed.reshape_view(vec![6]).is_err());

        let flat = tensor.reshape_view(vec![6]).expect("reshape");
        assert_eq!(flat.gather_f32(), ramp(6));
    }

    #[test]
    fn compatibility_checks_dtype_and_device() {
        let lhs = Tensor::full(vec![2], 1.0, DType::F32, Device::Xpu).expect("lhs");
        let rhs = Tensor::full(vec![2], 1.0, DType::BF16, Device::Xpu).expect("rhs");
        assert!(ensure_compatible(&lhs, &rhs).is_err());
        let cpu = Tensor::full(vec![2], 1.0, DType::F32, Device::Cpu).expect("cpu");
        assert!(ensure_compatible(&lhs, &cpu).is_err());
    }

    #[test]
    fn contiguous_stride_helper_handles_scalar() {
        assert_eq!(contiguous_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn evidence_fingerprint_follows_storage_state() {
        let tensor = Tensor::new(&ramp(6), vec![2, 3], DType::F32, Device::Xpu).expect("tensor");
        let copy = tensor.clone();
        assert_eq!(tensor.evidence_fingerprint64(), copy.evidence_fingerprint64());

        let view = tensor.transpose_view(0, 1).expect("transpose");
        assert_ne!(tensor.evidence_fingerprint64(), view.evidence_fingerprint64());

        let before = tensor.evidence_fingerprint64();
        tensor.write_logical(&[0.0; 6]).expect("write");
        assert_ne!(tensor.evidence_fingerprint64(), before);
    }

    proptest! {
        #[test]
        fn prop_contiguous_stride_contract(shape in prop::collection::vec(1usize..=4, 1..=4)) {
            let strides = contiguous_strides(shape.as_slice());
            prop_assert_eq!(strides.len(), shape.len());
            prop_assert_eq!(strides.last().copied(), Some(1));
        }

        #[test]
        fn prop_storage_indices_match_index_lookup(shape in prop::collection::vec(1usize..=4, 1..=3)) {
            let meta = TensorMeta::from_shape(shape.clone(), Device::Cpu);
            let indices = meta.storage_indices();
            prop_assert_eq!(indices.len(), meta.numel());
            prop_assert_eq!(indices, (0..meta.numel()).collect::<Vec<_>>());
        }

        #[test]
        fn prop_bf16_rounding_is_idempotent(value in -1.0e6f32..1.0e6f32) {
            let once = round_to_bf16(value);
            prop_assert_eq!(round_to_bf16(once), once);
            if value != 0.0 {
                prop_assert!(((once - value) / value).abs() <= 1.0 / 256.0);
            }
        }
    }
}
