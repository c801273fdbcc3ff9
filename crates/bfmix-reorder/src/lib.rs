#![forbid(unsafe_code)]

use std::fmt;

use bfmix_core::{
    Buffer, DType, Device, PackedBf16, PhysicalRepr, Storage, StorageDescriptor, StorageHandle,
    Tensor, TensorError, TensorMeta,
};
use bfmix_runtime::{ModeContext, Settings};
use half::bf16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorderError {
    EmptyStorage { storage_id: u64 },
    InvalidBlock { block: usize },
    NotScalar { numel: usize },
    Tensor(TensorError),
}

impl fmt::Display for ReorderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyStorage { storage_id } => {
                write!(f, "storage {storage_id} has no elements to reorder")
            }
            Self::InvalidBlock { block } => write!(f, "invalid engine block width {block}"),
            Self::NotScalar { numel } => {
                write!(f, "item() requires one element, tensor has {numel}")
            }
            Self::Tensor(error) => write!(f, "tensor error during reorder: {error}"),
        }
    }
}

impl std::error::Error for ReorderError {}

impl From<TensorError> for ReorderError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

/// Result of a reorder request. Failures never escape: the storage keeps its
/// previous representation and the error is reported here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorderOutcome {
    Reordered,
    Unchanged,
    FellBack(ReorderError),
}

impl ReorderOutcome {
    #[must_use]
    pub fn changed(&self) -> bool {
        matches!(self, Self::Reordered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorderEngine {
    block: usize,
}

impl Default for ReorderEngine {
    fn default() -> Self {
        Self::from_settings(Settings::global())
    }
}

impl ReorderEngine {
    pub fn new(block: usize) -> Result<Self, ReorderError> {
        if block == 0 {
            return Err(ReorderError::InvalidBlock { block });
        }
        Ok(Self { block })
    }

    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            block: settings.engine_block().max(1),
        }
    }

    #[must_use]
    pub fn block(&self) -> usize {
        self.block
    }

    /// Moves `storage` into the engine-managed bf16 layout.
    pub fn to_plan_bf16(&self, storage: &StorageHandle) -> ReorderOutcome {
        let mut guard = storage.write();
        let descriptor = guard.descriptor();
        if descriptor.is_bf16_tagged() && descriptor.managed_by_engine {
            return ReorderOutcome::Unchanged;
        }
        match self.pack_storage(&mut guard) {
            Ok(()) => {
                tracing::debug!(
                    target: "bfmix::reorder",
                    storage_id = guard.id(),
                    len = guard.len(),
                    logical = guard.logical_dtype().name(),
                    logical_bytes = guard.len() * guard.logical_dtype().size_in_bytes(),
                    "storage reordered to bf16 plan"
                );
                ReorderOutcome::Reordered
            }
            Err(error) => {
                tracing::warn!(
                    target: "bfmix::reorder",
                    storage_id = guard.id(),
                    %error,
                    "bf16 reorder failed, storage stays in its current representation"
                );
                ReorderOutcome::FellBack(error)
            }
        }
    }

    /// Moves `storage` back to a plain buffer whose encoding follows the
    /// logical dtype.
    pub fn to_plain_fp32(&self, storage: &StorageHandle) -> ReorderOutcome {
        let mut guard = storage.write();
        let Buffer::Packed(packed) = guard.buffer() else {
            return ReorderOutcome::Unchanged;
        };
        let raw = packed.unpack();
        let plain = match guard.logical_dtype() {
            DType::F32 => Buffer::F32(raw.into_iter().map(bf16::to_f32).collect()),
            DType::BF16 => Buffer::Bf16(raw),
        };
        match guard.replace_buffer(plain) {
            Ok(_) => {
                tracing::debug!(
                    target: "bfmix::reorder",
                    storage_id = guard.id(),
                    len = guard.len(),
                    "storage reordered to plain layout"
                );
                ReorderOutcome::Reordered
            }
            Err(error) => {
                let error = ReorderError::from(error);
                tracing::warn!(
                    target: "bfmix::reorder",
                    storage_id = guard.id(),
                    %error,
                    "plain reorder failed"
                );
                ReorderOutcome::FellBack(error)
            }
        }
    }

    fn pack_storage(&self, storage: &mut Storage) -> Result<(), ReorderError> {
        if storage.is_empty() {
            return Err(ReorderError::EmptyStorage {
                storage_id: storage.id(),
            });
        }
        let raw: Vec<bf16> = match storage.buffer() {
            Buffer::F32(values) => values.iter().copied().map(bf16::from_f32).collect(),
            Buffer::Bf16(values) => values.clone(),
            Buffer::Packed(packed) => packed.unpack(),
        };
        let packed = PackedBf16::pack(&raw, self.block)?;
        storage.replace_buffer(Buffer::Packed(packed))?;
        Ok(())
    }

    /// Builds a contiguous tensor holding `values` in the representation
    /// described by `descriptor`. Engine-managed targets that cannot be
    /// packed fall back to the plain encoding of the logical dtype.
    pub fn materialize(
        &self,
        values: &[f32],
        shape: Vec<usize>,
        device: Device,
        descriptor: StorageDescriptor,
    ) -> Result<Tensor, ReorderError> {
        let meta = TensorMeta::from_shape(shape, device);
        if meta.numel() != values.len() {
            return Err(TensorError::LengthMismatch {
                expected: meta.numel(),
                actual: values.len(),
            }
            .into());
        }
        let storage = Storage::from_values(values, descriptor.logical_dtype);
        let tensor = Tensor::from_storage(storage, meta)?;
        let wants_packed =
            descriptor.managed_by_engine && descriptor.physical_repr == PhysicalRepr::BFloat16Plan;
        if wants_packed {
            let _ = self.to_plan_bf16(tensor.storage());
        }
        Ok(tensor)
    }
}

/// Reorders the whole storage behind `tensor` to the bf16 plan.
pub fn to_plan_bf16(tensor: &Tensor) -> ReorderOutcome {
    ReorderEngine::default().to_plan_bf16(tensor.storage())
}

/// Reorders the whole storage behind `tensor` back to its plain layout.
pub fn to_plain_fp32(tensor: &Tensor) -> ReorderOutcome {
    ReorderEngine::default().to_plain_fp32(tensor.storage())
}

/// A full-precision accelerator tensor is moved to the bf16 plan before a
/// view of it is handed out, so every view of the storage agrees.
pub fn on_slice(tensor: &Tensor, ctx: ModeContext) -> ReorderOutcome {
    let descriptor = tensor.descriptor();
    let eligible = tensor.device() == Device::Xpu
        && ctx.auto_mix_active()
        && descriptor.logical_dtype == DType::F32
        && descriptor.physical_repr == PhysicalRepr::FullPrecision;
    if !eligible {
        return ReorderOutcome::Unchanged;
    }
    to_plan_bf16(tensor)
}

/// Plain reads see a plain layout; the conversion is permanent.
pub fn on_plain_read(tensor: &Tensor) -> ReorderOutcome {
    if !tensor.descriptor().managed_by_engine {
        return ReorderOutcome::Unchanged;
    }
    to_plain_fp32(tensor)
}

/// Brings `rhs` to the physical representation of `lhs`. `lhs` is never
/// touched.
pub fn conform_second_operand(lhs: &Tensor, rhs: &Tensor) -> ReorderOutcome {
    let target = lhs.descriptor();
    let current = rhs.descriptor();
    if lhs.shares_storage(rhs) || current.physical_repr == target.physical_repr {
        return ReorderOutcome::Unchanged;
    }
    match target.physical_repr {
        PhysicalRepr::BFloat16Plan => to_plan_bf16(rhs),
        PhysicalRepr::FullPrecision if current.logical_dtype == DType::F32 => to_plain_fp32(rhs),
        PhysicalRepr::FullPrecision => ReorderOutcome::Unchanged,
    }
}

/// Logical values of `tensor` after a plain read.
#[must_use]
pub fn read_plain(tensor: &Tensor) -> Vec<f32> {
    let _ = on_plain_read(tensor);
    tensor.gather_f32()
}

pub fn item(tensor: &Tensor) -> Result<f32, ReorderError> {
    if tensor.numel() != 1 {
        return Err(ReorderError::NotScalar {
            numel: tensor.numel(),
        });
    }
    Ok(read_plain(tensor)[0])
}

/// Element-wise equality after plain reads of both sides.
#[must_use]
pub fn equal(lhs: &Tensor, rhs: &Tensor) -> bool {
    lhs.shape() == rhs.shape() && read_plain(lhs) == read_plain(rhs)
}

#[must_use]
pub fn allclose(lhs: &Tensor, rhs: &Tensor, rtol: f32, atol: f32) -> bool {
    if lhs.shape() != rhs.shape() {
        return false;
    }
    read_plain(lhs)
        .into_iter()
        .zip(read_plain(rhs))
        .all(|(a, b)| (a - b).abs() <= atol + rtol * b.abs() || (a.is_nan() && b.is_nan()))
}

#[cfg(test)]
mod tests {
    use bfmix_core::{
        DType, Device, ExecutionMode, PhysicalRepr, Tensor, TensorIndex, round_to_bf16,
    };
    use bfmix_runtime::ModeContext;
    use proptest::prelude::*;

    use super::{
        ReorderEngine, ReorderError, ReorderOutcome, allclose, conform_second_operand, equal,
        item, on_plain_read, on_slice, read_plain,
    };

    const AUTO_MIX: ModeContext = ModeContext {
        engine_enabled: true,
        auto_mix_enabled: true,
        mode: ExecutionMode::Inference,
    };

    fn lcg_values(seed: u64, len: usize) -> Vec<f32> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                ((state >> 40) as f32 / (1u64 << 24) as f32) * 20.0 - 10.0
            })
            .collect()
    }

    fn engine() -> ReorderEngine {
        ReorderEngine::new(4).expect("engine")
    }

    #[test]
    fn plan_reorder_tags_storage_and_keeps_logical_dtype() {
        let values = lcg_values(7, 10);
        let tensor = Tensor::from_f32(values.clone(), vec![2, 5], Device::Xpu).expect("tensor");
        let outcome = engine().to_plan_bf16(tensor.storage());
        assert_eq!(outcome, ReorderOutcome::Reordered);

        let descriptor = tensor.descriptor();
        assert!(descriptor.is_lazy_bf16());
        assert!(descriptor.managed_by_engine);
        assert_eq!(tensor.dtype(), DType::F32);
        let rounded: Vec<f32> = values.iter().copied().map(round_to_bf16).collect();
        assert_eq!(tensor.gather_f32(), rounded);
    }

    #[test]
    fn both_reorders_are_idempotent() {
        let tensor = Tensor::from_f32(lcg_values(3, 9), vec![9], Device::Xpu).expect("tensor");
        let engine = engine();
        assert!(engine.to_plan_bf16(tensor.storage()).changed());
        let once = tensor.gather_f32();
        assert_eq!(engine.to_plan_bf16(tensor.storage()), ReorderOutcome::Unchanged);
        assert_eq!(tensor.gather_f32(), once);

        assert!(engine.to_plain_fp32(tensor.storage()).changed());
        let plain = tensor.gather_f32();
        assert_eq!(engine.to_plain_fp32(tensor.storage()), ReorderOutcome::Unchanged);
        assert_eq!(tensor.gather_f32(), plain);
        assert_eq!(plain, once);
        assert_eq!(tensor.descriptor().physical_repr, PhysicalRepr::FullPrecision);
    }

    #[test]
    fn logical_bf16_plain_read_stays_bf16() {
        let tensor =
            Tensor::new(&lcg_values(5, 6), vec![6], DType::BF16, Device::Xpu).expect("tensor");
        let engine = engine();
        assert!(engine.to_plan_bf16(tensor.storage()).changed());
        assert!(tensor.descriptor().managed_by_engine);
        assert!(engine.to_plain_fp32(tensor.storage()).changed());
        let descriptor = tensor.descriptor();
        assert_eq!(descriptor.physical_repr, PhysicalRepr::BFloat16Plan);
        assert!(!descriptor.managed_by_engine);
        assert_eq!(tensor.dtype(), DType::BF16);
    }

    #[test]
    fn empty_storage_falls_back_to_full_precision() {
        let tensor = Tensor::from_f32(Vec::new(), vec![0, 3], Device::Xpu).expect("tensor");
        let outcome = engine().to_plan_bf16(tensor.storage());
        assert!(matches!(
            outcome,
            ReorderOutcome::FellBack(ReorderError::EmptyStorage { .. })
        ));
        assert_eq!(tensor.descriptor().physical_repr, PhysicalRepr::FullPrecision);
    }

    #[test]
    fn slicing_under_auto_mix_tags_entire_storage() {
        let tensor =
            Tensor::from_f32(lcg_values(11, 1000), vec![10, 10, 10], Device::Xpu).expect("tensor");
        assert!(on_slice(&tensor, AUTO_MIX).changed());
        let slice = tensor
            .index_view(&[
                TensorIndex::Range { start: 3, end: 7 },
                TensorIndex::Range { start: 3, end: 7 },
                TensorIndex::Single(5),
            ])
            .expect("slice");
        assert!(tensor.descriptor().is_lazy_bf16());
        assert!(slice.descriptor().is_lazy_bf16());
        assert_eq!(slice.strides(), &[100, 10]);
    }

    #[test]
    fn slicing_cpu_or_disabled_is_a_no_op() {
        let cpu = Tensor::from_f32(lcg_values(1, 4), vec![4], Device::Cpu).expect("cpu");
        assert_eq!(on_slice(&cpu, AUTO_MIX), ReorderOutcome::Unchanged);
        let xpu = Tensor::from_f32(lcg_values(1, 4), vec![4], Device::Xpu).expect("xpu");
        assert_eq!(on_slice(&xpu, ModeContext::DISABLED), ReorderOutcome::Unchanged);
        assert!(!xpu.descriptor().is_bf16_tagged());
    }

    #[test]
    fn plain_read_converts_permanently() {
        let tensor = Tensor::from_f32(lcg_values(9, 8), vec![8], Device::Xpu).expect("tensor");
        let _ = engine().to_plan_bf16(tensor.storage());
        let view = tensor.narrow_view(0, 2, 3).expect("view");
        let values = read_plain(&view);
        assert_eq!(values.len(), 3);
        assert!(!tensor.descriptor().is_bf16_tagged());
        assert_eq!(on_plain_read(&tensor), ReorderOutcome::Unchanged);
    }

    #[test]
    fn second_operand_conforms_to_first() {
        let lhs = Tensor::from_f32(lcg_values(2, 4), vec![4], Device::Xpu).expect("lhs");
        let rhs = Tensor::from_f32(lcg_values(4, 4), vec![4], Device::Xpu).expect("rhs");
        let _ = engine().to_plan_bf16(lhs.storage());
        assert!(conform_second_operand(&lhs, &rhs).changed());
        assert!(rhs.descriptor().is_bf16_tagged());

        let plain = Tensor::from_f32(lcg_values(6, 4), vec![4], Device::Xpu).expect("plain");
        assert!(conform_second_operand(&plain, &lhs).changed());
        assert!(!lhs.descriptor().is_bf16_tagged());
        assert!(!plain.descriptor().is_bf16_tagged());
    }

    #[test]
    fn equality_helpers_read_plain() {
        let values = lcg_values(13, 6);
        let a = Tensor::from_f32(values.clone(), vec![6], Device::Xpu).expect("a");
        let b = Tensor::from_f32(values, vec![6], Device::Cpu).expect("b");
        let _ = engine().to_plan_bf16(a.storage());
        assert!(allclose(&a, &b, 1e-2, 1e-2));
        assert!(!a.descriptor().is_bf16_tagged());
        assert!(equal(&a, &a));
        assert!(matches!(item(&a), Err(ReorderError::NotScalar { numel: 6 })));
    }

    #[test]
    fn materialize_builds_requested_representation() {
        let values = lcg_values(17, 6);
        let tagged = engine()
            .materialize(
                &values,
                vec![2, 3],
                Device::Xpu,
                bfmix_core::StorageDescriptor {
                    physical_repr: PhysicalRepr::BFloat16Plan,
                    managed_by_engine: true,
                    logical_dtype: DType::F32,
                },
            )
            .expect("materialize");
        assert!(tagged.descriptor().is_lazy_bf16());
        assert_eq!(tagged.dtype(), DType::F32);
        assert_eq!(tagged.shape(), &[2, 3]);
    }

    proptest! {
        #[test]
        fn prop_reorders_preserve_view_geometry(len in 1usize..64, block in 1usize..9) {
            let tensor = Tensor::from_f32(lcg_values(len as u64, len), vec![len], Device::Xpu)
                .expect("tensor");
            let view = tensor.narrow_view(0, len / 2, len - len / 2).expect("view");
            let before = (view.shape().to_vec(), view.strides().to_vec(), view.storage_offset());
            let engine = ReorderEngine::new(block).expect("engine");
            let _ = engine.to_plan_bf16(tensor.storage());
            prop_assert_eq!(
                (view.shape().to_vec(), view.strides().to_vec(), view.storage_offset()),
                before.clone()
            );
            let _ = engine.to_plain_fp32(view.storage());
            prop_assert_eq!(
                (view.shape().to_vec(), view.strides().to_vec(), view.storage_offset()),
                before
            );
        }

        #[test]
        fn prop_round_trip_equals_single_rounding(values in prop::collection::vec(-1.0e4f32..1.0e4f32, 1..32)) {
            let tensor = Tensor::from_f32(values.clone(), vec![values.len()], Device::Xpu)
                .expect("tensor");
            let engine = ReorderEngine::new(16).expect("engine");
            let _ = engine.to_plan_bf16(tensor.storage());
            let _ = engine.to_plain_fp32(tensor.storage());
            let expected: Vec<f32> = values.iter().copied().map(round_to_bf16).collect();
            prop_assert_eq!(tensor.gather_f32(), expected);
        }
    }
}
