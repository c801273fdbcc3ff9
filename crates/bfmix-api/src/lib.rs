#![forbid(unsafe_code)]

//! Public surface of the lazy mixed-precision runtime.
//!
//! Scoped toggles come from the mode stack, non-scoped setters replace this
//! thread's base frame, and [`Session`] records dispatch and backward
//! evidence the way a training loop sees it.

use std::collections::BTreeMap;
use std::path::Path;

use bfmix_autograd::{AutogradError, BackwardReport, NodeId, OperationEvent, Tape};
use bfmix_core::{DType, Device, ExecutionMode, Tensor, TensorError};
use bfmix_kernel_cpu::{BatchNormParams, Conv2dParams, ConvTranspose2dParams, PoolParams};
use bfmix_nn::{Module, ModuleError};
use bfmix_runtime::{EvidenceEntry, EvidenceKind, ModeContext, RuntimeContext, Settings};

pub use bfmix_autograd::{BackwardStep, GradTag, SchedulerTelemetry};
pub use bfmix_core::{PhysicalRepr, StorageDescriptor, TensorIndex};
pub use bfmix_device::{DeviceError, to_device, to_dtype};
pub use bfmix_dispatch::{
    DispatchError, DispatchPath, add_, bmm_out, mm_out, mul_, narrow, relu_, select, sigmoid_,
    slice,
};
pub use bfmix_reorder::{allclose, equal, item, read_plain, to_plain_fp32, to_plan_bf16};
pub use bfmix_runtime::{
    AutocastScope, ModeGuard, current, enter, enter_auto_mix, enter_engine, is_autocast_enabled,
};
pub use bfmix_serialize::{
    DecodeMode, SerializeError, load_state_dict, load_tensor, save_state_dict, save_tensor,
};

/// True when the storage behind `tensor` physically holds bf16. Never
/// reorders.
#[must_use]
pub fn is_bf16_tagged(tensor: &Tensor) -> bool {
    tensor.descriptor().is_bf16_tagged()
}

/// Framework autocast for the accelerator device. While the scope lives,
/// compute operators on `xpu` tensors run in `dtype`.
pub fn autocast(enabled: bool, dtype: DType, cache_enabled: bool) -> AutocastScope {
    bfmix_runtime::push_autocast(Device::Xpu, enabled, dtype, cache_enabled)
}

/// `autocast(true, BF16, true)`.
pub fn autocast_bf16() -> AutocastScope {
    autocast(true, DType::BF16, true)
}

/// Non-scoped setter of this thread's base frame. A reduced-precision dtype
/// turns auto-mix on; anything else turns it off. The engine toggle is left as
/// is. Returns the previous base frame.
pub fn enable_auto_mix_precision(mixed_dtype: Option<DType>, train: bool) -> ModeContext {
    let base = bfmix_runtime::base_mode();
    tracing::debug!(
        target: "bfmix::api",
        mixed_dtype = ?mixed_dtype,
        train,
        "enable_auto_mix_precision"
    );
    bfmix_runtime::set_base_mode(ModeContext {
        engine_enabled: base.engine_enabled,
        auto_mix_enabled: mixed_dtype.is_some_and(DType::is_reduced_precision),
        mode: ExecutionMode::from_train(train),
    })
}

/// Like [`enable_auto_mix_precision`], also enabling the engine when a
/// mixed dtype is given.
pub fn enable_auto_optimization(mixed_dtype: Option<DType>, train: bool) -> ModeContext {
    let previous = bfmix_runtime::base_mode();
    if mixed_dtype.is_some() {
        bfmix_runtime::set_base_mode(ModeContext {
            engine_enabled: true,
            ..previous
        });
    }
    enable_auto_mix_precision(mixed_dtype, train);
    previous
}

/// Mixed dtype of the effective frame.
#[must_use]
pub fn get_auto_mix_precision() -> Option<DType> {
    current().auto_mix_enabled.then_some(DType::BF16)
}

#[must_use]
pub fn get_train() -> bool {
    current().is_training()
}

/// Tape plus evidence ledger for one training or inference run.
#[derive(Debug, Clone)]
pub struct Session {
    tape: Tape,
    runtime: RuntimeContext,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(*Settings::global())
    }

    #[must_use]
    pub fn with_settings(settings: Settings) -> Self {
        if settings.show_option() {
            for line in settings.option_lines() {
                tracing::info!(target: "bfmix::settings", "{line}");
            }
        }
        Self {
            tape: Tape::new(),
            runtime: RuntimeContext::new(settings),
        }
    }

    #[must_use]
    pub fn tape(&self) -> &Tape {
        &self.tape
    }

    /// Drops the recorded graph; evidence is kept.
    pub fn reset_tape(&mut self) {
        self.tape = Tape::new();
    }

    /// Switches this thread's base frame and records the policy change.
    pub fn enable_auto_mix_precision(&mut self, mixed_dtype: Option<DType>, train: bool) {
        enable_auto_mix_precision(mixed_dtype, train);
        self.runtime.record_mode_change(bfmix_runtime::base_mode());
    }

    pub fn enable_auto_optimization(&mut self, mixed_dtype: Option<DType>, train: bool) {
        enable_auto_optimization(mixed_dtype, train);
        self.runtime.record_mode_change(bfmix_runtime::base_mode());
    }

    pub fn variable(
        &mut self,
        values: &[f32],
        shape: Vec<usize>,
        requires_grad: bool,
    ) -> Result<NodeId, TensorError> {
        self.tensor_variable(values, shape, DType::F32, Device::Xpu, requires_grad)
    }

    pub fn tensor_variable(
        &mut self,
        values: &[f32],
        shape: Vec<usize>,
        dtype: DType,
        device: Device,
        requires_grad: bool,
    ) -> Result<NodeId, TensorError> {
        let tensor = Tensor::new(values, shape, dtype, device)?.with_requires_grad(requires_grad);
        Ok(self.tape.leaf(tensor))
    }

    pub fn leaf(&mut self, tensor: Tensor) -> NodeId {
        self.tape.leaf(tensor)
    }

    pub fn tensor(&self, node: NodeId) -> Result<&Tensor, AutogradError> {
        self.tape.tensor(node)
    }

    /// Logical values of `node`. This is a plain access: an engine-managed
    /// storage is reverted first.
    pub fn values(&self, node: NodeId) -> Result<Vec<f32>, AutogradError> {
        Ok(bfmix_reorder::read_plain(self.tape.tensor(node)?))
    }

    pub fn is_bf16_tagged(&self, node: NodeId) -> Result<bool, AutogradError> {
        Ok(is_bf16_tagged(self.tape.tensor(node)?))
    }

    pub fn conv2d(
        &mut self,
        input: NodeId,
        weight: NodeId,
        bias: Option<NodeId>,
        params: &Conv2dParams,
    ) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.conv2d(input, weight, bias, params)?;
        Ok(self.record_operation(recorded))
    }

    pub fn conv_transpose2d(
        &mut self,
        input: NodeId,
        weight: NodeId,
        bias: Option<NodeId>,
        params: &ConvTranspose2dParams,
    ) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.conv_transpose2d(input, weight, bias, params)?;
        Ok(self.record_operation(recorded))
    }

    pub fn linear(
        &mut self,
        input: NodeId,
        weight: NodeId,
        bias: Option<NodeId>,
    ) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.linear(input, weight, bias)?;
        Ok(self.record_operation(recorded))
    }

    pub fn mm(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.mm(lhs, rhs)?;
        Ok(self.record_operation(recorded))
    }

    pub fn bmm(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.bmm(lhs, rhs)?;
        Ok(self.record_operation(recorded))
    }

    pub fn addmm(
        &mut self,
        input: NodeId,
        lhs: NodeId,
        rhs: NodeId,
        beta: f32,
        alpha: f32,
    ) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.addmm(input, lhs, rhs, beta, alpha)?;
        Ok(self.record_operation(recorded))
    }

    pub fn addbmm(
        &mut self,
        input: NodeId,
        lhs: NodeId,
        rhs: NodeId,
        beta: f32,
        alpha: f32,
    ) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.addbmm(input, lhs, rhs, beta, alpha)?;
        Ok(self.record_operation(recorded))
    }

    pub fn baddbmm(
        &mut self,
        input: NodeId,
        lhs: NodeId,
        rhs: NodeId,
        beta: f32,
        alpha: f32,
    ) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.baddbmm(input, lhs, rhs, beta, alpha)?;
        Ok(self.record_operation(recorded))
    }

    pub fn batch_norm(
        &mut self,
        input: NodeId,
        weight: Option<NodeId>,
        bias: Option<NodeId>,
        running_mean: Option<&Tensor>,
        running_var: Option<&Tensor>,
        params: &BatchNormParams,
    ) -> Result<NodeId, AutogradError> {
        let recorded =
            self.tape
                .batch_norm(input, weight, bias, running_mean, running_var, params)?;
        Ok(self.record_operation(recorded))
    }

    pub fn max_pool(&mut self, input: NodeId, params: &PoolParams) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.max_pool(input, params)?;
        Ok(self.record_operation(recorded))
    }

    pub fn avg_pool(&mut self, input: NodeId, params: &PoolParams) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.avg_pool(input, params)?;
        Ok(self.record_operation(recorded))
    }

    pub fn adaptive_avg_pool2d(
        &mut self,
        input: NodeId,
        output_size: [usize; 2],
    ) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.adaptive_avg_pool2d(input, output_size)?;
        Ok(self.record_operation(recorded))
    }

    pub fn relu(&mut self, input: NodeId) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.relu(input)?;
        Ok(self.record_operation(recorded))
    }

    pub fn gelu(&mut self, input: NodeId) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.gelu(input)?;
        Ok(self.record_operation(recorded))
    }

    pub fn sigmoid(&mut self, input: NodeId) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.sigmoid(input)?;
        Ok(self.record_operation(recorded))
    }

    pub fn softmax(&mut self, input: NodeId, dim: usize) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.softmax(input, dim)?;
        Ok(self.record_operation(recorded))
    }

    pub fn index_select(
        &mut self,
        input: NodeId,
        dim: usize,
        indices: &[usize],
    ) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.index_select(input, dim, indices)?;
        Ok(self.record_operation(recorded))
    }

    pub fn add(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.add(lhs, rhs)?;
        Ok(self.record_operation(recorded))
    }

    pub fn mul(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.mul(lhs, rhs)?;
        Ok(self.record_operation(recorded))
    }

    pub fn sub(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.sub(lhs, rhs)?;
        Ok(self.record_operation(recorded))
    }

    pub fn div(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.div(lhs, rhs)?;
        Ok(self.record_operation(recorded))
    }

    pub fn sum(&mut self, input: NodeId) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.sum(input)?;
        Ok(self.record_operation(recorded))
    }

    pub fn clone_node(&mut self, input: NodeId) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.clone_node(input)?;
        Ok(self.record_operation(recorded))
    }

    pub fn cat(&mut self, parts: &[NodeId], dim: usize) -> Result<NodeId, AutogradError> {
        let recorded = self.tape.cat(parts, dim)?;
        Ok(self.record_operation(recorded))
    }

    /// Runs `module` on the session tape.
    pub fn forward<M: Module + ?Sized>(
        &mut self,
        module: &M,
        input: NodeId,
    ) -> Result<NodeId, ModuleError> {
        let before = self.tape.node_count();
        let out = module.forward(&mut self.tape, input)?;
        self.runtime.ledger_mut().record(
            EvidenceKind::Dispatch,
            format!(
                "module forward input={} out={} recorded_nodes={}",
                input.0,
                out.0,
                self.tape.node_count() - before
            ),
        );
        Ok(out)
    }

    pub fn backward(&mut self, root: NodeId) -> Result<BackwardReport, AutogradError> {
        let report = self.tape.backward(root)?;
        self.record_backward(root, &report);
        Ok(report)
    }

    pub fn backward_with_grad(
        &mut self,
        root: NodeId,
        seed: Vec<f32>,
    ) -> Result<BackwardReport, AutogradError> {
        let report = self.tape.backward_with_grad(root, seed)?;
        self.record_backward(root, &report);
        Ok(report)
    }

    /// Loads a state dict, recording durability evidence when the payload
    /// is rejected.
    pub fn load_checkpoint(
        &mut self,
        path: impl AsRef<Path>,
        mode: DecodeMode,
    ) -> Result<BTreeMap<String, Tensor>, SerializeError> {
        bfmix_serialize::load_state_dict(path, mode).inspect_err(|error| {
            let label = match mode {
                DecodeMode::Strict => "strict",
                DecodeMode::Hardened => "hardened",
            };
            self.runtime.record_checkpoint_decode_failure(label, error);
        })
    }

    #[must_use]
    pub fn gradient<'a>(&self, report: &'a BackwardReport, node: NodeId) -> Option<&'a Tensor> {
        report.gradient(node)
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.ledger().len()
    }

    #[must_use]
    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    fn record_backward(&mut self, root: NodeId, report: &BackwardReport) {
        self.runtime.ledger_mut().record(
            EvidenceKind::Backward,
            format!(
                "root={} backward_steps={} queue_pushes={} queue_pops={} max_queue_len={}",
                root.0,
                report.steps.len(),
                report.telemetry.queue_pushes,
                report.telemetry.queue_pops,
                report.telemetry.max_queue_len
            ),
        );
    }

    fn record_operation(&mut self, (out, event): (NodeId, OperationEvent)) -> NodeId {
        let decision = event.decision;
        let fingerprint = self
            .tape
            .tensor(out)
            .map_or(0, Tensor::evidence_fingerprint64);
        self.runtime.ledger_mut().record(
            EvidenceKind::Dispatch,
            format!(
                "op={} out={} path={} mode={:?} kernel={} key={:?} backend={:?} keyset=0x{:016x} fallback={} autocast={:?} fingerprint=0x{fingerprint:016x}",
                event.op.name(),
                out.0,
                decision.path.name(),
                decision.mode.mode,
                decision.kernel,
                decision.selected_key,
                decision.backend_key,
                decision.keyset_bits,
                decision.fallback_used,
                decision.autocast
            ),
        );
        if self.runtime.records_reorders() {
            let tagged = self
                .tape
                .tensor(out)
                .map(is_bf16_tagged)
                .unwrap_or(false);
            self.runtime
                .record_reorder(format!("op={} out={} tagged={tagged}", event.op.name(), out.0));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use bfmix_core::{DType, PhysicalRepr};
    use bfmix_runtime::{EvidenceKind, Settings, reset_base_mode};

    use super::{
        DecodeMode, Session, autocast_bf16, current, enable_auto_mix_precision,
        enable_auto_optimization, enter, get_auto_mix_precision, get_train, is_autocast_enabled,
    };

    fn session() -> Session {
        Session::with_settings(Settings::builder().build())
    }

    #[test]
    fn session_records_dispatch_and_backward_evidence() {
        let mut session = session();
        let _mode = enter(false, false, false);
        let x = session
            .variable(&[1.0, 2.0, 3.0, 4.0], vec![2, 2], true)
            .expect("x");
        let y = session
            .variable(&[0.5, -1.0, 2.0, 0.0], vec![2, 2], true)
            .expect("y");
        let z = session.mm(x, y).expect("mm");
        let loss = session.sum(z).expect("sum");
        let report = session.backward(loss).expect("backward");
        assert!(session.gradient(&report, x).is_some());

        let ledger = session.runtime().ledger();
        assert_eq!(ledger.entries_of(EvidenceKind::Dispatch).count(), 2);
        assert_eq!(ledger.entries_of(EvidenceKind::Backward).count(), 1);
        let first = ledger
            .entries_of(EvidenceKind::Dispatch)
            .next()
            .expect("dispatch entry");
        assert!(first.summary.contains("op=mm"));
        assert!(first.summary.contains("path=reference"));
    }

    #[test]
    fn verbose_sessions_record_reorder_evidence() {
        let mut session = Session::with_settings(Settings::builder().verbose_level(1).build());
        let _mode = enter(true, true, false);
        let x = session
            .variable(&[1.0, 2.0, 3.0, 4.0], vec![1, 4], false)
            .expect("x");
        let w = session
            .variable(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0], vec![2, 4], false)
            .expect("w");
        let y = session.linear(x, w, None).expect("linear");
        assert!(session.is_bf16_tagged(y).expect("tagged"));
        assert!(session.is_bf16_tagged(x).expect("x tagged"));
        let reorder = session
            .runtime()
            .ledger()
            .entries_of(EvidenceKind::Reorder)
            .next()
            .expect("reorder entry");
        assert!(reorder.summary.contains("tagged=true"));
    }

    #[test]
    fn values_is_a_plain_read() {
        let mut session = session();
        let _mode = enter(true, true, false);
        let x = session.variable(&[1.001, 2.0], vec![1, 2], false).expect("x");
        let w = session.variable(&[1.0, 1.0], vec![1, 2], false).expect("w");
        let y = session.linear(x, w, None).expect("linear");
        assert!(session.is_bf16_tagged(y).expect("tagged"));
        let values = session.values(y).expect("values");
        assert_eq!(values.len(), 1);
        assert!(!session.is_bf16_tagged(y).expect("reverted"));
        assert_eq!(
            session.tensor(y).expect("y").descriptor().physical_repr,
            PhysicalRepr::FullPrecision
        );
    }

    #[test]
    fn enable_auto_mix_precision_replaces_base_frame() {
        reset_base_mode();
        let mut session = session();
        let before = session.evidence_len();
        session.enable_auto_mix_precision(Some(DType::BF16), true);
        assert_eq!(get_auto_mix_precision(), Some(DType::BF16));
        assert!(get_train());
        assert_eq!(session.evidence_len(), before + 1);

        {
            let _scoped = enter(false, false, false);
            assert_eq!(get_auto_mix_precision(), None);
        }
        assert_eq!(get_auto_mix_precision(), Some(DType::BF16));

        let previous = enable_auto_mix_precision(None, false);
        assert!(previous.auto_mix_enabled);
        assert_eq!(get_auto_mix_precision(), None);
        assert!(!get_train());
        reset_base_mode();
    }

    #[test]
    fn enable_auto_optimization_turns_the_engine_on() {
        reset_base_mode();
        enable_auto_optimization(Some(DType::BF16), false);
        let ctx = current();
        assert!(ctx.engine_enabled);
        assert!(ctx.auto_mix_active());
        reset_base_mode();
    }

    #[test]
    fn rejected_checkpoint_records_durability_evidence() {
        let mut session = session();
        let path = std::env::temp_dir().join(format!(
            "bfmix-api-{}-rejected-checkpoint.json",
            std::process::id()
        ));
        std::fs::write(&path, "{\"schema_version\":1,\"bogus\":true}").expect("write");
        let err = session
            .load_checkpoint(&path, DecodeMode::Hardened)
            .expect_err("payload should be rejected");
        let _ = std::fs::remove_file(&path);

        let entry = session
            .runtime()
            .ledger()
            .entries_of(EvidenceKind::Durability)
            .next()
            .expect("durability entry");
        assert!(entry.summary.contains("mode=hardened"));
        assert!(entry.summary.contains(&err.to_string()));
    }

    #[test]
    fn autocast_scope_targets_xpu_only() {
        assert!(!is_autocast_enabled(bfmix_core::Device::Xpu));
        {
            let scope = autocast_bf16();
            assert_eq!(scope.state().dtype, DType::BF16);
            assert!(is_autocast_enabled(bfmix_core::Device::Xpu));
            assert!(!is_autocast_enabled(bfmix_core::Device::Cpu));
        }
        assert!(!is_autocast_enabled(bfmix_core::Device::Xpu));
    }
}
