#![forbid(unsafe_code)]

//! Reverse mode over dispatched tensor operations.
//!
//! Every recorded node remembers the storage descriptor its tensor had right
//! after the interceptor consumed it ([`GradTag`]). Gradients are accumulated
//! in f32 and materialized per tag: bf16 tagged tensors receive bf16 rounded,
//! engine-managed gradients with the same logical dtype.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

use bfmix_core::{PhysicalRepr, StorageDescriptor, Tensor};
use bfmix_dispatch::{self as dispatch, DispatchDecision, DispatchError, DispatchOutcome, OpKind, Saved};
use bfmix_kernel_cpu::{
    self as kernel, BatchNormParams, BinaryOp, Conv2dParams, ConvTranspose2dParams, KernelError,
    PoolKind, PoolParams,
};
use bfmix_reorder::{ReorderEngine, ReorderError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Representation of a node's storage as seen by the last operator that
/// consumed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradTag {
    pub descriptor: StorageDescriptor,
}

impl GradTag {
    #[must_use]
    pub fn capture(tensor: &Tensor) -> Self {
        Self {
            descriptor: tensor.descriptor(),
        }
    }

    /// Descriptor a gradient for the tagged tensor is materialized with.
    #[must_use]
    pub fn gradient_descriptor(&self) -> StorageDescriptor {
        if self.descriptor.is_bf16_tagged() {
            StorageDescriptor {
                physical_repr: PhysicalRepr::BFloat16Plan,
                managed_by_engine: true,
                logical_dtype: self.descriptor.logical_dtype,
            }
        } else {
            StorageDescriptor::plain(self.descriptor.logical_dtype)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum NodeOp {
    Leaf,
    Conv2d {
        input: NodeId,
        weight: NodeId,
        bias: Option<NodeId>,
        params: Conv2dParams,
    },
    ConvTranspose2d {
        input: NodeId,
        weight: NodeId,
        bias: Option<NodeId>,
        params: ConvTranspose2dParams,
    },
    Linear {
        input: NodeId,
        weight: NodeId,
        bias: Option<NodeId>,
    },
    Matmul {
        batched: bool,
        lhs: NodeId,
        rhs: NodeId,
    },
    ScaledMatmul {
        op: OpKind,
        input: NodeId,
        lhs: NodeId,
        rhs: NodeId,
        beta: f32,
        alpha: f32,
    },
    BatchNorm {
        input: NodeId,
        weight: Option<NodeId>,
        bias: Option<NodeId>,
        training: bool,
    },
    Pool {
        input: NodeId,
        kind: PoolKind,
        params: PoolParams,
    },
    AdaptiveAvgPool2d {
        input: NodeId,
        output_size: [usize; 2],
    },
    Relu {
        input: NodeId,
    },
    Gelu {
        input: NodeId,
    },
    Sigmoid {
        input: NodeId,
    },
    Softmax {
        input: NodeId,
        dim: usize,
    },
    IndexSelect {
        input: NodeId,
        dim: usize,
        indices: Vec<usize>,
    },
    Binary {
        op: BinaryOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    Sum {
        input: NodeId,
    },
    Clone {
        input: NodeId,
    },
    Cat {
        parts: Vec<NodeId>,
        dim: usize,
    },
}

impl NodeOp {
    fn inputs(&self) -> Vec<NodeId> {
        match self {
            Self::Leaf => Vec::new(),
            Self::Conv2d {
                input, weight, bias, ..
            }
            | Self::ConvTranspose2d {
                input, weight, bias, ..
            }
            | Self::Linear {
                input,
                weight,
                bias,
            } => std::iter::once(*input)
                .chain(std::iter::once(*weight))
                .chain(*bias)
                .collect(),
            Self::Matmul { lhs, rhs, .. } | Self::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Self::ScaledMatmul {
                input, lhs, rhs, ..
            } => vec![*input, *lhs, *rhs],
            Self::BatchNorm {
                input,
                weight,
                bias,
                ..
            } => std::iter::once(*input)
                .chain(*weight)
                .chain(*bias)
                .collect(),
            Self::Pool { input, .. }
            | Self::AdaptiveAvgPool2d { input, .. }
            | Self::Relu { input }
            | Self::Gelu { input }
            | Self::Sigmoid { input }
            | Self::Softmax { input, .. }
            | Self::IndexSelect { input, .. }
            | Self::Sum { input }
            | Self::Clone { input } => vec![*input],
            Self::Cat { parts, .. } => parts.clone(),
        }
    }

    fn rule(&self) -> &'static str {
        match self {
            Self::Leaf => "leaf",
            Self::Conv2d { .. } => "conv2d_backward",
            Self::ConvTranspose2d { .. } => "conv_transpose2d_backward",
            Self::Linear { .. } => "linear_backward",
            Self::Matmul { batched: false, .. } => "mm_backward",
            Self::Matmul { batched: true, .. } => "bmm_backward",
            Self::ScaledMatmul { op, .. } => match op {
                OpKind::Addbmm => "addbmm_backward",
                OpKind::Baddbmm => "baddbmm_backward",
                _ => "addmm_backward",
            },
            Self::BatchNorm { .. } => "batch_norm_backward",
            Self::Pool { .. } => "pool_backward",
            Self::AdaptiveAvgPool2d { .. } => "adaptive_avg_pool2d_backward",
            Self::Relu { .. } => "relu_backward",
            Self::Gelu { .. } => "gelu_backward",
            Self::Sigmoid { .. } => "sigmoid_backward",
            Self::Softmax { .. } => "softmax_backward",
            Self::IndexSelect { .. } => "index_select_backward",
            Self::Binary { .. } => "binary_backward",
            Self::Sum { .. } => "sum_backward",
            Self::Clone { .. } => "identity",
            Self::Cat { .. } => "split",
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    tensor: Tensor,
    version: u64,
    requires_grad: bool,
    op: NodeOp,
    operands: Vec<(Tensor, u64)>,
    saved: Saved,
    tag: GradTag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerTelemetry {
    pub execution_order: Vec<NodeId>,
    pub queue_pushes: usize,
    pub queue_pops: usize,
    pub max_queue_len: usize,
    pub dependency_snapshot: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyTask {
    node: NodeId,
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.node.0.cmp(&other.node.0)
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct ReadyQueue {
    heap: BinaryHeap<ReadyTask>,
    pushes: usize,
    pops: usize,
    max_len: usize,
}

impl ReadyQueue {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            ..Self::default()
        }
    }

    fn push(&mut self, node: NodeId) {
        self.heap.push(ReadyTask { node });
        self.pushes += 1;
        self.max_len = self.max_len.max(self.heap.len());
    }

    fn pop(&mut self) -> Option<NodeId> {
        let next = self.heap.pop().map(|task| task.node);
        if next.is_some() {
            self.pops += 1;
        }
        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationEvent {
    pub op: OpKind,
    pub out: NodeId,
    pub decision: DispatchDecision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackwardStep {
    pub node: NodeId,
    pub rule: &'static str,
}

#[derive(Debug, Clone)]
pub struct BackwardReport {
    gradients: Vec<Option<Tensor>>,
    pub steps: Vec<BackwardStep>,
    pub telemetry: SchedulerTelemetry,
}

impl BackwardReport {
    #[must_use]
    pub fn gradient(&self, node: NodeId) -> Option<&Tensor> {
        self.gradients.get(node.0).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn gradients(&self) -> &[Option<Tensor>] {
        &self.gradients
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AutogradError {
    UnknownNode(NodeId),
    Dispatch(DispatchError),
    Kernel(KernelError),
    Reorder(ReorderError),
    DependencyUnderflow { node: NodeId },
    NonScalarRoot { numel: usize },
    SeedLengthMismatch { expected: usize, actual: usize },
    ModifiedInPlace { node: NodeId, saved: u64, current: u64 },
}

impl fmt::Display for AutogradError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode(node) => write!(f, "unknown node id {}", node.0),
            Self::Dispatch(error) => write!(f, "dispatch failure: {error}"),
            Self::Kernel(error) => write!(f, "backward kernel failure: {error}"),
            Self::Reorder(error) => write!(f, "gradient materialization failure: {error}"),
            Self::DependencyUnderflow { node } => {
                write!(f, "dependency scheduler underflow at node {}", node.0)
            }
            Self::NonScalarRoot { numel } => write!(
                f,
                "backward without an explicit gradient needs a scalar root, got {numel} elements"
            ),
            Self::SeedLengthMismatch { expected, actual } => write!(
                f,
                "root gradient has {actual} elements, root has {expected}"
            ),
            Self::ModifiedInPlace {
                node,
                saved,
                current,
            } => write!(
                f,
                "a tensor saved by node {} was modified in place (version {saved} -> {current})",
                node.0
            ),
        }
    }
}

impl std::error::Error for AutogradError {}

impl From<DispatchError> for AutogradError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<KernelError> for AutogradError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<ReorderError> for AutogradError {
    fn from(value: ReorderError) -> Self {
        Self::Reorder(value)
    }
}

type Recorded = Result<(NodeId, OperationEvent), AutogradError>;

#[derive(Debug, Clone, Default)]
pub struct Tape {
    nodes: Vec<Node>,
}

impl Tape {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Registers `tensor` as a leaf. Gradients are kept when the tensor
    /// requires grad.
    pub fn leaf(&mut self, tensor: Tensor) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            version: tensor.version(),
            requires_grad: tensor.requires_grad(),
            op: NodeOp::Leaf,
            operands: Vec::new(),
            saved: Saved::None,
            tag: GradTag::capture(&tensor),
            tensor,
        });
        id
    }

    /// Leaf bound to `tensor`, registering it on first use. A parameter read
    /// several times in one forward pass accumulates into a single gradient.
    pub fn parameter(&mut self, tensor: &Tensor) -> NodeId {
        match self.leaf_for(tensor) {
            Some(id) => id,
            None => self.leaf(tensor.clone()),
        }
    }

    #[must_use]
    pub fn leaf_for(&self, tensor: &Tensor) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|node| matches!(node.op, NodeOp::Leaf) && node.tensor.id() == tensor.id())
            .map(NodeId)
    }

    pub fn tensor(&self, node: NodeId) -> Result<&Tensor, AutogradError> {
        Ok(&self.node(node)?.tensor)
    }

    pub fn tag(&self, node: NodeId) -> Result<GradTag, AutogradError> {
        Ok(self.node(node)?.tag)
    }

    pub fn requires_grad(&self, node: NodeId) -> Result<bool, AutogradError> {
        Ok(self.node(node)?.requires_grad)
    }

    fn optional(&self, node: Option<NodeId>) -> Result<Option<&Tensor>, AutogradError> {
        node.map(|id| self.tensor(id)).transpose()
    }

    fn record(&mut self, op: NodeOp, outcome: DispatchOutcome) -> (NodeId, OperationEvent) {
        let inputs = op.inputs();
        // Reorders done by the interceptor are visible through the inputs'
        // shared storage, so the tag is taken now.
        for input in &inputs {
            let node = &mut self.nodes[input.0];
            node.tag = GradTag::capture(&node.tensor);
        }
        let requires_grad = inputs.iter().any(|input| self.nodes[input.0].requires_grad);
        let out = NodeId(self.nodes.len());
        let event = OperationEvent {
            op: outcome.decision.op,
            out,
            decision: outcome.decision,
        };
        let tensor = outcome.tensor.with_requires_grad(requires_grad);
        let operands = outcome
            .operands
            .into_iter()
            .map(|operand| {
                let version = operand.version();
                (operand, version)
            })
            .collect();
        self.nodes.push(Node {
            version: tensor.version(),
            requires_grad,
            op,
            operands,
            saved: outcome.saved,
            tag: GradTag::capture(&tensor),
            tensor,
        });
        (out, event)
    }

    pub fn conv2d(
        &mut self,
        input: NodeId,
        weight: NodeId,
        bias: Option<NodeId>,
        params: &Conv2dParams,
    ) -> Recorded {
        let outcome = dispatch::conv2d(
            self.tensor(input)?,
            self.tensor(weight)?,
            self.optional(bias)?,
            params,
        )?;
        let op = NodeOp::Conv2d {
            input,
            weight,
            bias,
            params: *params,
        };
        Ok(self.record(op, outcome))
    }

    pub fn conv_transpose2d(
        &mut self,
        input: NodeId,
        weight: NodeId,
        bias: Option<NodeId>,
        params: &ConvTranspose2dParams,
    ) -> Recorded {
        let outcome = dispatch::conv_transpose2d(
            self.tensor(input)?,
            self.tensor(weight)?,
            self.optional(bias)?,
            params,
        )?;
        let op = NodeOp::ConvTranspose2d {
            input,
            weight,
            bias,
            params: *params,
        };
        Ok(self.record(op, outcome))
    }

    pub fn linear(&mut self, input: NodeId, weight: NodeId, bias: Option<NodeId>) -> Recorded {
        let outcome = dispatch::linear(
            self.tensor(input)?,
            self.tensor(weight)?,
            self.optional(bias)?,
        )?;
        Ok(self.record(
            NodeOp::Linear {
                input,
                weight,
                bias,
            },
            outcome,
        ))
    }

    pub fn mm(&mut self, lhs: NodeId, rhs: NodeId) -> Recorded {
        let outcome = dispatch::mm(self.tensor(lhs)?, self.tensor(rhs)?)?;
        Ok(self.record(
            NodeOp::Matmul {
                batched: false,
                lhs,
                rhs,
            },
            outcome,
        ))
    }

    pub fn bmm(&mut self, lhs: NodeId, rhs: NodeId) -> Recorded {
        let outcome = dispatch::bmm(self.tensor(lhs)?, self.tensor(rhs)?)?;
        Ok(self.record(
            NodeOp::Matmul {
                batched: true,
                lhs,
                rhs,
            },
            outcome,
        ))
    }

    pub fn addmm(
        &mut self,
        input: NodeId,
        lhs: NodeId,
        rhs: NodeId,
        beta: f32,
        alpha: f32,
    ) -> Recorded {
        let outcome = dispatch::addmm(
            self.tensor(input)?,
            self.tensor(lhs)?,
            self.tensor(rhs)?,
            beta,
            alpha,
        )?;
        Ok(self.scaled(OpKind::Addmm, input, lhs, rhs, beta, alpha, outcome))
    }

    pub fn addbmm(
        &mut self,
        input: NodeId,
        lhs: NodeId,
        rhs: NodeId,
        beta: f32,
        alpha: f32,
    ) -> Recorded {
        let outcome = dispatch::addbmm(
            self.tensor(input)?,
            self.tensor(lhs)?,
            self.tensor(rhs)?,
            beta,
            alpha,
        )?;
        Ok(self.scaled(OpKind::Addbmm, input, lhs, rhs, beta, alpha, outcome))
    }

    pub fn baddbmm(
        &mut self,
        input: NodeId,
        lhs: NodeId,
        rhs: NodeId,
        beta: f32,
        alpha: f32,
    ) -> Recorded {
        let outcome = dispatch::baddbmm(
            self.tensor(input)?,
            self.tensor(lhs)?,
            self.tensor(rhs)?,
            beta,
            alpha,
        )?;
        Ok(self.scaled(OpKind::Baddbmm, input, lhs, rhs, beta, alpha, outcome))
    }

    #[allow(clippy::too_many_arguments)]
    fn scaled(
        &mut self,
        op: OpKind,
        input: NodeId,
        lhs: NodeId,
        rhs: NodeId,
        beta: f32,
        alpha: f32,
        outcome: DispatchOutcome,
    ) -> (NodeId, OperationEvent) {
        self.record(
            NodeOp::ScaledMatmul {
                op,
                input,
                lhs,
                rhs,
                beta,
                alpha,
            },
            outcome,
        )
    }

    /// Running statistics are plain tensors outside the graph.
    pub fn batch_norm(
        &mut self,
        input: NodeId,
        weight: Option<NodeId>,
        bias: Option<NodeId>,
        running_mean: Option<&Tensor>,
        running_var: Option<&Tensor>,
        params: &BatchNormParams,
    ) -> Recorded {
        let outcome = dispatch::batch_norm(
            self.tensor(input)?,
            self.optional(weight)?,
            self.optional(bias)?,
            running_mean,
            running_var,
            params,
        )?;
        Ok(self.record(
            NodeOp::BatchNorm {
                input,
                weight,
                bias,
                training: params.training,
            },
            outcome,
        ))
    }

    pub fn avg_pool(&mut self, input: NodeId, params: &PoolParams) -> Recorded {
        let outcome = dispatch::avg_pool(self.tensor(input)?, params)?;
        let op = NodeOp::Pool {
            input,
            kind: PoolKind::Avg,
            params: params.clone(),
        };
        Ok(self.record(op, outcome))
    }

    pub fn max_pool(&mut self, input: NodeId, params: &PoolParams) -> Recorded {
        let outcome = dispatch::max_pool(self.tensor(input)?, params)?;
        let op = NodeOp::Pool {
            input,
            kind: PoolKind::Max,
            params: params.clone(),
        };
        Ok(self.record(op, outcome))
    }

    pub fn adaptive_avg_pool2d(&mut self, input: NodeId, output_size: [usize; 2]) -> Recorded {
        let outcome = dispatch::adaptive_avg_pool2d(self.tensor(input)?, output_size)?;
        Ok(self.record(NodeOp::AdaptiveAvgPool2d { input, output_size }, outcome))
    }

    pub fn relu(&mut self, input: NodeId) -> Recorded {
        let outcome = dispatch::relu(self.tensor(input)?)?;
        Ok(self.record(NodeOp::Relu { input }, outcome))
    }

    pub fn gelu(&mut self, input: NodeId) -> Recorded {
        let outcome = dispatch::gelu(self.tensor(input)?)?;
        Ok(self.record(NodeOp::Gelu { input }, outcome))
    }

    pub fn sigmoid(&mut self, input: NodeId) -> Recorded {
        let outcome = dispatch::sigmoid(self.tensor(input)?)?;
        Ok(self.record(NodeOp::Sigmoid { input }, outcome))
    }

    pub fn softmax(&mut self, input: NodeId, dim: usize) -> Recorded {
        let outcome = dispatch::softmax(self.tensor(input)?, dim)?;
        Ok(self.record(NodeOp::Softmax { input, dim }, outcome))
    }

    pub fn index_select(&mut self, input: NodeId, dim: usize, indices: &[usize]) -> Recorded {
        let outcome = dispatch::index_select(self.tensor(input)?, dim, indices)?;
        let op = NodeOp::IndexSelect {
            input,
            dim,
            indices: indices.to_vec(),
        };
        Ok(self.record(op, outcome))
    }

    pub fn add(&mut self, lhs: NodeId, rhs: NodeId) -> Recorded {
        let outcome = dispatch::add(self.tensor(lhs)?, self.tensor(rhs)?)?;
        Ok(self.binary(BinaryOp::Add, lhs, rhs, outcome))
    }

    pub fn mul(&mut self, lhs: NodeId, rhs: NodeId) -> Recorded {
        let outcome = dispatch::mul(self.tensor(lhs)?, self.tensor(rhs)?)?;
        Ok(self.binary(BinaryOp::Mul, lhs, rhs, outcome))
    }

    pub fn sub(&mut self, lhs: NodeId, rhs: NodeId) -> Recorded {
        let outcome = dispatch::sub(self.tensor(lhs)?, self.tensor(rhs)?)?;
        Ok(self.binary(BinaryOp::Sub, lhs, rhs, outcome))
    }

    pub fn div(&mut self, lhs: NodeId, rhs: NodeId) -> Recorded {
        let outcome = dispatch::div(self.tensor(lhs)?, self.tensor(rhs)?)?;
        Ok(self.binary(BinaryOp::Div, lhs, rhs, outcome))
    }

    fn binary(
        &mut self,
        op: BinaryOp,
        lhs: NodeId,
        rhs: NodeId,
        outcome: DispatchOutcome,
    ) -> (NodeId, OperationEvent) {
        self.record(NodeOp::Binary { op, lhs, rhs }, outcome)
    }

    pub fn sum(&mut self, input: NodeId) -> Recorded {
        let outcome = dispatch::sum(self.tensor(input)?)?;
        Ok(self.record(NodeOp::Sum { input }, outcome))
    }

    pub fn clone_node(&mut self, input: NodeId) -> Recorded {
        let outcome = dispatch::clone(self.tensor(input)?)?;
        Ok(self.record(NodeOp::Clone { input }, outcome))
    }

    pub fn cat(&mut self, parts: &[NodeId], dim: usize) -> Recorded {
        let tensors = parts
            .iter()
            .map(|part| self.tensor(*part))
            .collect::<Result<Vec<_>, _>>()?;
        let outcome = dispatch::cat(&tensors, dim)?;
        let op = NodeOp::Cat {
            parts: parts.to_vec(),
            dim,
        };
        Ok(self.record(op, outcome))
    }

    /// Backward from a scalar root with seed gradient 1.
    pub fn backward(&self, root: NodeId) -> Result<BackwardReport, AutogradError> {
        let numel = self.tensor(root)?.numel();
        if numel != 1 {
            return Err(AutogradError::NonScalarRoot { numel });
        }
        self.backward_with_grad(root, vec![1.0])
    }

    pub fn backward_with_grad(
        &self,
        root: NodeId,
        seed: Vec<f32>,
    ) -> Result<BackwardReport, AutogradError> {
        let expected = self.tensor(root)?.numel();
        if seed.len() != expected {
            return Err(AutogradError::SeedLengthMismatch {
                expected,
                actual: seed.len(),
            });
        }

        let reachable = self.compute_reachable(root)?;
        let mut pending = self.compute_dependencies(&reachable)?;

        let mut grads: Vec<Option<Vec<f32>>> = vec![None; self.nodes.len()];
        grads[root.0] = Some(seed);

        let mut queue = ReadyQueue::with_capacity(self.nodes.len().max(1));
        queue.push(root);

        let mut steps = Vec::with_capacity(self.nodes.len());
        let mut execution_order = Vec::with_capacity(self.nodes.len());

        while let Some(node_id) = queue.pop() {
            execution_order.push(node_id);
            let node = &self.nodes[node_id.0];
            let inputs = node.op.inputs();
            if node.requires_grad && !matches!(node.op, NodeOp::Leaf) {
                let incoming = grads[node_id.0]
                    .clone()
                    .unwrap_or_else(|| vec![0.0; node.tensor.numel()]);
                for (input, grad) in self.propagate(node_id, &incoming)? {
                    accumulate(&mut grads, input, grad);
                }
            }
            if node.requires_grad {
                steps.push(BackwardStep {
                    node: node_id,
                    rule: node.op.rule(),
                });
            }
            for input in inputs {
                Self::complete_dependency(&mut pending, input, &mut queue)?;
            }
        }

        let engine = ReorderEngine::default();
        let mut gradients = Vec::with_capacity(self.nodes.len());
        for (node, grad) in self.nodes.iter().zip(grads) {
            let materialized = match grad {
                Some(values) if node.requires_grad => Some(engine.materialize(
                    &values,
                    node.tensor.shape().to_vec(),
                    node.tensor.device(),
                    node.tag.gradient_descriptor(),
                )?),
                _ => None,
            };
            gradients.push(materialized);
        }

        tracing::debug!(
            target: "bfmix::autograd",
            root = root.0,
            nodes = execution_order.len(),
            queue_pushes = queue.pushes,
            "backward complete"
        );

        Ok(BackwardReport {
            gradients,
            steps,
            telemetry: SchedulerTelemetry {
                execution_order,
                queue_pushes: queue.pushes,
                queue_pops: queue.pops,
                max_queue_len: queue.max_len,
                dependency_snapshot: pending,
            },
        })
    }

    /// Saved operand `index` of `node`, rejected when it was modified in
    /// place after the forward pass.
    fn operand(&self, node: NodeId, index: usize) -> Result<&Tensor, AutogradError> {
        let (tensor, saved) = self
            .node(node)?
            .operands
            .get(index)
            .ok_or(AutogradError::UnknownNode(node))?;
        let current = tensor.version();
        if current != *saved {
            return Err(AutogradError::ModifiedInPlace {
                node,
                saved: *saved,
                current,
            });
        }
        Ok(tensor)
    }

    fn output(&self, node: NodeId) -> Result<&Tensor, AutogradError> {
        let entry = self.node(node)?;
        let current = entry.tensor.version();
        if current != entry.version {
            return Err(AutogradError::ModifiedInPlace {
                node,
                saved: entry.version,
                current,
            });
        }
        Ok(&entry.tensor)
    }

    /// Gradients flowing from `node` into each of its inputs.
    fn propagate(
        &self,
        node_id: NodeId,
        grad: &[f32],
    ) -> Result<Vec<(NodeId, Vec<f32>)>, AutogradError> {
        let node = self.node(node_id)?;
        let out_shape = node.tensor.shape();
        let values = |index: usize| -> Result<Vec<f32>, AutogradError> {
            Ok(self.operand(node_id, index)?.gather_f32())
        };
        let shape = |index: usize| -> Result<Vec<usize>, AutogradError> {
            Ok(self.operand(node_id, index)?.shape().to_vec())
        };
        let flows = match &node.op {
            NodeOp::Leaf => Vec::new(),
            NodeOp::Conv2d {
                input,
                weight,
                bias,
                params,
            } => {
                let (gi, gw, gb) = kernel::conv2d_backward(
                    grad,
                    &values(0)?,
                    &shape(0)?,
                    &values(1)?,
                    &shape(1)?,
                    params,
                )?;
                with_bias_grad(vec![(*input, gi), (*weight, gw)], *bias, gb)
            }
            NodeOp::ConvTranspose2d {
                input,
                weight,
                bias,
                params,
            } => {
                let (gi, gw, gb) = kernel::conv_transpose2d_backward(
                    grad,
                    &values(0)?,
                    &shape(0)?,
                    &values(1)?,
                    &shape(1)?,
                    params,
                )?;
                with_bias_grad(vec![(*input, gi), (*weight, gw)], *bias, gb)
            }
            NodeOp::Linear {
                input,
                weight,
                bias,
            } => {
                let (gi, gw, gb) = kernel::linear_backward(
                    grad,
                    &values(0)?,
                    &shape(0)?,
                    &values(1)?,
                    &shape(1)?,
                )?;
                with_bias_grad(vec![(*input, gi), (*weight, gw)], *bias, gb)
            }
            NodeOp::Matmul { batched, lhs, rhs } => {
                let backward = if *batched {
                    kernel::bmm_backward
                } else {
                    kernel::mm_backward
                };
                let (gl, gr) = backward(grad, &values(0)?, &shape(0)?, &values(1)?, &shape(1)?)?;
                vec![(*lhs, gl), (*rhs, gr)]
            }
            NodeOp::ScaledMatmul {
                op,
                input,
                lhs,
                rhs,
                beta,
                alpha,
            } => {
                let gi = kernel::scaled_input_backward(grad, out_shape, &shape(0)?, *beta)?;
                let lhs_shape = shape(1)?;
                let scaled: Vec<f32> = grad.iter().map(|g| g * alpha).collect();
                let (gl, gr) = match op {
                    OpKind::Addmm => kernel::mm_backward(
                        &scaled,
                        &values(1)?,
                        &lhs_shape,
                        &values(2)?,
                        &shape(2)?,
                    )?,
                    OpKind::Addbmm => {
                        // every batch receives the same output gradient
                        let batches = lhs_shape.first().copied().unwrap_or(0);
                        let repeated = scaled.repeat(batches);
                        kernel::bmm_backward(
                            &repeated,
                            &values(1)?,
                            &lhs_shape,
                            &values(2)?,
                            &shape(2)?,
                        )?
                    }
                    _ => kernel::bmm_backward(
                        &scaled,
                        &values(1)?,
                        &lhs_shape,
                        &values(2)?,
                        &shape(2)?,
                    )?,
                };
                vec![(*input, gi), (*lhs, gl), (*rhs, gr)]
            }
            NodeOp::BatchNorm {
                input,
                weight,
                bias,
                training,
            } => {
                let Saved::BatchNorm {
                    save_mean,
                    save_invstd,
                } = &node.saved
                else {
                    return Err(AutogradError::UnknownNode(node_id));
                };
                let weight_values = match weight {
                    Some(_) => Some(values(1)?),
                    None => None,
                };
                let (gi, gw, gb) = kernel::batch_norm_backward(
                    grad,
                    &values(0)?,
                    &shape(0)?,
                    weight_values.as_deref(),
                    save_mean,
                    save_invstd,
                    *training,
                )?;
                let mut flows = vec![(*input, gi)];
                flows.extend(weight.map(|w| (w, gw)));
                flows.extend(bias.map(|b| (b, gb)));
                flows
            }
            NodeOp::Pool {
                input,
                kind,
                params,
            } => {
                let argmax: &[usize] = match &node.saved {
                    Saved::Argmax(argmax) => argmax,
                    _ => &[],
                };
                let gi = kernel::pool_backward(*kind, grad, &shape(0)?, params, argmax)?;
                vec![(*input, gi)]
            }
            NodeOp::AdaptiveAvgPool2d { input, output_size } => {
                let gi = kernel::adaptive_avg_pool2d_backward(grad, &shape(0)?, *output_size)?;
                vec![(*input, gi)]
            }
            NodeOp::Relu { input } => vec![(*input, kernel::relu_backward(grad, &values(0)?)?)],
            NodeOp::Gelu { input } => vec![(*input, kernel::gelu_backward(grad, &values(0)?)?)],
            NodeOp::Sigmoid { input } => {
                let output = self.output(node_id)?.gather_f32();
                vec![(*input, kernel::sigmoid_backward(grad, &output)?)]
            }
            NodeOp::Softmax { input, dim } => {
                let output = self.output(node_id)?.gather_f32();
                let gi = kernel::softmax_backward(grad, &output, out_shape, *dim)?;
                vec![(*input, gi)]
            }
            NodeOp::IndexSelect {
                input,
                dim,
                indices,
            } => {
                let gi = kernel::index_select_backward(grad, &shape(0)?, *dim, indices)?;
                vec![(*input, gi)]
            }
            NodeOp::Binary { op, lhs, rhs } => {
                let (gl, gr) = kernel::binary_backward(
                    *op,
                    grad,
                    &values(0)?,
                    &shape(0)?,
                    &values(1)?,
                    &shape(1)?,
                )?;
                vec![(*lhs, gl), (*rhs, gr)]
            }
            NodeOp::Sum { input } => {
                let g = grad.first().copied().unwrap_or(0.0);
                vec![(*input, vec![g; self.node(*input)?.tensor.numel()])]
            }
            NodeOp::Clone { input } => vec![(*input, grad.to_vec())],
            NodeOp::Cat { parts, dim } => {
                let sizes = parts
                    .iter()
                    .map(|part| {
                        let tensor = &self.node(*part)?.tensor;
                        tensor
                            .shape()
                            .get(*dim)
                            .copied()
                            .ok_or(AutogradError::UnknownNode(*part))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let chunks = kernel::split_along(grad, out_shape, *dim, &sizes)?;
                parts.iter().copied().zip(chunks).collect()
            }
        };
        Ok(flows)
    }

    fn compute_reachable(&self, root: NodeId) -> Result<Vec<bool>, AutogradError> {
        let mut reachable = vec![false; self.nodes.len()];
        let mut stack = vec![root];

        while let Some(node) = stack.pop() {
            if node.0 >= self.nodes.len() {
                return Err(AutogradError::UnknownNode(node));
            }
            if reachable[node.0] {
                continue;
            }
            reachable[node.0] = true;
            stack.extend(self.nodes[node.0].op.inputs());
        }

        Ok(reachable)
    }

    fn compute_dependencies(&self, reachable: &[bool]) -> Result<Vec<usize>, AutogradError> {
        if reachable.len() != self.nodes.len() {
            return Err(AutogradError::DependencyUnderflow { node: NodeId(0) });
        }

        let mut pending = vec![0usize; self.nodes.len()];
        for (idx, node) in self.nodes.iter().enumerate() {
            if !reachable[idx] {
                continue;
            }
            for input in node.op.inputs() {
                pending[input.0] = pending[input.0].saturating_add(1);
            }
        }
        Ok(pending)
    }

    fn complete_dependency(
        pending: &mut [usize],
        node: NodeId,
        queue: &mut ReadyQueue,
    ) -> Result<(), AutogradError> {
        if pending[node.0] == 0 {
            return Err(AutogradError::DependencyUnderflow { node });
        }
        pending[node.0] -= 1;
        if pending[node.0] == 0 {
            queue.push(node);
        }
        Ok(())
    }

    fn node(&self, id: NodeId) -> Result<&Node, AutogradError> {
        self.nodes.get(id.0).ok_or(AutogradError::UnknownNode(id))
    }
}

fn with_bias_grad(
    mut flows: Vec<(NodeId, Vec<f32>)>,
    bias: Option<NodeId>,
    grad_bias: Vec<f32>,
) -> Vec<(NodeId, Vec<f32>)> {
    if let Some(bias) = bias {
        flows.push((bias, grad_bias));
    }
    flows
}

fn accumulate(grads: &mut [Option<Vec<f32>>], node: NodeId, values: Vec<f32>) {
    let slot = &mut grads[node.0];
    if let Some(existing) = slot.as_mut() {
        for (acc, value) in existing.iter_mut().zip(values) {
            *acc += value;
        }
    } else {
        *slot = Some(values);
    }
}

#[cfg(test)]
mod tests {
    use bfmix_core::{DType, Device, PhysicalRepr, Tensor, round_to_bf16};
    use bfmix_device::to_dtype;
    use bfmix_kernel_cpu::{self as kernel, BatchNormParams, Conv2dParams, PoolParams};
    use bfmix_runtime::{enter, enter_engine};
    use proptest::prelude::*;

    use super::{AutogradError, NodeId, Tape};

    fn ramp(len: usize, scale: f32) -> Vec<f32> {
        (0..len)
            .map(|i| ((i * 7 + 3) % 11) as f32 * scale - 5.0 * scale)
            .collect()
    }

    fn leaf(tape: &mut Tape, shape: &[usize], scale: f32) -> NodeId {
        let len = shape.iter().product();
        let tensor = Tensor::new(&ramp(len, scale), shape.to_vec(), DType::F32, Device::Xpu)
            .expect("tensor")
            .with_requires_grad(true);
        tape.leaf(tensor)
    }

    fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() <= tol * (1.0 + e.abs()), "{a} vs {e}");
        }
    }

    #[test]
    fn linear_gradients_match_reference_kernel() {
        let mut tape = Tape::new();
        let x = leaf(&mut tape, &[3, 4], 0.3);
        let w = leaf(&mut tape, &[2, 4], 0.2);
        let b = leaf(&mut tape, &[2], 0.1);
        let (y, event) = tape.linear(x, w, Some(b)).expect("linear");
        assert_eq!(event.out, y);
        let (loss, _) = tape.sum(y).expect("sum");
        let report = tape.backward(loss).expect("backward");

        let xv = tape.tensor(x).expect("x").gather_f32();
        let wv = tape.tensor(w).expect("w").gather_f32();
        let (gi, gw, gb) =
            kernel::linear_backward(&[1.0; 6], &xv, &[3, 4], &wv, &[2, 4]).expect("reference");
        assert_close(&report.gradient(x).expect("gx").gather_f32(), &gi, 1e-6);
        assert_close(&report.gradient(w).expect("gw").gather_f32(), &gw, 1e-6);
        assert_close(&report.gradient(b).expect("gb").gather_f32(), &gb, 1e-6);
        let gx = report.gradient(x).expect("gx");
        assert_eq!(gx.descriptor().physical_repr, PhysicalRepr::FullPrecision);
        assert_eq!(report.telemetry.execution_order.first(), Some(&loss));
    }

    #[test]
    fn auto_mix_gradients_are_lazy_bf16() {
        let _mode = enter(true, true, true);
        let mut tape = Tape::new();
        let x = leaf(&mut tape, &[1, 2, 4, 4], 0.1);
        let w = leaf(&mut tape, &[3, 2, 3, 3], 0.05);
        let (y, event) = tape
            .conv2d(x, w, None, &Conv2dParams::default())
            .expect("conv2d");
        assert_eq!(event.decision.kernel, "xpu::bf16");
        let (loss, _) = tape.sum(y).expect("sum");
        let report = tape.backward(loss).expect("backward");

        assert!(tape.tag(x).expect("tag").descriptor.is_lazy_bf16());
        let gx = report.gradient(x).expect("gx");
        assert_eq!(gx.dtype(), DType::F32);
        assert!(gx.descriptor().is_lazy_bf16());
        assert!(gx.descriptor().managed_by_engine);
        assert!(report.gradient(w).expect("gw").descriptor().is_lazy_bf16());
        for value in gx.gather_f32() {
            assert_eq!(value, round_to_bf16(value));
        }
    }

    #[test]
    fn manual_bf16_leaf_gets_bf16_gradient() {
        let _engine = enter_engine(true);
        let mut tape = Tape::new();
        let source = Tensor::new(&ramp(12, 0.3), vec![3, 4], DType::F32, Device::Xpu)
            .expect("source")
            .with_requires_grad(true);
        let x = tape.leaf(to_dtype(&source, DType::BF16).expect("cast"));
        let w_source = Tensor::new(&ramp(8, 0.2), vec![2, 4], DType::F32, Device::Xpu)
            .expect("w")
            .with_requires_grad(true);
        let w = tape.leaf(to_dtype(&w_source, DType::BF16).expect("cast"));
        let (y, event) = tape.linear(x, w, None).expect("linear");
        assert_eq!(event.decision.path, bfmix_dispatch::DispatchPath::ManualPrecision);
        let (loss, _) = tape.sum(y).expect("sum");
        let report = tape.backward(loss).expect("backward");
        let gx = report.gradient(x).expect("gx");
        assert_eq!(gx.dtype(), DType::BF16);
        assert!(gx.descriptor().managed_by_engine);
    }

    #[test]
    fn training_keeps_plain_data_driven_gradients() {
        let _mode = enter(true, true, true);
        let mut tape = Tape::new();
        let x = leaf(&mut tape, &[2, 6], 0.5);
        let (y, _) = tape.relu(x).expect("relu");
        let (loss, _) = tape.sum(y).expect("sum");
        let report = tape.backward(loss).expect("backward");
        let gx = report.gradient(x).expect("gx");
        assert_eq!(gx.descriptor().physical_repr, PhysicalRepr::FullPrecision);
        let expected: Vec<f32> = tape
            .tensor(x)
            .expect("x")
            .gather_f32()
            .iter()
            .map(|v| if *v > 0.0 { 1.0 } else { 0.0 })
            .collect();
        assert_eq!(gx.gather_f32(), expected);
    }

    #[test]
    fn shared_inputs_accumulate() {
        let mut tape = Tape::new();
        let x = leaf(&mut tape, &[4], 0.5);
        let (sq, _) = tape.mul(x, x).expect("mul");
        let (loss, _) = tape.sum(sq).expect("sum");
        let report = tape.backward(loss).expect("backward");
        let xv = tape.tensor(x).expect("x").gather_f32();
        let expected: Vec<f32> = xv.iter().map(|v| 2.0 * v).collect();
        assert_close(&report.gradient(x).expect("gx").gather_f32(), &expected, 1e-6);
        assert!(report.telemetry.dependency_snapshot.iter().all(|p| *p == 0));
    }

    #[test]
    fn in_place_update_of_saved_tensor_is_rejected() {
        let mut tape = Tape::new();
        let x = leaf(&mut tape, &[4], 0.5);
        let (y, _) = tape.relu(x).expect("relu");
        let (loss, _) = tape.sum(y).expect("sum");
        bfmix_dispatch::relu_(tape.tensor(x).expect("x")).expect("relu_");
        let err = tape.backward(loss).expect_err("modified input");
        assert!(matches!(err, AutogradError::ModifiedInPlace { node, .. } if node == y));
    }

    #[test]
    fn non_scalar_root_needs_explicit_gradient() {
        let mut tape = Tape::new();
        let x = leaf(&mut tape, &[3], 1.0);
        let (y, _) = tape.sigmoid(x).expect("sigmoid");
        assert!(matches!(
            tape.backward(y),
            Err(AutogradError::NonScalarRoot { numel: 3 })
        ));
        assert!(tape.backward_with_grad(y, vec![1.0]).is_err());
        let report = tape.backward_with_grad(y, vec![1.0; 3]).expect("seeded");
        assert_eq!(report.gradient(x).expect("gx").numel(), 3);
        assert!(tape.backward(NodeId(99)).is_err());
    }

    #[test]
    fn cat_splits_gradient_between_parts() {
        let mut tape = Tape::new();
        let a = leaf(&mut tape, &[2, 2], 1.0);
        let b = leaf(&mut tape, &[2, 3], 1.0);
        let (joined, _) = tape.cat(&[a, b], 1).expect("cat");
        let seed: Vec<f32> = (0..10).map(|v| v as f32).collect();
        let report = tape.backward_with_grad(joined, seed).expect("backward");
        assert_eq!(
            report.gradient(a).expect("ga").gather_f32(),
            vec![0.0, 1.0, 5.0, 6.0]
        );
        assert_eq!(
            report.gradient(b).expect("gb").gather_f32(),
            vec![2.0, 3.0, 4.0, 7.0, 8.0, 9.0]
        );
    }

    #[test]
    fn batch_norm_and_pool_chain_backpropagates() {
        let mut tape = Tape::new();
        let x = leaf(&mut tape, &[2, 2, 4, 4], 0.2);
        let gamma = tape.leaf(
            Tensor::full(vec![2], 1.0, DType::F32, Device::Xpu)
                .expect("gamma")
                .with_requires_grad(true),
        );
        let mean = Tensor::zeros(vec![2], DType::F32, Device::Xpu).expect("mean");
        let var = Tensor::full(vec![2], 1.0, DType::F32, Device::Xpu).expect("var");
        let (bn, _) = tape
            .batch_norm(
                x,
                Some(gamma),
                None,
                Some(&mean),
                Some(&var),
                &BatchNormParams::default(),
            )
            .expect("bn");
        let (pooled, _) = tape.max_pool(bn, &PoolParams::window(2, 2)).expect("pool");
        let (loss, _) = tape.sum(pooled).expect("sum");
        let report = tape.backward(loss).expect("backward");
        assert_eq!(report.gradient(x).expect("gx").numel(), 64);
        assert_eq!(report.gradient(gamma).expect("ggamma").numel(), 2);
        assert!(report.gradient(bn).is_some());
        assert_eq!(report.steps.last().map(|step| step.rule), Some("leaf"));
    }

    #[test]
    fn leaves_without_grad_get_none() {
        let mut tape = Tape::new();
        let x = leaf(&mut tape, &[2, 3], 0.5);
        let frozen = tape.leaf(
            Tensor::new(&ramp(12, 0.1), vec![3, 4], DType::F32, Device::Xpu).expect("frozen"),
        );
        let (y, _) = tape.mm(x, frozen).expect("mm");
        let (loss, _) = tape.sum(y).expect("sum");
        let report = tape.backward(loss).expect("backward");
        assert!(report.gradient(frozen).is_none());
        assert!(report.gradient(x).is_some());
        assert!(!tape.requires_grad(frozen).expect("frozen"));
    }

    proptest! {
        #[test]
        fn addmm_input_gradient_scales_with_beta(beta in -2.0f32..2.0, alpha in -2.0f32..2.0) {
            let mut tape = Tape::new();
            let input = leaf(&mut tape, &[2, 3], 0.5);
            let lhs = leaf(&mut tape, &[2, 4], 0.25);
            let rhs = leaf(&mut tape, &[4, 3], 0.25);
            let (out, _) = tape.addmm(input, lhs, rhs, beta, alpha).expect("addmm");
            let (loss, _) = tape.sum(out).expect("sum");
            let report = tape.backward(loss).expect("backward");
            let gi = report.gradient(input).expect("gi").gather_f32();
            for value in gi {
                prop_assert!((value - beta).abs() < 1e-6);
            }
        }
    }
}
