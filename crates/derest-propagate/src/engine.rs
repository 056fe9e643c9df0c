//! Propagation engine: one forward pass of activation bounds, one backward
//! pass of derivative bounds.
//!
//! [`PropagationEngine::new`] compiles a [`Network`] once: every layer (and
//! every layer nested in an Inception branch) becomes a node in an arena
//! indexed by [`NodeId`] in depth-first declaration order, with its shapes
//! and transform resolved. [`PropagationEngine::propagate`] then runs both
//! passes and returns a [`PropagationState`] holding, per node, the bound on
//! the node's input and the bound on the output sensitivity to the node's
//! output.

use crate::layers::{chw, LayerTransform};
use crate::network::{layer_path, LayerDescriptor, LayerKind, Network};
use derest_core::{DerestError, PropagationConfig, Result};
use derest_tensor::Interval;
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, trace};

/// Index of a layer node in the engine's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Static description of a compiled node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: NodeId,
    /// `parent/branch/name` for nested layers.
    pub path: String,
    pub kind: &'static str,
    /// 0 for top-level layers, +1 per enclosing Inception block.
    pub depth: usize,
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    /// Position among the weighted layers, if the node has weights.
    pub weighted_index: Option<usize>,
}

#[derive(Debug, Clone)]
struct Node {
    info: NodeInfo,
    /// `None` for Inception blocks, which the plan handles structurally.
    transform: Option<LayerTransform>,
}

#[derive(Debug, Clone)]
enum Step {
    Layer(NodeId),
    Inception {
        id: NodeId,
        branches: Vec<BranchPlan>,
    },
}

#[derive(Debug, Clone)]
struct BranchPlan {
    name: String,
    steps: Vec<Step>,
    /// Output channels contributed to the concatenation.
    width: usize,
}

/// Where a node is in the single-run life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStage {
    Unvisited,
    ActivationSet,
    DerivativeSet,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    activation: Option<Interval>,
    derivative: Option<Interval>,
}

impl Slot {
    fn stage(&self) -> NodeStage {
        match (&self.activation, &self.derivative) {
            (None, _) => NodeStage::Unvisited,
            (Some(_), None) => NodeStage::ActivationSet,
            (Some(_), Some(_)) => NodeStage::DerivativeSet,
        }
    }
}

/// Per-node bounds of one propagation run.
///
/// Only handed out after both passes succeed, so every slot is filled.
#[derive(Debug, Clone)]
pub struct PropagationState {
    slots: Vec<Slot>,
    output: Option<Interval>,
    input_derivative: Option<Interval>,
}

impl PropagationState {
    fn empty(nodes: usize) -> Self {
        Self {
            slots: vec![Slot::default(); nodes],
            output: None,
            input_derivative: None,
        }
    }

    fn slot(&self, id: NodeId) -> Result<&Slot> {
        self.slots
            .get(id.0)
            .ok_or_else(|| DerestError::PropagationOrder(format!("unknown node {id}")))
    }

    pub fn stage(&self, id: NodeId) -> Option<NodeStage> {
        self.slots.get(id.0).map(Slot::stage)
    }

    fn expect_stage(&self, id: NodeId, expected: NodeStage) -> Result<()> {
        let stage = self.slot(id)?.stage();
        if stage != expected {
            return Err(DerestError::PropagationOrder(format!(
                "node {id} is {stage:?}, expected {expected:?}"
            )));
        }
        Ok(())
    }

    fn set_activation(&mut self, id: NodeId, activation: Interval) -> Result<()> {
        self.expect_stage(id, NodeStage::Unvisited)?;
        self.slots[id.0].activation = Some(activation);
        Ok(())
    }

    fn set_derivative(&mut self, id: NodeId, derivative: Interval) -> Result<()> {
        self.expect_stage(id, NodeStage::ActivationSet)?;
        self.slots[id.0].derivative = Some(derivative);
        Ok(())
    }

    /// Bound on the node's input.
    pub fn activation(&self, id: NodeId) -> Option<&Interval> {
        self.slots.get(id.0)?.activation.as_ref()
    }

    /// Bound on the sensitivity of the network output to the node's output,
    /// shaped `(B, ...node output shape)`.
    pub fn derivative(&self, id: NodeId) -> Option<&Interval> {
        self.slots.get(id.0)?.derivative.as_ref()
    }

    /// Bound on the network output.
    pub fn output(&self) -> Option<&Interval> {
        self.output.as_ref()
    }

    /// Bound on the sensitivity of the network output to its input.
    pub fn input_derivative(&self) -> Option<&Interval> {
        self.input_derivative.as_ref()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Compiled network, ready to propagate bounds.
#[derive(Debug, Clone)]
pub struct PropagationEngine {
    name: String,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    nodes: Vec<Node>,
    plan: Vec<Step>,
    weighted: Vec<NodeId>,
    config: PropagationConfig,
}

struct Compiler {
    nodes: Vec<Node>,
    weighted: Vec<NodeId>,
}

impl Compiler {
    fn compile(
        &mut self,
        layers: &[LayerDescriptor],
        input_shape: Vec<usize>,
        prefix: &str,
        depth: usize,
    ) -> Result<(Vec<Step>, Vec<usize>)> {
        let mut shape = input_shape;
        let mut steps = Vec::with_capacity(layers.len());
        for (i, layer) in layers.iter().enumerate() {
            let id = NodeId(self.nodes.len());
            let path = layer_path(prefix, &layer.name);
            let closes_network = depth == 0 && i + 1 == layers.len();
            let (step, out) = self
                .compile_layer(layer, id, &path, shape, depth, closes_network)
                .map_err(|e| e.in_layer(id.0, &path))?;
            steps.push(step);
            shape = out;
        }
        Ok((steps, shape))
    }

    fn compile_layer(
        &mut self,
        layer: &LayerDescriptor,
        id: NodeId,
        path: &str,
        input_shape: Vec<usize>,
        depth: usize,
        closes_network: bool,
    ) -> Result<(Step, Vec<usize>)> {
        let info = NodeInfo {
            id,
            path: path.to_string(),
            kind: layer.kind.tag(),
            depth,
            input_shape: input_shape.clone(),
            output_shape: Vec::new(),
            weighted_index: None,
        };

        match &layer.kind {
            LayerKind::Inception(inception) => {
                if inception.branches.is_empty() {
                    return Err(DerestError::InvalidConfig(
                        "inception block without branches".into(),
                    ));
                }
                let [_, h, w] = chw(&input_shape, "inception")?;
                self.nodes.push(Node {
                    info,
                    transform: None,
                });

                let mut branches = Vec::with_capacity(inception.branches.len());
                for branch in &inception.branches {
                    let prefix = layer_path(path, &branch.name);
                    let (steps, out) =
                        self.compile(&branch.layers, input_shape.clone(), &prefix, depth + 1)?;
                    let [width, bh, bw] = chw(&out, "inception branch output")?;
                    if (bh, bw) != (h, w) {
                        return Err(DerestError::shape_mismatch(&[width, h, w], &out));
                    }
                    branches.push(BranchPlan {
                        name: branch.name.clone(),
                        steps,
                        width,
                    });
                }
                let channels = branches.iter().map(|b| b.width).sum();
                let out = vec![channels, h, w];
                self.nodes[id.0].info.output_shape = out.clone();
                Ok((Step::Inception { id, branches }, out))
            }
            kind => {
                if matches!(kind, LayerKind::Softmax) && !closes_network {
                    return Err(DerestError::UnsupportedLayerKind(format!(
                        "softmax layer '{path}' must be the last top-level layer"
                    )));
                }
                let (transform, out) = LayerTransform::build(kind, &input_shape)?;
                let weighted_index = kind.is_weighted().then(|| {
                    self.weighted.push(id);
                    self.weighted.len() - 1
                });
                self.nodes.push(Node {
                    info: NodeInfo {
                        output_shape: out.clone(),
                        weighted_index,
                        ..info
                    },
                    transform: Some(transform),
                });
                Ok((Step::Layer(id), out))
            }
        }
    }
}

impl PropagationEngine {
    /// Compile with the default configuration.
    pub fn new(network: &Network) -> Result<Self> {
        Self::with_config(network, PropagationConfig::default())
    }

    pub fn with_config(network: &Network, config: PropagationConfig) -> Result<Self> {
        if network.layers.is_empty() {
            return Err(DerestError::InvalidConfig(format!(
                "network '{}' has no layers",
                network.name
            )));
        }
        let mut compiler = Compiler {
            nodes: Vec::with_capacity(network.node_count()),
            weighted: Vec::new(),
        };
        let (plan, output_shape) =
            compiler.compile(&network.layers, network.input_shape.clone(), "", 0)?;
        debug!(
            "Compiled '{}': {} nodes, {} weighted, output shape {:?}",
            network.name,
            compiler.nodes.len(),
            compiler.weighted.len(),
            output_shape
        );
        Ok(Self {
            name: network.name.clone(),
            input_shape: network.input_shape.clone(),
            output_shape,
            nodes: compiler.nodes,
            plan,
            weighted: compiler.weighted,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes in depth-first declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> + '_ {
        self.nodes.iter().map(|n| &n.info)
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(id.0).map(|n| &n.info)
    }

    /// Look a node up by its path.
    pub fn find(&self, path: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| n.info.path == path)
            .map(|n| n.info.id)
    }

    pub fn transform(&self, id: NodeId) -> Option<&LayerTransform> {
        self.nodes.get(id.0)?.transform.as_ref()
    }

    /// Weighted nodes in depth-first declaration order.
    pub fn weighted_layers(&self) -> &[NodeId] {
        &self.weighted
    }

    /// Identity output-sensitivity seed: one exact unit row per output
    /// element, shaped `(n, ...output shape)`.
    pub fn identity_seed(&self) -> Result<Interval> {
        let n: usize = self.output_shape.iter().product();
        let mut shape = vec![n];
        shape.extend_from_slice(&self.output_shape);
        Interval::identity_seed(n).reshape(&shape)
    }

    /// Propagate with every input element in `[min, max]` and the identity
    /// seed.
    pub fn propagate_range(&self, min: f32, max: f32) -> Result<PropagationState> {
        let input = Interval::from_shape(&self.input_shape, min, max)?;
        self.propagate(&input, &self.identity_seed()?)
    }

    /// Run the forward and backward passes.
    ///
    /// `output_seed` has shape `(B, ...output shape)` with `B >= 1`. Nothing
    /// is returned unless both passes succeed.
    pub fn propagate(&self, input: &Interval, output_seed: &Interval) -> Result<PropagationState> {
        let start = Instant::now();
        if input.shape() != self.input_shape.as_slice() {
            return Err(DerestError::shape_mismatch(&self.input_shape, input.shape()));
        }
        let seed_shape = output_seed.shape();
        if seed_shape.len() != self.output_shape.len() + 1
            || seed_shape[1..] != self.output_shape[..]
            || seed_shape[0] == 0
        {
            let mut expected = vec![seed_shape.first().copied().unwrap_or(1).max(1)];
            expected.extend_from_slice(&self.output_shape);
            return Err(DerestError::shape_mismatch(&expected, seed_shape));
        }

        info!(
            "Propagating '{}': {} nodes, seed batch {}",
            self.name,
            self.nodes.len(),
            seed_shape[0]
        );
        let mut state = PropagationState::empty(self.nodes.len());
        let output = self.forward_steps(&self.plan, input.clone(), &mut state)?;
        let input_derivative = self.backward_steps(&self.plan, output_seed.clone(), &mut state)?;
        state.output = Some(output);
        state.input_derivative = Some(input_derivative);
        info!(
            "Propagation of '{}' finished in {:.1} ms",
            self.name,
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(state)
    }

    fn forward_steps(
        &self,
        steps: &[Step],
        mut current: Interval,
        state: &mut PropagationState,
    ) -> Result<Interval> {
        for step in steps {
            current = self.forward_step(step, current, state)?;
        }
        Ok(current)
    }

    fn forward_step(
        &self,
        step: &Step,
        input: Interval,
        state: &mut PropagationState,
    ) -> Result<Interval> {
        match step {
            Step::Layer(id) => {
                let node = &self.nodes[id.0];
                let wrap = |e: DerestError| e.in_layer(id.0, &node.info.path);
                let transform = node.transform.as_ref().ok_or_else(|| {
                    wrap(DerestError::PropagationOrder("layer without a transform".into()))
                })?;
                let output = transform.forward(&input, &self.config).map_err(wrap)?;
                state.set_activation(*id, input).map_err(wrap)?;
                debug!(
                    "forward {:<32} {:>14} out {:?} max width {:.3e}",
                    node.info.path,
                    node.info.kind,
                    output.shape(),
                    output.max_width()
                );
                Ok(output)
            }
            Step::Inception { id, branches } => {
                let path = &self.nodes[id.0].info.path;
                let mut outputs = Vec::with_capacity(branches.len());
                for branch in branches {
                    trace!("forward {path}: branch '{}'", branch.name);
                    outputs.push(self.forward_steps(&branch.steps, input.clone(), state)?);
                }
                let output =
                    Interval::concat(&outputs, 0).map_err(|e| e.in_layer(id.0, path))?;
                state
                    .set_activation(*id, input)
                    .map_err(|e| e.in_layer(id.0, path))?;
                debug!(
                    "forward {:<32} {:>14} out {:?} max width {:.3e}",
                    path,
                    "inception",
                    output.shape(),
                    output.max_width()
                );
                Ok(output)
            }
        }
    }

    fn backward_steps(
        &self,
        steps: &[Step],
        mut current: Interval,
        state: &mut PropagationState,
    ) -> Result<Interval> {
        for step in steps.iter().rev() {
            current = self.backward_step(step, current, state)?;
        }
        Ok(current)
    }

    fn backward_step(
        &self,
        step: &Step,
        derivative: Interval,
        state: &mut PropagationState,
    ) -> Result<Interval> {
        match step {
            Step::Layer(id) => {
                let node = &self.nodes[id.0];
                let wrap = |e: DerestError| e.in_layer(id.0, &node.info.path);
                state.expect_stage(*id, NodeStage::ActivationSet).map_err(wrap)?;
                let transform = node.transform.as_ref().ok_or_else(|| {
                    wrap(DerestError::PropagationOrder("layer without a transform".into()))
                })?;
                let upstream = {
                    let activation = state.activation(*id).ok_or_else(|| {
                        wrap(DerestError::PropagationOrder("missing activation".into()))
                    })?;
                    transform
                        .backward(activation, &derivative, &self.config)
                        .map_err(wrap)?
                };
                debug!(
                    "backward {:<31} {:>14} in {:?} max width {:.3e}",
                    node.info.path,
                    node.info.kind,
                    upstream.shape(),
                    upstream.max_width()
                );
                state.set_derivative(*id, derivative).map_err(wrap)?;
                Ok(upstream)
            }
            Step::Inception { id, branches } => {
                let path = &self.nodes[id.0].info.path;
                let wrap = |e: DerestError| e.in_layer(id.0, path);
                state.expect_stage(*id, NodeStage::ActivationSet).map_err(wrap)?;
                let mut offset = 0;
                let mut total: Option<Interval> = None;
                for branch in branches {
                    trace!(
                        "backward {path}: branch '{}' channels {}..{}",
                        branch.name,
                        offset,
                        offset + branch.width
                    );
                    let slice = derivative
                        .slice_axis(1, offset, offset + branch.width)
                        .map_err(wrap)?;
                    offset += branch.width;
                    let upstream = self.backward_steps(&branch.steps, slice, state)?;
                    total = Some(match total {
                        None => upstream,
                        Some(acc) => acc.add(&upstream).map_err(wrap)?,
                    });
                }
                let upstream = total.ok_or_else(|| {
                    wrap(DerestError::InvalidConfig("inception block without branches".into()))
                })?;
                state.set_derivative(*id, derivative).map_err(wrap)?;
                Ok(upstream)
            }
        }
    }
}
