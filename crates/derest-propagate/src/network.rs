//! Network description: an ordered list of layers, each a closed [`LayerKind`].
//!
//! Shapes are not stored on the layers. They are derived from
//! [`Network::input_shape`] when a [`crate::PropagationEngine`] is built.

use derest_core::{DerestError, Result};
use ndarray::{Array1, Array2, Array4, ArrayViewD, ArrayViewMutD};

/// A feed-forward network with optional Inception (branch/merge) blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    pub name: String,
    /// Shape of one input sample, without a batch axis.
    pub input_shape: Vec<usize>,
    pub layers: Vec<LayerDescriptor>,
}

/// A named layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerDescriptor {
    pub name: String,
    pub kind: LayerKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    FullyConnected(FullyConnected),
    Convolutional(Convolutional),
    Pooling(Pooling),
    Norm(LocalResponseNorm),
    ReLU,
    Softmax,
    Dropout(Dropout),
    Inception(Inception),
}

impl LayerKind {
    /// Kind tag, as used by the JSON network format.
    pub fn tag(&self) -> &'static str {
        match self {
            LayerKind::FullyConnected(_) => "fully_connected",
            LayerKind::Convolutional(_) => "convolutional",
            LayerKind::Pooling(p) => match p.mode {
                PoolMode::Max => "max_pool",
                PoolMode::Avg => "avg_pool",
            },
            LayerKind::Norm(_) => "norm",
            LayerKind::ReLU => "relu",
            LayerKind::Softmax => "softmax",
            LayerKind::Dropout(_) => "dropout",
            LayerKind::Inception(_) => "inception",
        }
    }

    /// Whether the layer carries a prunable weight tensor.
    pub fn is_weighted(&self) -> bool {
        matches!(
            self,
            LayerKind::FullyConnected(_) | LayerKind::Convolutional(_)
        )
    }
}

/// Dense layer: `y = x · W + b` with `W` of shape `(n_in, n_out)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FullyConnected {
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
}

impl FullyConnected {
    pub fn new(weights: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if bias.len() != weights.ncols() {
            return Err(DerestError::shape_mismatch(&[weights.ncols()], &[bias.len()]));
        }
        Ok(Self { weights, bias })
    }

    /// Dense layer with a zero bias.
    pub fn without_bias(weights: Array2<f32>) -> Self {
        let bias = Array1::zeros(weights.ncols());
        Self { weights, bias }
    }

    pub fn n_in(&self) -> usize {
        self.weights.nrows()
    }

    pub fn n_out(&self) -> usize {
        self.weights.ncols()
    }
}

/// 2-D convolution (cross-correlation) over `(channels, height, width)`.
///
/// `weights` has shape `(c_out, c_in / groups, fh, fw)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Convolutional {
    pub weights: Array4<f32>,
    pub bias: Array1<f32>,
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
}

impl Convolutional {
    pub fn new(
        weights: Array4<f32>,
        bias: Array1<f32>,
        stride: usize,
        padding: usize,
        groups: usize,
    ) -> Result<Self> {
        let conv = Self {
            weights,
            bias,
            stride,
            padding,
            groups,
        };
        conv.validate()?;
        Ok(conv)
    }

    pub fn validate(&self) -> Result<()> {
        let c_out = self.c_out();
        if self.stride == 0 {
            return Err(DerestError::InvalidConfig("convolution stride must be positive".into()));
        }
        if self.groups == 0 || c_out % self.groups != 0 {
            return Err(DerestError::InvalidConfig(format!(
                "{c_out} output channels cannot be split into {} group(s)",
                self.groups
            )));
        }
        if self.bias.len() != c_out {
            return Err(DerestError::shape_mismatch(&[c_out], &[self.bias.len()]));
        }
        Ok(())
    }

    /// Stride 1, no padding, one group, zero bias.
    pub fn simple(weights: Array4<f32>) -> Self {
        let bias = Array1::zeros(weights.shape()[0]);
        Self {
            weights,
            bias,
            stride: 1,
            padding: 0,
            groups: 1,
        }
    }

    pub fn c_out(&self) -> usize {
        self.weights.shape()[0]
    }

    /// Input channels seen by one filter.
    pub fn c_in_per_group(&self) -> usize {
        self.weights.shape()[1]
    }

    pub fn filter_size(&self) -> (usize, usize) {
        (self.weights.shape()[2], self.weights.shape()[3])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    Max,
    Avg,
}

/// Square pooling window over `(channels, height, width)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Pooling {
    pub mode: PoolMode,
    pub pool_size: usize,
    pub stride: usize,
    pub padding: usize,
}

impl Pooling {
    /// Non-overlapping pooling: stride equals the pool size.
    pub fn new(mode: PoolMode, pool_size: usize) -> Self {
        Self {
            mode,
            pool_size,
            stride: pool_size,
            padding: 0,
        }
    }

    pub fn max(pool_size: usize) -> Self {
        Self::new(PoolMode::Max, pool_size)
    }

    pub fn avg(pool_size: usize) -> Self {
        Self::new(PoolMode::Avg, pool_size)
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    /// Every window must overlap at least one real input cell.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 || self.stride == 0 {
            return Err(DerestError::InvalidConfig(format!(
                "pool size {} and stride {} must be positive",
                self.pool_size, self.stride
            )));
        }
        if self.padding >= self.pool_size {
            return Err(DerestError::InvalidConfig(format!(
                "padding {} must be smaller than the pool size {}",
                self.padding, self.pool_size
            )));
        }
        Ok(())
    }
}

/// Local response normalization across channels:
/// `y_c = x_c / (k + α Σ_{j∈W(c)} x_j²)^β`.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalResponseNorm {
    pub local_range: usize,
    pub k: f32,
    pub alpha: f32,
    pub beta: f32,
}

impl Default for LocalResponseNorm {
    fn default() -> Self {
        Self {
            local_range: 5,
            k: 1.0,
            alpha: 1e-4,
            beta: 0.75,
        }
    }
}

impl LocalResponseNorm {
    pub fn new(local_range: usize, k: f32, alpha: f32, beta: f32) -> Result<Self> {
        let norm = Self {
            local_range,
            k,
            alpha,
            beta,
        };
        norm.validate()?;
        Ok(norm)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_range == 0 {
            return Err(DerestError::InvalidConfig("LRN local range must be positive".into()));
        }
        if !(self.k > 0.0) || !(self.alpha >= 0.0) || !(self.beta >= 0.0) {
            return Err(DerestError::DomainViolation(format!(
                "LRN needs k > 0, alpha >= 0, beta >= 0 (got k={}, alpha={}, beta={})",
                self.k, self.alpha, self.beta
            )));
        }
        Ok(())
    }

    /// Channels `[c - r/2, c + r/2] ∩ [0, channels)` normalizing channel `c`.
    pub fn window(&self, c: usize, channels: usize) -> std::ops::Range<usize> {
        let half = self.local_range / 2;
        c.saturating_sub(half)..(c + half + 1).min(channels)
    }
}

/// Evaluation-mode dropout: scales by `1 - p_dropout`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dropout {
    pub p_dropout: f32,
}

impl Default for Dropout {
    fn default() -> Self {
        Self { p_dropout: 0.5 }
    }
}

impl Dropout {
    pub fn new(p_dropout: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&p_dropout) {
            return Err(DerestError::DomainViolation(format!(
                "dropout probability must be in [0, 1), got {p_dropout}"
            )));
        }
        Ok(Self { p_dropout })
    }

    pub fn keep(&self) -> f32 {
        1.0 - self.p_dropout
    }
}

/// Parallel branches over one input, concatenated on the channel axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Inception {
    pub branches: Vec<Branch>,
}

/// One Inception branch. An empty branch is the identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub name: String,
    pub layers: Vec<LayerDescriptor>,
}

impl Branch {
    pub fn new(name: impl Into<String>, layers: Vec<LayerDescriptor>) -> Self {
        Self {
            name: name.into(),
            layers,
        }
    }
}

impl LayerDescriptor {
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn fully_connected(name: impl Into<String>, layer: FullyConnected) -> Self {
        Self::new(name, LayerKind::FullyConnected(layer))
    }

    pub fn convolutional(name: impl Into<String>, layer: Convolutional) -> Self {
        Self::new(name, LayerKind::Convolutional(layer))
    }

    pub fn pooling(name: impl Into<String>, layer: Pooling) -> Self {
        Self::new(name, LayerKind::Pooling(layer))
    }

    pub fn norm(name: impl Into<String>, layer: LocalResponseNorm) -> Self {
        Self::new(name, LayerKind::Norm(layer))
    }

    pub fn relu(name: impl Into<String>) -> Self {
        Self::new(name, LayerKind::ReLU)
    }

    pub fn softmax(name: impl Into<String>) -> Self {
        Self::new(name, LayerKind::Softmax)
    }

    pub fn dropout(name: impl Into<String>, layer: Dropout) -> Self {
        Self::new(name, LayerKind::Dropout(layer))
    }

    pub fn inception(name: impl Into<String>, branches: Vec<Branch>) -> Self {
        Self::new(name, LayerKind::Inception(Inception { branches }))
    }

    /// Weight tensor of a weighted layer.
    pub fn weights(&self) -> Option<ArrayViewD<'_, f32>> {
        match &self.kind {
            LayerKind::FullyConnected(fc) => Some(fc.weights.view().into_dyn()),
            LayerKind::Convolutional(conv) => Some(conv.weights.view().into_dyn()),
            _ => None,
        }
    }

    pub fn weights_mut(&mut self) -> Option<ArrayViewMutD<'_, f32>> {
        match &mut self.kind {
            LayerKind::FullyConnected(fc) => Some(fc.weights.view_mut().into_dyn()),
            LayerKind::Convolutional(conv) => Some(conv.weights.view_mut().into_dyn()),
            _ => None,
        }
    }
}

/// Path of a nested layer: `parent/branch/name`.
pub fn layer_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// A weighted layer found by a depth-first walk.
#[derive(Debug, Clone)]
pub struct WeightedLayer<'a> {
    pub path: String,
    pub weights: ArrayViewD<'a, f32>,
}

impl Network {
    pub fn new(name: impl Into<String>, input_shape: Vec<usize>, layers: Vec<LayerDescriptor>) -> Self {
        Self {
            name: name.into(),
            input_shape,
            layers,
        }
    }

    /// Weighted layers in depth-first declaration order, Inception branches
    /// included.
    pub fn weighted_layers(&self) -> Vec<WeightedLayer<'_>> {
        fn walk<'a>(layers: &'a [LayerDescriptor], prefix: &str, out: &mut Vec<WeightedLayer<'a>>) {
            for layer in layers {
                let path = layer_path(prefix, &layer.name);
                if let LayerKind::Inception(inc) = &layer.kind {
                    for branch in &inc.branches {
                        walk(&branch.layers, &layer_path(&path, &branch.name), out);
                    }
                } else if let Some(weights) = layer.weights() {
                    out.push(WeightedLayer { path, weights });
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.layers, "", &mut out);
        out
    }

    /// Mutable weight tensors, in the same order as [`Network::weighted_layers`].
    pub fn weights_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        fn walk<'a>(layers: &'a mut [LayerDescriptor], out: &mut Vec<ArrayViewMutD<'a, f32>>) {
            for layer in layers {
                match &mut layer.kind {
                    LayerKind::Inception(inc) => {
                        for branch in &mut inc.branches {
                            walk(&mut branch.layers, out);
                        }
                    }
                    LayerKind::FullyConnected(fc) => out.push(fc.weights.view_mut().into_dyn()),
                    LayerKind::Convolutional(conv) => {
                        out.push(conv.weights.view_mut().into_dyn())
                    }
                    _ => {}
                }
            }
        }
        let mut out = Vec::new();
        walk(&mut self.layers, &mut out);
        out
    }

    /// Total number of prunable weights.
    pub fn weight_count(&self) -> usize {
        self.weighted_layers().iter().map(|l| l.weights.len()).sum()
    }

    /// Number of layer nodes, counting nested layers and Inception blocks.
    pub fn node_count(&self) -> usize {
        fn count(layers: &[LayerDescriptor]) -> usize {
            layers
                .iter()
                .map(|l| match &l.kind {
                    LayerKind::Inception(inc) => {
                        1 + inc.branches.iter().map(|b| count(&b.layers)).sum::<usize>()
                    }
                    _ => 1,
                })
                .sum()
        }
        count(&self.layers)
    }
}
