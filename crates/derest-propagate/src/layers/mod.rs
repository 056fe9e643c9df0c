//! Per-kind forward (activation bound) and backward (derivative bound)
//! transforms.
//!
//! A [`LayerTransform`] is built once per layer by the engine, with the
//! layer's input shape already resolved. Forward maps the bound on the
//! layer's input to the bound on its output. Backward maps the bound on the
//! output sensitivity `(B, ...output shape)` to the bound on the input
//! sensitivity `(B, ...input shape)`, using the stored input bound where the
//! local derivative depends on it.

mod conv;
mod dropout;
mod fc;
mod norm;
mod pool;
mod relu;
mod softmax;

pub use conv::ConvTransform;
pub use dropout::DropoutTransform;
pub use fc::FcTransform;
pub use norm::{norm_neighbor_derivative, norm_output, norm_self_derivative, NormTransform};
pub use pool::PoolTransform;
pub use relu::relu_backward;
pub use softmax::softmax_forward;

use crate::network::LayerKind;
use derest_core::{DerestError, PropagationConfig, Result};
use derest_tensor::Interval;
use ndarray::{ArrayD, ArrayView3, ArrayView4, Ix3, Ix4};
use rayon::prelude::*;

/// Compiled transform for one non-composite layer.
#[derive(Debug, Clone)]
pub enum LayerTransform {
    FullyConnected(FcTransform),
    Convolutional(ConvTransform),
    Pooling(PoolTransform),
    Norm(NormTransform),
    ReLU,
    Softmax,
    Dropout(DropoutTransform),
}

impl LayerTransform {
    /// Resolve a layer against its input shape; returns the transform and
    /// the output shape.
    pub fn build(kind: &LayerKind, input_shape: &[usize]) -> Result<(Self, Vec<usize>)> {
        match kind {
            LayerKind::FullyConnected(fc) => {
                let t = FcTransform::new(fc, input_shape)?;
                let out = vec![t.n_out()];
                Ok((LayerTransform::FullyConnected(t), out))
            }
            LayerKind::Convolutional(conv) => {
                let t = ConvTransform::new(conv, input_shape)?;
                let out = t.output_shape().to_vec();
                Ok((LayerTransform::Convolutional(t), out))
            }
            LayerKind::Pooling(pool) => {
                let t = PoolTransform::new(pool, input_shape)?;
                let out = t.output_shape().to_vec();
                Ok((LayerTransform::Pooling(t), out))
            }
            LayerKind::Norm(lrn) => {
                let t = NormTransform::new(lrn, input_shape)?;
                Ok((LayerTransform::Norm(t), input_shape.to_vec()))
            }
            LayerKind::ReLU => Ok((LayerTransform::ReLU, input_shape.to_vec())),
            LayerKind::Softmax => {
                if input_shape.is_empty() {
                    return Err(DerestError::InvalidConfig(
                        "softmax needs at least one axis".into(),
                    ));
                }
                Ok((LayerTransform::Softmax, input_shape.to_vec()))
            }
            LayerKind::Dropout(d) => Ok((
                LayerTransform::Dropout(DropoutTransform::new(d)?),
                input_shape.to_vec(),
            )),
            LayerKind::Inception(_) => Err(DerestError::UnsupportedLayerKind(
                "inception blocks are composite and have no single transform".into(),
            )),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            LayerTransform::FullyConnected(_) => "fully_connected",
            LayerTransform::Convolutional(_) => "convolutional",
            LayerTransform::Pooling(p) => p.kind_name(),
            LayerTransform::Norm(_) => "norm",
            LayerTransform::ReLU => "relu",
            LayerTransform::Softmax => "softmax",
            LayerTransform::Dropout(_) => "dropout",
        }
    }

    /// Bound on the layer output given a bound on its input.
    pub fn forward(&self, input: &Interval, config: &PropagationConfig) -> Result<Interval> {
        match self {
            LayerTransform::FullyConnected(t) => t.forward(input),
            LayerTransform::Convolutional(t) => t.forward(input, config),
            LayerTransform::Pooling(t) => t.forward(input),
            LayerTransform::Norm(t) => t.forward(input, config),
            LayerTransform::ReLU => Ok(input.max_scalar(0.0)),
            LayerTransform::Softmax => softmax_forward(input),
            LayerTransform::Dropout(t) => Ok(t.apply(input)),
        }
    }

    /// Bound on the input sensitivity given the output sensitivity.
    ///
    /// `activation` is the bound this layer's forward step received.
    pub fn backward(
        &self,
        activation: &Interval,
        derivative: &Interval,
        config: &PropagationConfig,
    ) -> Result<Interval> {
        match self {
            LayerTransform::FullyConnected(t) => t.backward(derivative),
            LayerTransform::Convolutional(t) => t.backward(derivative, config),
            LayerTransform::Pooling(t) => t.backward(activation, derivative, config),
            LayerTransform::Norm(t) => t.backward(activation, derivative, config),
            LayerTransform::ReLU => relu_backward(activation, derivative),
            // Softmax may only close the network; its sensitivity is seeded
            // directly.
            LayerTransform::Softmax => Ok(derivative.clone()),
            LayerTransform::Dropout(t) => Ok(t.apply(derivative)),
        }
    }
}

/// Map `0..n` through `f`, fanning out over rayon when enabled.
///
/// Results are always in index order.
pub(crate) fn collect_indexed<T, F>(n: usize, config: &PropagationConfig, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    if config.use_parallel(n) {
        (0..n).into_par_iter().map(f).collect()
    } else {
        (0..n).map(f).collect()
    }
}

/// Check that an interval has exactly the expected shape.
pub(crate) fn expect_shape(interval: &Interval, expected: &[usize]) -> Result<()> {
    if interval.shape() != expected {
        return Err(DerestError::shape_mismatch(expected, interval.shape()));
    }
    Ok(())
}

/// Check a derivative of shape `(B, ...layer_shape)` and return `B`.
pub(crate) fn batch_size(derivative: &Interval, layer_shape: &[usize]) -> Result<usize> {
    let shape = derivative.shape();
    if shape.len() != layer_shape.len() + 1 || &shape[1..] != layer_shape {
        let mut expected = vec![shape.first().copied().unwrap_or(1)];
        expected.extend_from_slice(layer_shape);
        return Err(DerestError::shape_mismatch(&expected, shape));
    }
    Ok(shape[0])
}

/// Split a shape into `(channels, height, width)`.
pub(crate) fn chw(shape: &[usize], kind: &str) -> Result<[usize; 3]> {
    match shape {
        &[c, h, w] => Ok([c, h, w]),
        other => Err(DerestError::InvalidConfig(format!(
            "{kind} expects a (channels, height, width) input, got {other:?}"
        ))),
    }
}

pub(crate) fn view3(a: &ArrayD<f32>) -> Result<ArrayView3<'_, f32>> {
    a.view()
        .into_dimensionality::<Ix3>()
        .map_err(|e| DerestError::InvalidConfig(format!("expected a rank-3 array: {e}")))
}

pub(crate) fn view4(a: &ArrayD<f32>) -> Result<ArrayView4<'_, f32>> {
    a.view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| DerestError::InvalidConfig(format!("expected a rank-4 array: {e}")))
}

/// Stack per-batch `(lower, upper)` planes along a new leading axis.
pub(crate) fn stack_rows(rows: Vec<(ArrayD<f32>, ArrayD<f32>)>) -> Result<Interval> {
    let parts: Vec<Interval> = rows
        .into_iter()
        .map(|(l, u)| Interval::new_unchecked(l, u))
        .collect();
    Interval::stack(&parts)
}

/// Output extent of a sliding window along one axis.
pub(crate) fn window_output(extent: usize, window: usize, stride: usize, padding: usize) -> Result<usize> {
    let padded = extent + 2 * padding;
    if padded < window {
        return Err(DerestError::InvalidConfig(format!(
            "window {window} larger than padded extent {padded}"
        )));
    }
    Ok((padded - window) / stride + 1)
}
