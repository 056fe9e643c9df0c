use super::batch_size;
use crate::network::FullyConnected;
use derest_core::{DerestError, Result};
use derest_tensor::Interval;
use ndarray::ArrayD;

/// Dense layer over the flattened input.
#[derive(Debug, Clone)]
pub struct FcTransform {
    /// `(n_in, n_out)`
    weights: ArrayD<f32>,
    /// `(n_out, n_in)`, used by the backward step.
    weights_t: ArrayD<f32>,
    bias: ArrayD<f32>,
    input_shape: Vec<usize>,
}

impl FcTransform {
    pub fn new(layer: &FullyConnected, input_shape: &[usize]) -> Result<Self> {
        let flat: usize = input_shape.iter().product();
        if flat != layer.n_in() {
            return Err(DerestError::shape_mismatch(&[layer.n_in()], &[flat]));
        }
        Ok(Self {
            weights: layer.weights.clone().into_dyn(),
            weights_t: layer.weights.t().to_owned().into_dyn(),
            bias: layer.bias.clone().into_dyn(),
            input_shape: input_shape.to_vec(),
        })
    }

    pub fn n_in(&self) -> usize {
        self.weights.shape()[0]
    }

    pub fn n_out(&self) -> usize {
        self.weights.shape()[1]
    }

    /// `(n_in, n_out)` weight matrix.
    pub fn weights(&self) -> &ArrayD<f32> {
        &self.weights
    }

    pub fn forward(&self, input: &Interval) -> Result<Interval> {
        input.flatten().dot(&self.weights)?.add_array(&self.bias)
    }

    /// `(B, n_out) · Wᵗ`, reshaped to `(B, ...input shape)`.
    pub fn backward(&self, derivative: &Interval) -> Result<Interval> {
        let batch = batch_size(derivative, &[self.n_out()])?;
        let upstream = derivative.dot(&self.weights_t)?;
        let mut shape = vec![batch];
        shape.extend_from_slice(&self.input_shape);
        upstream.reshape(&shape)
    }
}
