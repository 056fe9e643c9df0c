//! JSON network description.
//!
//! ```json
//! {
//!   "name": "tiny",
//!   "input_shape": [1, 4, 4],
//!   "layers": [
//!     { "name": "conv1", "kind": "convolutional",
//!       "attributes": { "stride": 1, "padding": 1 },
//!       "weights": { "shape": [2, 1, 3, 3], "data": [ ... ] } },
//!     { "name": "relu1", "kind": "relu" },
//!     { "name": "fc", "kind": "fully_connected",
//!       "weights": { "shape": [32, 3], "data": [ ... ] },
//!       "bias": { "shape": [3], "data": [0, 0, 0] } }
//!   ]
//! }
//! ```

use crate::network::{
    Branch, Convolutional, Dropout, FullyConnected, LayerDescriptor, LayerKind, LocalResponseNorm,
    Network, PoolMode, Pooling,
};
use derest_core::{DerestError, Result};
use ndarray::{Array1, Array2, Array4, ArrayD, Ix1, Ix2, Ix4, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Serialized network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub input_shape: Vec<usize>,
    pub layers: Vec<LayerSpec>,
}

/// Serialized layer; `kind` selects how the other fields are read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<TensorData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias: Option<TensorData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<BranchSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Int(i64),
    Float(f32),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
}

/// Dense tensor in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSpec {
    pub name: String,
    #[serde(default)]
    pub layers: Vec<LayerSpec>,
}

impl TensorData {
    pub fn from_array<D: ndarray::Dimension>(a: &ndarray::Array<f32, D>) -> Self {
        Self {
            shape: a.shape().to_vec(),
            data: a.iter().copied().collect(),
        }
    }

    pub fn to_array(&self) -> Result<ArrayD<f32>> {
        let expected: usize = self.shape.iter().product();
        if expected != self.data.len() {
            return Err(DerestError::Json(format!(
                "tensor of shape {:?} needs {expected} values, got {}",
                self.shape,
                self.data.len()
            )));
        }
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone())
            .map_err(|e| DerestError::Json(format!("tensor data: {e}")))
    }
}

fn rank_error(layer: &str, what: &str, rank: usize, shape: &[usize]) -> DerestError {
    DerestError::Json(format!(
        "layer '{layer}': {what} must have rank {rank}, got shape {shape:?}"
    ))
}

impl LayerSpec {
    fn int_attr(&self, key: &str) -> Result<Option<usize>> {
        match self.attributes.get(key) {
            None => Ok(None),
            Some(AttributeValue::Int(v)) if *v >= 0 => Ok(Some(*v as usize)),
            Some(other) => Err(DerestError::InvalidConfig(format!(
                "layer '{}': attribute '{key}' must be a non-negative integer, got {other:?}",
                self.name
            ))),
        }
    }

    fn float_attr(&self, key: &str) -> Result<Option<f32>> {
        match self.attributes.get(key) {
            None => Ok(None),
            Some(AttributeValue::Float(v)) => Ok(Some(*v)),
            Some(AttributeValue::Int(v)) => Ok(Some(*v as f32)),
            Some(other) => Err(DerestError::InvalidConfig(format!(
                "layer '{}': attribute '{key}' must be a number, got {other:?}",
                self.name
            ))),
        }
    }

    fn required_weights(&self) -> Result<ArrayD<f32>> {
        self.weights
            .as_ref()
            .ok_or_else(|| DerestError::Json(format!("layer '{}' has no weights", self.name)))?
            .to_array()
    }

    fn bias_or_zeros(&self, len: usize) -> Result<Array1<f32>> {
        match &self.bias {
            None => Ok(Array1::zeros(len)),
            Some(bias) => {
                let shape = bias.shape.clone();
                bias.to_array()?
                    .into_dimensionality::<Ix1>()
                    .map_err(|_| rank_error(&self.name, "bias", 1, &shape))
            }
        }
    }

    /// Convert into a layer descriptor.
    pub fn to_layer(&self) -> Result<LayerDescriptor> {
        let kind = match self.kind.as_str() {
            "fully_connected" => {
                let w = self.required_weights()?;
                let shape = w.shape().to_vec();
                let w: Array2<f32> = w
                    .into_dimensionality::<Ix2>()
                    .map_err(|_| rank_error(&self.name, "weights", 2, &shape))?;
                let bias = self.bias_or_zeros(w.ncols())?;
                LayerKind::FullyConnected(FullyConnected::new(w, bias)?)
            }
            "convolutional" => {
                let w = self.required_weights()?;
                let shape = w.shape().to_vec();
                let w: Array4<f32> = w
                    .into_dimensionality::<Ix4>()
                    .map_err(|_| rank_error(&self.name, "weights", 4, &shape))?;
                let bias = self.bias_or_zeros(w.shape()[0])?;
                LayerKind::Convolutional(Convolutional::new(
                    w,
                    bias,
                    self.int_attr("stride")?.unwrap_or(1),
                    self.int_attr("padding")?.unwrap_or(0),
                    self.int_attr("groups")?.unwrap_or(1),
                )?)
            }
            "max_pool" | "avg_pool" => {
                let mode = if self.kind == "max_pool" {
                    PoolMode::Max
                } else {
                    PoolMode::Avg
                };
                let size = self.int_attr("pool_size")?.ok_or_else(|| {
                    DerestError::InvalidConfig(format!("layer '{}' needs a pool_size", self.name))
                })?;
                let pool = Pooling::new(mode, size)
                    .with_stride(self.int_attr("stride")?.unwrap_or(size))
                    .with_padding(self.int_attr("padding")?.unwrap_or(0));
                pool.validate()?;
                LayerKind::Pooling(pool)
            }
            "norm" => {
                let d = LocalResponseNorm::default();
                LayerKind::Norm(LocalResponseNorm::new(
                    self.int_attr("local_range")?.unwrap_or(d.local_range),
                    self.float_attr("k")?.unwrap_or(d.k),
                    self.float_attr("alpha")?.unwrap_or(d.alpha),
                    self.float_attr("beta")?.unwrap_or(d.beta),
                )?)
            }
            "relu" => LayerKind::ReLU,
            "softmax" => LayerKind::Softmax,
            "dropout" => LayerKind::Dropout(Dropout::new(
                self.float_attr("p_dropout")?
                    .unwrap_or(Dropout::default().p_dropout),
            )?),
            "inception" => {
                let branches = self
                    .branches
                    .iter()
                    .map(|b| {
                        let layers = b
                            .layers
                            .iter()
                            .map(LayerSpec::to_layer)
                            .collect::<Result<Vec<_>>>()?;
                        Ok(Branch::new(b.name.clone(), layers))
                    })
                    .collect::<Result<Vec<_>>>()?;
                LayerKind::Inception(crate::network::Inception { branches })
            }
            other => {
                return Err(DerestError::UnsupportedLayerKind(format!(
                    "'{other}' (layer '{}')",
                    self.name
                )))
            }
        };
        Ok(LayerDescriptor::new(self.name.clone(), kind))
    }

    pub fn from_layer(layer: &LayerDescriptor) -> Self {
        let mut spec = LayerSpec {
            name: layer.name.clone(),
            kind: layer.kind.tag().to_string(),
            attributes: BTreeMap::new(),
            weights: None,
            bias: None,
            branches: Vec::new(),
        };
        let mut int = |key: &str, v: usize| {
            spec.attributes
                .insert(key.to_string(), AttributeValue::Int(v as i64));
        };
        match &layer.kind {
            LayerKind::Convolutional(conv) => {
                int("stride", conv.stride);
                int("padding", conv.padding);
                int("groups", conv.groups);
            }
            LayerKind::Pooling(pool) => {
                int("pool_size", pool.pool_size);
                int("stride", pool.stride);
                int("padding", pool.padding);
            }
            LayerKind::Norm(lrn) => {
                int("local_range", lrn.local_range);
            }
            _ => {}
        }
        match &layer.kind {
            LayerKind::FullyConnected(fc) => {
                spec.weights = Some(TensorData::from_array(&fc.weights));
                spec.bias = Some(TensorData::from_array(&fc.bias));
            }
            LayerKind::Convolutional(conv) => {
                spec.weights = Some(TensorData::from_array(&conv.weights));
                spec.bias = Some(TensorData::from_array(&conv.bias));
            }
            LayerKind::Norm(lrn) => {
                for (key, v) in [("k", lrn.k), ("alpha", lrn.alpha), ("beta", lrn.beta)] {
                    spec.attributes
                        .insert(key.to_string(), AttributeValue::Float(v));
                }
            }
            LayerKind::Dropout(d) => {
                spec.attributes
                    .insert("p_dropout".to_string(), AttributeValue::Float(d.p_dropout));
            }
            LayerKind::Inception(inc) => {
                spec.branches = inc
                    .branches
                    .iter()
                    .map(|b| BranchSpec {
                        name: b.name.clone(),
                        layers: b.layers.iter().map(LayerSpec::from_layer).collect(),
                    })
                    .collect();
            }
            _ => {}
        }
        spec
    }
}

impl NetworkSpec {
    pub fn to_network(&self) -> Result<Network> {
        let layers = self
            .layers
            .iter()
            .map(LayerSpec::to_layer)
            .collect::<Result<Vec<_>>>()?;
        Ok(Network::new(self.name.clone(), self.input_shape.clone(), layers))
    }

    pub fn from_network(network: &Network) -> Self {
        Self {
            name: network.name.clone(),
            input_shape: network.input_shape.clone(),
            layers: network.layers.iter().map(LayerSpec::from_layer).collect(),
        }
    }
}

/// Parse a network from a JSON string.
pub fn network_from_json(json: &str) -> Result<Network> {
    let spec: NetworkSpec =
        serde_json::from_str(json).map_err(|e| DerestError::Json(e.to_string()))?;
    spec.to_network()
}

/// Serialize a network to pretty-printed JSON.
pub fn network_to_json(network: &Network) -> Result<String> {
    serde_json::to_string_pretty(&NetworkSpec::from_network(network))
        .map_err(|e| DerestError::Json(e.to_string()))
}

pub fn load_network(path: &Path) -> Result<Network> {
    let json = std::fs::read_to_string(path)?;
    let network = network_from_json(&json)?;
    debug!(
        "Loaded network '{}' from {}: {} layers, {} weights",
        network.name,
        path.display(),
        network.node_count(),
        network.weight_count()
    );
    Ok(network)
}

pub fn save_network(network: &Network, path: &Path) -> Result<()> {
    std::fs::write(path, network_to_json(network)?)?;
    Ok(())
}
