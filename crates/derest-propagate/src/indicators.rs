//! Per-weight importance bounds from activation and derivative bounds.
//!
//! For a weight `w` connecting input element `a` to output element `o`, the
//! contribution of `w` to the sensitivity of output `b` is bounded by
//! `a ⊗ D[b, o] ⊗ w`. A convolution weight is shared by every output
//! position, so its contribution is the interval sum over positions. The
//! indicator is `max(0, max_b score(contribution_b))`.

use crate::engine::{NodeId, PropagationEngine, PropagationState};
use crate::layers::{batch_size, collect_indexed, view3, view4, ConvTransform, FcTransform, LayerTransform};
use derest_core::{Bound, DerestError, PropagationConfig, Result, ScoreKind};
use derest_tensor::Interval;
use ndarray::{ArrayD, IxDyn};
use serde::Serialize;
use tracing::{debug, info};

/// Reduction from a contribution interval to a scalar importance score.
pub trait IndicatorScore: Sync {
    fn score(&self, contribution: Bound) -> f32;
}

impl IndicatorScore for ScoreKind {
    fn score(&self, contribution: Bound) -> f32 {
        self.apply(contribution)
    }
}

impl<F> IndicatorScore for F
where
    F: Fn(Bound) -> f32 + Sync,
{
    fn score(&self, contribution: Bound) -> f32 {
        self(contribution)
    }
}

/// Indicators of one weighted layer, shaped like its weight tensor.
#[derive(Debug, Clone, Serialize)]
pub struct LayerIndicators {
    #[serde(skip)]
    pub node: NodeId,
    pub path: String,
    pub values: ArrayD<f32>,
}

/// Summary statistics of one layer's indicators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorStats {
    pub path: String,
    pub count: usize,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    /// Weights whose indicator is exactly zero.
    pub zeros: usize,
}

impl LayerIndicators {
    pub fn stats(&self) -> IndicatorStats {
        let count = self.values.len();
        let (min, max, sum, zeros) = self.values.iter().fold(
            (f32::INFINITY, f32::NEG_INFINITY, 0.0f64, 0usize),
            |(min, max, sum, zeros), &v| {
                (min.min(v), max.max(v), sum + v as f64, zeros + usize::from(v == 0.0))
            },
        );
        IndicatorStats {
            path: self.path.clone(),
            count,
            min: if count == 0 { 0.0 } else { min },
            max: if count == 0 { 0.0 } else { max },
            mean: if count == 0 { 0.0 } else { (sum / count as f64) as f32 },
            zeros,
        }
    }
}

/// One indicator tensor per weighted layer, in depth-first declaration order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Indicators {
    pub layers: Vec<LayerIndicators>,
}

impl Indicators {
    pub fn new(layers: Vec<LayerIndicators>) -> Self {
        Self { layers }
    }

    /// Build from bare tensors, e.g. indicators computed elsewhere.
    pub fn from_values(values: Vec<ArrayD<f32>>) -> Self {
        Self {
            layers: values
                .into_iter()
                .enumerate()
                .map(|(i, values)| LayerIndicators {
                    node: NodeId(i),
                    path: format!("layer{i}"),
                    values,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Total number of indicator values (one per weight).
    pub fn total(&self) -> usize {
        self.layers.iter().map(|l| l.values.len()).sum()
    }

    pub fn stats(&self) -> Vec<IndicatorStats> {
        self.layers.iter().map(LayerIndicators::stats).collect()
    }

    /// Plain-text table of per-layer statistics.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        lines.push("Weight Indicators".to_string());
        lines.push("=================".to_string());
        lines.push(format!(
            "{:<40} | {:>9} | {:>10} | {:>10} | {:>10} | {:>7}",
            "Layer", "Weights", "Min", "Mean", "Max", "Zeros"
        ));
        lines.push(format!(
            "{:-<40}-+-{:-<9}-+-{:-<10}-+-{:-<10}-+-{:-<10}-+-{:-<7}",
            "", "", "", "", "", ""
        ));
        for s in self.stats() {
            lines.push(format!(
                "{:<40} | {:>9} | {:>10.3e} | {:>10.3e} | {:>10.3e} | {:>7}",
                crate::report::truncate_name(&s.path, 40),
                s.count,
                s.min,
                s.mean,
                s.max,
                s.zeros
            ));
        }
        lines.push(String::new());
        lines.push(format!("Total weights: {}", self.total()));
        lines.join("\n")
    }
}

/// Combines a finished [`PropagationState`] into indicators.
#[derive(Debug, Clone)]
pub struct IndicatorEngine<S = ScoreKind> {
    score: S,
    config: PropagationConfig,
}

impl Default for IndicatorEngine<ScoreKind> {
    fn default() -> Self {
        Self::new(ScoreKind::default())
    }
}

impl<S: IndicatorScore> IndicatorEngine<S> {
    pub fn new(score: S) -> Self {
        Self::with_config(score, PropagationConfig::default())
    }

    pub fn with_config(score: S, config: PropagationConfig) -> Self {
        Self { score, config }
    }

    /// Indicators for every weighted layer of `engine`.
    pub fn compute(
        &self,
        engine: &PropagationEngine,
        state: &PropagationState,
    ) -> Result<Indicators> {
        let mut layers = Vec::with_capacity(engine.weighted_layers().len());
        for &id in engine.weighted_layers() {
            let info = engine
                .node(id)
                .ok_or_else(|| DerestError::PropagationOrder(format!("unknown node {id}")))?;
            let values = self
                .layer_indicators(engine, state, id)
                .map_err(|e| e.in_layer(id.0, &info.path))?;
            debug!(
                "indicators {:<32} shape {:?} max {:.3e}",
                info.path,
                values.shape(),
                values.iter().copied().fold(0.0f32, f32::max)
            );
            layers.push(LayerIndicators {
                node: id,
                path: info.path.clone(),
                values,
            });
        }
        let indicators = Indicators::new(layers);
        info!(
            "Computed indicators for {} weighted layers ({} weights)",
            indicators.len(),
            indicators.total()
        );
        Ok(indicators)
    }

    fn layer_indicators(
        &self,
        engine: &PropagationEngine,
        state: &PropagationState,
        id: NodeId,
    ) -> Result<ArrayD<f32>> {
        let activation = state
            .activation(id)
            .ok_or_else(|| DerestError::PropagationOrder("activation not set".into()))?;
        let derivative = state
            .derivative(id)
            .ok_or_else(|| DerestError::PropagationOrder("derivative not set".into()))?;
        match engine.transform(id) {
            Some(LayerTransform::FullyConnected(fc)) => {
                self.fully_connected(fc, activation, derivative)
            }
            Some(LayerTransform::Convolutional(conv)) => {
                self.convolutional(conv, activation, derivative)
            }
            other => Err(DerestError::UnsupportedLayerKind(format!(
                "no indicators for {}",
                other.map_or("inception", LayerTransform::kind_name)
            ))),
        }
    }

    fn fully_connected(
        &self,
        fc: &FcTransform,
        activation: &Interval,
        derivative: &Interval,
    ) -> Result<ArrayD<f32>> {
        let (n_in, n_out) = (fc.n_in(), fc.n_out());
        let batch = batch_size(derivative, &[n_out])?;
        let act = activation.flatten();
        if act.len() != n_in {
            return Err(DerestError::shape_mismatch(&[n_in], act.shape()));
        }
        let weights = fc.weights();

        let rows = collect_indexed(n_in, &self.config, |i| {
            let a = Bound {
                lower: act.lower[[i]],
                upper: act.upper[[i]],
            };
            (0..n_out)
                .map(|j| {
                    let w = weights[[i, j]];
                    (0..batch).fold(0.0f32, |best, b| {
                        let d = Bound {
                            lower: derivative.lower[[b, j]],
                            upper: derivative.upper[[b, j]],
                        };
                        best.max(self.score.score(a.mul(&d).scale(w)))
                    })
                })
                .collect::<Vec<f32>>()
        });
        ArrayD::from_shape_vec(IxDyn(&[n_in, n_out]), rows.concat())
            .map_err(|e| DerestError::InvalidConfig(format!("indicator layout: {e}")))
    }

    fn convolutional(
        &self,
        conv: &ConvTransform,
        activation: &Interval,
        derivative: &Interval,
    ) -> Result<ArrayD<f32>> {
        let batch = batch_size(derivative, conv.output_shape())?;
        let xl = view3(&activation.lower)?;
        let xu = view3(&activation.upper)?;
        let dl = view4(&derivative.lower)?;
        let du = view4(&derivative.upper)?;
        let weights = conv.weights();
        let (c_out, c_in_g, fh, fw) = weights.dim();
        let [_, h, w] = *conv.input_shape();
        let [_, oh, ow] = *conv.output_shape();

        let blocks = collect_indexed(c_out, &self.config, |o| {
            let mut block = Vec::with_capacity(c_in_g * fh * fw);
            for ci in 0..c_in_g {
                let c = conv.input_channel(o, ci);
                for di in 0..fh {
                    for dj in 0..fw {
                        let wv = weights[[o, ci, di, dj]];
                        let mut best = 0.0f32;
                        for b in 0..batch {
                            let mut sum = Bound::zero();
                            for i in 0..oh {
                                let Some(y) = conv.source_index(i, di, h) else {
                                    continue;
                                };
                                for j in 0..ow {
                                    let Some(x) = conv.source_index(j, dj, w) else {
                                        continue;
                                    };
                                    let a = Bound {
                                        lower: xl[[c, y, x]],
                                        upper: xu[[c, y, x]],
                                    };
                                    let d = Bound {
                                        lower: dl[[b, o, i, j]],
                                        upper: du[[b, o, i, j]],
                                    };
                                    sum = sum.add(&a.mul(&d));
                                }
                            }
                            best = best.max(self.score.score(sum.scale(wv)));
                        }
                        block.push(best);
                    }
                }
            }
            block
        });
        ArrayD::from_shape_vec(IxDyn(&[c_out, c_in_g, fh, fw]), blocks.concat())
            .map_err(|e| DerestError::InvalidConfig(format!("indicator layout: {e}")))
    }
}
