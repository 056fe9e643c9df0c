//! Global-fraction pruning: zero the globally least important weights.

use crate::engine::PropagationEngine;
use crate::indicators::{IndicatorEngine, IndicatorScore, Indicators};
use crate::network::Network;
use derest_core::config::validate_fraction;
use derest_core::{DerestConfig, DerestError, Result, ScoreKind};
use ndarray::ArrayViewMutD;
use serde::Serialize;
use tracing::info;

/// Relative slack applied before flooring `fraction * total`. It covers the
/// f32 representation error of the fraction, so `0.7` of 10 selects 7.
const COUNT_RELATIVE_SLACK: f64 = 1e-6;

/// Number of weights a fraction selects out of `total`.
pub fn selection_count(fraction: f32, total: usize) -> usize {
    let exact = fraction as f64 * total as f64;
    ((exact * (1.0 + COUNT_RELATIVE_SLACK)).floor() as usize).min(total)
}

/// A weight addressed by weighted-layer index and flat (row-major) index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct WeightRef {
    pub layer: usize,
    pub index: usize,
}

/// Weights chosen for removal, least important first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PruneSelection {
    pub weights: Vec<WeightRef>,
    /// Shape of every weighted layer the selection was made over.
    pub layer_shapes: Vec<Vec<usize>>,
}

/// Outcome of applying a selection to a network.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PruneReport {
    pub total_weights: usize,
    pub zeroed: usize,
    pub layers: Vec<LayerPruneCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerPruneCount {
    pub path: String,
    pub total: usize,
    pub zeroed: usize,
}

impl PruneReport {
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Zeroed {} of {} weights ({:.2}%)",
            self.zeroed,
            self.total_weights,
            if self.total_weights == 0 {
                0.0
            } else {
                100.0 * self.zeroed as f64 / self.total_weights as f64
            }
        )];
        for layer in &self.layers {
            lines.push(format!(
                "  {:<40} {:>9} / {:<9}",
                crate::report::truncate_name(&layer.path, 40),
                layer.zeroed,
                layer.total
            ));
        }
        lines.join("\n")
    }
}

/// Ranks all indicators across layers and picks the lowest fraction.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalFractionPruner;

impl GlobalFractionPruner {
    /// Select `floor(fraction * total)` weights with the smallest indicators.
    ///
    /// Ties are broken by layer index, then by flat index.
    pub fn select(indicators: &Indicators, fraction: f32) -> Result<PruneSelection> {
        validate_fraction(fraction)?;
        let mut ranked: Vec<(f32, WeightRef)> = Vec::with_capacity(indicators.total());
        for (layer, values) in indicators.layers.iter().enumerate() {
            ranked.extend(
                values
                    .values
                    .iter()
                    .enumerate()
                    .map(|(index, &v)| (v, WeightRef { layer, index })),
            );
        }
        let count = selection_count(fraction, ranked.len());
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        ranked.truncate(count);
        Ok(PruneSelection {
            weights: ranked.into_iter().map(|(_, w)| w).collect(),
            layer_shapes: indicators
                .layers
                .iter()
                .map(|l| l.values.shape().to_vec())
                .collect(),
        })
    }
}

impl PruneSelection {
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Zero the selected weights. Biases are left untouched.
    pub fn apply(&self, network: &mut Network) -> Result<PruneReport> {
        let paths: Vec<String> = network
            .weighted_layers()
            .into_iter()
            .map(|l| l.path)
            .collect();
        let mut weights = network.weights_mut();
        if weights.len() != self.layer_shapes.len() {
            return Err(DerestError::shape_mismatch(
                &[self.layer_shapes.len()],
                &[weights.len()],
            ));
        }
        for (w, shape) in weights.iter().zip(&self.layer_shapes) {
            if w.shape() != shape.as_slice() {
                return Err(DerestError::shape_mismatch(shape, w.shape()));
            }
        }

        let mut zeroed = vec![0usize; weights.len()];
        for r in &self.weights {
            let Some(cell) = weights
                .get_mut(r.layer)
                .and_then(|w| flat_element_mut(w, r.index))
            else {
                return Err(DerestError::InvalidConfig(format!(
                    "weight index {} out of range in layer {}",
                    r.index, r.layer
                )));
            };
            *cell = 0.0;
            zeroed[r.layer] += 1;
        }

        let layers: Vec<LayerPruneCount> = paths
            .into_iter()
            .zip(weights.iter())
            .zip(zeroed)
            .map(|((path, w), zeroed)| LayerPruneCount {
                path,
                total: w.len(),
                zeroed,
            })
            .collect();
        Ok(PruneReport {
            total_weights: layers.iter().map(|l| l.total).sum(),
            zeroed: self.weights.len(),
            layers,
        })
    }
}

/// Element at a row-major flat index.
fn flat_element_mut<'a>(w: &'a mut ArrayViewMutD<'_, f32>, index: usize) -> Option<&'a mut f32> {
    if w.is_standard_layout() {
        w.as_slice_mut()?.get_mut(index)
    } else {
        w.iter_mut().nth(index)
    }
}

/// Indicators for `network` with every input element in `[min, max]`.
pub fn compute_indicators<S: IndicatorScore>(
    network: &Network,
    input_range: (f32, f32),
    score: S,
    config: &DerestConfig,
) -> Result<Indicators> {
    let engine = PropagationEngine::with_config(network, config.propagation.clone())?;
    let state = engine.propagate_range(input_range.0, input_range.1)?;
    IndicatorEngine::with_config(score, config.propagation.clone()).compute(&engine, &state)
}

/// Propagate, score and prune in one call.
///
/// Zeroes the `fraction` of weights with the smallest indicators, using the
/// default max-abs score.
pub fn derest(network: &mut Network, fraction: f32, input_range: (f32, f32)) -> Result<PruneReport> {
    let config = DerestConfig {
        input_min: input_range.0,
        input_max: input_range.1,
        fraction,
        ..DerestConfig::default()
    };
    derest_with_config(network, &config)
}

/// [`derest`] driven by a full configuration.
pub fn derest_with_config(network: &mut Network, config: &DerestConfig) -> Result<PruneReport> {
    config.validate()?;
    let score: ScoreKind = config.score;
    let indicators = compute_indicators(
        network,
        (config.input_min, config.input_max),
        score,
        config,
    )?;
    let selection = GlobalFractionPruner::select(&indicators, config.fraction)?;
    let report = selection.apply(network)?;
    info!(
        "Pruned '{}': zeroed {} of {} weights (fraction {}, score {})",
        network.name,
        report.zeroed,
        report.total_weights,
        config.fraction,
        score.name()
    );
    Ok(report)
}
