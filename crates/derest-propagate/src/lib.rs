//! Sensitivity bound propagation for DEREST.
//!
//! Given a network and an interval on every input element, the
//! [`PropagationEngine`] runs one forward pass of activation bounds and one
//! backward pass of derivative bounds. The [`IndicatorEngine`] turns the
//! two into a per-weight importance bound, and the
//! [`GlobalFractionPruner`] zeroes the globally least important fraction of
//! weights.
//!
//! ```no_run
//! use derest_propagate::{derest, load_network};
//! use std::path::Path;
//!
//! let mut network = load_network(Path::new("net.json"))?;
//! let report = derest(&mut network, 0.5, (0.0, 255.0))?;
//! println!("{}", report.summary());
//! # Ok::<(), derest_core::DerestError>(())
//! ```

pub mod engine;
pub mod indicators;
pub mod io;
pub mod layers;
pub mod network;
pub mod prune;
pub mod report;

pub use engine::{NodeId, NodeInfo, NodeStage, PropagationEngine, PropagationState};
pub use indicators::{IndicatorEngine, IndicatorScore, IndicatorStats, Indicators, LayerIndicators};
pub use io::{load_network, network_from_json, network_to_json, save_network, NetworkSpec};
pub use layers::LayerTransform;
pub use network::{
    Branch, Convolutional, Dropout, FullyConnected, Inception, LayerDescriptor, LayerKind,
    LocalResponseNorm, Network, PoolMode, Pooling,
};
pub use prune::{
    compute_indicators, derest, derest_with_config, selection_count, GlobalFractionPruner,
    LayerPruneCount, PruneReport, PruneSelection, WeightRef,
};
pub use report::{truncate_name, BoundsReport, LayerBoundsInfo};

#[cfg(test)]
mod tests;
