//! Per-node bound summaries of a finished propagation run.

use crate::engine::{PropagationEngine, PropagationState};
use derest_tensor::Interval;
use serde::Serialize;

/// Widths above this are reported as saturated.
const SATURATION_WIDTH: f32 = 1e30;

/// Truncate a name to fit in a given width, keeping its tail.
pub fn truncate_name(name: &str, width: usize) -> String {
    let len = name.chars().count();
    if len <= width {
        name.to_string()
    } else if width < 3 {
        name.chars().skip(len - width).collect()
    } else {
        let tail: String = name.chars().skip(len + 3 - width.max(3)).collect();
        format!("...{tail}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerBoundsInfo {
    pub path: String,
    pub kind: &'static str,
    pub depth: usize,
    pub output_shape: Vec<usize>,
    /// Widest activation bound on the layer input.
    pub activation_width: f32,
    /// Widest derivative bound on the layer output.
    pub derivative_width: f32,
    pub has_nan: bool,
    pub has_infinite: bool,
}

fn scan(interval: Option<&Interval>) -> (f32, bool, bool) {
    let Some(interval) = interval else {
        return (0.0, false, false);
    };
    let values = || interval.lower.iter().chain(interval.upper.iter());
    let has_nan = values().any(|v| v.is_nan());
    let has_infinite = values().any(|v| v.is_infinite());
    (interval.max_width(), has_nan, has_infinite)
}

impl LayerBoundsInfo {
    pub fn has_degraded(&self) -> bool {
        self.has_nan || self.has_infinite || self.is_saturated()
    }

    fn is_saturated(&self) -> bool {
        self.activation_width > SATURATION_WIDTH || self.derivative_width > SATURATION_WIDTH
    }

    pub fn status(&self) -> &'static str {
        if self.has_nan {
            "NAN"
        } else if self.has_infinite {
            "INF"
        } else if self.is_saturated() {
            "SATURATED"
        } else if self.derivative_width == 0.0 {
            "EXACT"
        } else {
            "OK"
        }
    }
}

/// Bounds of every node after one propagation run.
#[derive(Debug, Clone, Serialize)]
pub struct BoundsReport {
    pub network: String,
    pub nodes: Vec<LayerBoundsInfo>,
    pub output_width: f32,
    pub input_derivative_width: f32,
}

impl BoundsReport {
    pub fn from_state(engine: &PropagationEngine, state: &PropagationState) -> Self {
        let nodes = engine
            .nodes()
            .map(|info| {
                let (activation_width, act_nan, act_inf) = scan(state.activation(info.id));
                let (derivative_width, der_nan, der_inf) = scan(state.derivative(info.id));
                LayerBoundsInfo {
                    path: info.path.clone(),
                    kind: info.kind,
                    depth: info.depth,
                    output_shape: info.output_shape.clone(),
                    activation_width,
                    derivative_width,
                    has_nan: act_nan || der_nan,
                    has_infinite: act_inf || der_inf,
                }
            })
            .collect();
        Self {
            network: engine.name().to_string(),
            nodes,
            output_width: state.output().map_or(0.0, Interval::max_width),
            input_derivative_width: state.input_derivative().map_or(0.0, Interval::max_width),
        }
    }

    /// First node whose bounds degraded, in declaration order.
    pub fn first_degraded(&self) -> Option<&LayerBoundsInfo> {
        self.nodes.iter().find(|n| n.has_degraded())
    }

    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!("Bounds of '{}'", self.network));
        lines.push("=".repeat(self.network.len() + 12));
        lines.push(format!(
            "{:<40} | {:>14} | {:>16} | {:>10} | {:>10} | Status",
            "Layer", "Kind", "Output", "Act Width", "Der Width"
        ));
        lines.push(format!(
            "{:-<40}-+-{:-<14}-+-{:-<16}-+-{:-<10}-+-{:-<10}-+--------",
            "", "", "", "", ""
        ));
        for node in &self.nodes {
            let marker = if node.has_degraded() { " <<<" } else { "" };
            let name = format!("{}{}", "  ".repeat(node.depth), node.path);
            lines.push(format!(
                "{:<40} | {:>14} | {:>16} | {:>10.3e} | {:>10.3e} | {}{}",
                truncate_name(&name, 40),
                node.kind,
                format!("{:?}", node.output_shape),
                node.activation_width,
                node.derivative_width,
                node.status(),
                marker
            ));
        }
        lines.push(String::new());
        lines.push(format!(
            "Output width: {:.3e}, input sensitivity width: {:.3e}",
            self.output_width, self.input_derivative_width
        ));
        if let Some(node) = self.first_degraded() {
            lines.push(format!(
                "WARNING: Bounds degraded at {} ({})",
                node.path,
                node.status()
            ));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_name() {
        assert_eq!(truncate_name("conv1", 10), "conv1");
        assert_eq!(truncate_name("inception/b0/conv", 10), "...b0/conv");
        assert_eq!(truncate_name("inception/b0/conv", 10).len(), 10);
        assert_eq!(truncate_name("conv1", 2), "v1");
        assert_eq!(truncate_name("conv1", 0), "");
        assert_eq!(truncate_name("conv1", 3), "...");
    }

    #[test]
    fn test_status_priority() {
        let mut info = LayerBoundsInfo {
            path: "fc".into(),
            kind: "fully_connected",
            depth: 0,
            output_shape: vec![3],
            activation_width: 1.0,
            derivative_width: 0.0,
            has_nan: false,
            has_infinite: false,
        };
        assert_eq!(info.status(), "EXACT");
        info.derivative_width = 2.0;
        assert_eq!(info.status(), "OK");
        assert!(!info.has_degraded());
        info.activation_width = 1e35;
        assert_eq!(info.status(), "SATURATED");
        info.has_infinite = true;
        assert_eq!(info.status(), "INF");
        info.has_nan = true;
        assert_eq!(info.status(), "NAN");
        assert!(info.has_degraded());
    }
}
