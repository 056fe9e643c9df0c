//! Configuration for sensitivity propagation and pruning.
//!
//! All types serialize with serde so a run can be described in a JSON file
//! and overridden from the command line.

use crate::{Bound, DerestError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the propagation and indicator engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Fan data-parallel work (convolutions, LRN candidate search,
    /// indicator rows) out over the rayon thread pool.
    pub parallel: bool,
    /// Minimum number of independent work items before going parallel.
    pub min_parallel_items: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            min_parallel_items: 64,
        }
    }
}

impl PropagationConfig {
    /// Sequential configuration, useful for debugging and benchmarks.
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }

    /// Whether `items` independent work items should run in parallel.
    #[inline]
    pub fn use_parallel(&self, items: usize) -> bool {
        self.parallel && items >= self.min_parallel_items
    }
}

/// Built-in reductions from a per-weight contribution interval to a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScoreKind {
    /// Largest magnitude in the interval: max(|lower|, |upper|).
    #[default]
    MaxAbs,
    /// Upper end of the interval.
    Upper,
    /// Interval width: upper - lower.
    Width,
}

impl ScoreKind {
    /// Reduce a contribution interval to a scalar score.
    #[inline]
    pub fn apply(self, bound: Bound) -> f32 {
        match self {
            ScoreKind::MaxAbs => bound.max_abs(),
            ScoreKind::Upper => bound.upper,
            ScoreKind::Width => bound.width(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScoreKind::MaxAbs => "max-abs",
            ScoreKind::Upper => "upper",
            ScoreKind::Width => "width",
        }
    }
}

impl std::str::FromStr for ScoreKind {
    type Err = DerestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "max-abs" | "max_abs" => Ok(ScoreKind::MaxAbs),
            "upper" => Ok(ScoreKind::Upper),
            "width" => Ok(ScoreKind::Width),
            other => Err(DerestError::InvalidConfig(format!(
                "unknown score '{other}' (expected max-abs, upper or width)"
            ))),
        }
    }
}

/// Top-level configuration of a DEREST run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerestConfig {
    /// Smallest value any input element can take.
    pub input_min: f32,
    /// Largest value any input element can take.
    pub input_max: f32,
    /// Fraction of all weights to zero, in [0, 1].
    pub fraction: f32,
    /// Reduction used to turn contribution intervals into indicators.
    pub score: ScoreKind,
    pub propagation: PropagationConfig,
}

impl Default for DerestConfig {
    fn default() -> Self {
        Self {
            input_min: 0.0,
            input_max: 255.0,
            fraction: 0.0,
            score: ScoreKind::MaxAbs,
            propagation: PropagationConfig::default(),
        }
    }
}

impl DerestConfig {
    /// The input box as a scalar bound.
    pub fn input_bound(&self) -> Result<Bound> {
        if self.input_min.is_nan() || self.input_max.is_nan() || self.input_min > self.input_max
        {
            return Err(DerestError::InvalidInterval(format!(
                "input range [{}, {}]",
                self.input_min, self.input_max
            )));
        }
        Ok(Bound::new(self.input_min, self.input_max))
    }

    /// Check that every field is in range.
    pub fn validate(&self) -> Result<()> {
        self.input_bound()?;
        validate_fraction(self.fraction)?;
        Ok(())
    }
}

/// Check that a pruning fraction lies in [0, 1].
pub fn validate_fraction(fraction: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&fraction) {
        return Err(DerestError::InvalidConfig(format!(
            "fraction must be in [0, 1], got {fraction}"
        )));
    }
    Ok(())
}
