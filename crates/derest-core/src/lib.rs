//! Core types and traits for DEREST sensitivity propagation.
//!
//! This crate provides the foundational pieces shared by the interval tensor
//! type, the propagation engine and the command-line front end: the error
//! taxonomy, the scalar [`Bound`] used for per-element extremum search, and the
//! serializable configuration.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

pub mod config;

pub use config::{DerestConfig, PropagationConfig, ScoreKind};

/// A bound on a scalar value: [lower, upper].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub lower: f32,
    pub upper: f32,
}

impl Bound {
    /// Create a new bound.
    #[inline]
    pub fn new(lower: f32, upper: f32) -> Self {
        debug_assert!(lower <= upper, "Invalid bound: {lower} > {upper}");
        Self { lower, upper }
    }

    /// Create a concrete (point) bound.
    #[inline]
    pub fn concrete(value: f32) -> Self {
        Self {
            lower: value,
            upper: value,
        }
    }

    /// The zero point bound.
    #[inline]
    pub fn zero() -> Self {
        Self::concrete(0.0)
    }

    /// Smallest bound containing every candidate value.
    ///
    /// Returns `None` for an empty candidate set.
    pub fn from_candidates<I>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = f32>,
    {
        let mut iter = values.into_iter();
        let first = iter.next()?;
        let (lower, upper) = iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
        Some(Self { lower, upper })
    }

    /// Check if this bound contains a value.
    #[inline]
    pub fn contains(&self, value: f32) -> bool {
        self.lower <= value && value <= self.upper
    }

    /// Check if the bound contains zero.
    #[inline]
    pub fn contains_zero(&self) -> bool {
        self.contains(0.0)
    }

    /// Width of the bound interval.
    #[inline]
    pub fn width(&self) -> f32 {
        self.upper - self.lower
    }

    /// True when lower == upper.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        self.lower == self.upper
    }

    /// Upper bound on |x| over the interval.
    #[inline]
    pub fn max_abs(&self) -> f32 {
        self.lower.abs().max(self.upper.abs())
    }

    /// Sum of two bounds.
    #[inline]
    pub fn add(&self, other: &Bound) -> Bound {
        Bound {
            lower: self.lower + other.lower,
            upper: self.upper + other.upper,
        }
    }

    /// Product of two bounds (four-corner rule).
    #[inline]
    pub fn mul(&self, other: &Bound) -> Bound {
        let ll = self.lower * other.lower;
        let lu = self.lower * other.upper;
        let ul = self.upper * other.lower;
        let uu = self.upper * other.upper;
        Bound {
            lower: ll.min(lu).min(ul.min(uu)),
            upper: ll.max(lu).max(ul.max(uu)),
        }
    }

    /// Product with a concrete scalar of any sign.
    #[inline]
    pub fn scale(&self, s: f32) -> Bound {
        let a = self.lower * s;
        let b = self.upper * s;
        Bound {
            lower: a.min(b),
            upper: a.max(b),
        }
    }

    /// Union of two bounds (convex hull).
    #[inline]
    pub fn union(&self, other: &Bound) -> Bound {
        Bound {
            lower: self.lower.min(other.lower),
            upper: self.upper.max(other.upper),
        }
    }

    /// Widen the bound so that it contains zero.
    #[inline]
    pub fn hull_with_zero(&self) -> Bound {
        Bound {
            lower: self.lower.min(0.0),
            upper: self.upper.max(0.0),
        }
    }
}

impl From<RangeInclusive<f32>> for Bound {
    fn from(range: RangeInclusive<f32>) -> Self {
        Self::new(*range.start(), *range.end())
    }
}

/// Error types for DEREST operations.
#[derive(Debug, thiserror::Error)]
pub enum DerestError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("Unsupported layer kind: {0}")]
    UnsupportedLayerKind(String),

    #[error("Domain violation: {0}")]
    DomainViolation(String),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Propagation order violated: {0}")]
    PropagationOrder(String),

    #[error("Layer {layer_index} ({layer_name}) failed: {source}")]
    LayerError {
        layer_index: usize,
        layer_name: String,
        #[source]
        source: Box<DerestError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed network description: {0}")]
    Json(String),
}

impl DerestError {
    /// Create a ShapeMismatch error from two shape slices.
    #[track_caller]
    pub fn shape_mismatch(expected: &[usize], got: &[usize]) -> Self {
        debug_assert!(
            expected != got,
            "ShapeMismatch created with identical shapes: {:?}",
            expected
        );
        DerestError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    /// Wrap an error with the index and name of the layer that produced it.
    ///
    /// Errors that already carry layer context are returned unchanged so the
    /// innermost (most specific) layer is reported.
    pub fn in_layer(self, layer_index: usize, layer_name: &str) -> Self {
        match self {
            err @ DerestError::LayerError { .. } => err,
            other => DerestError::LayerError {
                layer_index,
                layer_name: layer_name.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, skipping layer context wrappers.
    pub fn root_cause(&self) -> &DerestError {
        match self {
            DerestError::LayerError { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, DerestError>;
