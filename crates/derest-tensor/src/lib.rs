//! Interval tensors for sensitivity propagation.
//!
//! [`Interval`] pairs two identically shaped `f32` arrays (lower, upper) and
//! implements the abstract transformers used by the propagation engine. Every
//! operator returns an interval that contains the image of the concrete
//! operation over all values drawn from its operands, and is as tight as the
//! per-element rule allows.

use derest_core::{Bound, DerestError, Result};
use ndarray::{Array, Array1, Array2, ArrayD, ArrayView2, Axis, Dimension, IxDyn, Slice, Zip};

/// A tensor of intervals: `lower[i] <= x[i] <= upper[i]`.
///
/// Invariant: `lower` and `upper` share a shape and `lower <= upper`
/// elementwise. [`Interval::new`] checks it; results of the operators below
/// preserve it for valid operands.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    pub lower: ArrayD<f32>,
    pub upper: ArrayD<f32>,
}

impl Interval {
    /// Create an interval tensor, checking shape agreement and ordering.
    pub fn new(lower: ArrayD<f32>, upper: ArrayD<f32>) -> Result<Self> {
        if lower.shape() != upper.shape() {
            return Err(DerestError::shape_mismatch(lower.shape(), upper.shape()));
        }
        let mut inverted = 0usize;
        let mut nan = 0usize;
        Zip::from(&lower).and(&upper).for_each(|&l, &u| {
            if l.is_nan() || u.is_nan() {
                nan += 1;
            } else if l > u {
                inverted += 1;
            }
        });
        if nan > 0 {
            return Err(DerestError::InvalidInterval(format!(
                "{nan} element(s) have a NaN bound"
            )));
        }
        if inverted > 0 {
            return Err(DerestError::InvalidInterval(format!(
                "{inverted} element(s) have lower > upper"
            )));
        }
        Ok(Self { lower, upper })
    }

    /// Create an interval without the ordering scan.
    ///
    /// For results already known to satisfy the invariant; checked in debug
    /// builds only.
    #[inline]
    pub fn new_unchecked(lower: ArrayD<f32>, upper: ArrayD<f32>) -> Self {
        debug_assert_eq!(lower.shape(), upper.shape());
        debug_assert!(
            Zip::from(&lower).and(&upper).all(|&l, &u| !(l > u)),
            "interval invariant violated"
        );
        Self { lower, upper }
    }

    /// Degenerate interval holding exact values.
    pub fn concrete(values: ArrayD<f32>) -> Self {
        Self {
            lower: values.clone(),
            upper: values,
        }
    }

    /// Interval of the given shape with every element in `[lower, upper]`.
    pub fn from_shape(shape: &[usize], lower: f32, upper: f32) -> Result<Self> {
        Self::new(
            ArrayD::from_elem(IxDyn(shape), lower),
            ArrayD::from_elem(IxDyn(shape), upper),
        )
    }

    /// Interval of the given shape with every element in `bound`.
    pub fn from_bound(shape: &[usize], bound: Bound) -> Result<Self> {
        Self::from_shape(shape, bound.lower, bound.upper)
    }

    /// Exact zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        Self::concrete(ArrayD::zeros(IxDyn(shape)))
    }

    /// Output-sensitivity seed: an exact `n x n` identity, one row per output.
    pub fn identity_seed(n: usize) -> Self {
        Self::concrete(Array2::<f32>::eye(n).into_dyn())
    }

    pub fn shape(&self) -> &[usize] {
        self.lower.shape()
    }

    pub fn ndim(&self) -> usize {
        self.lower.ndim()
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    /// Bound of a single element.
    pub fn get(&self, index: &[usize]) -> Option<Bound> {
        let l = *self.lower.get(IxDyn(index))?;
        let u = *self.upper.get(IxDyn(index))?;
        Some(Bound { lower: l, upper: u })
    }

    pub fn into_parts(self) -> (ArrayD<f32>, ArrayD<f32>) {
        (self.lower, self.upper)
    }

    /// Iterate over element bounds in logical (row-major) order.
    pub fn iter_bounds(&self) -> impl Iterator<Item = Bound> + '_ {
        self.lower
            .iter()
            .zip(self.upper.iter())
            .map(|(&lower, &upper)| Bound { lower, upper })
    }

    fn expect_shape(&self, other: &[usize]) -> Result<()> {
        if self.shape() != other {
            return Err(DerestError::shape_mismatch(self.shape(), other));
        }
        Ok(())
    }

    /// Apply a per-element interval transformer.
    pub fn map_bounds<F>(&self, f: F) -> Interval
    where
        F: Fn(Bound) -> Bound,
    {
        let mut lower = ArrayD::zeros(self.lower.raw_dim());
        let mut upper = ArrayD::zeros(self.lower.raw_dim());
        Zip::from(&mut lower)
            .and(&mut upper)
            .and(&self.lower)
            .and(&self.upper)
            .for_each(|lo, hi, &l, &u| {
                let r = f(Bound { lower: l, upper: u });
                *lo = r.lower;
                *hi = r.upper;
            });
        Interval::new_unchecked(lower, upper)
    }

    /// Apply a per-element binary interval transformer over two same-shaped operands.
    pub fn zip_bounds<F>(&self, other: &Interval, f: F) -> Result<Interval>
    where
        F: Fn(Bound, Bound) -> Bound,
    {
        self.expect_shape(other.shape())?;
        let mut lower = ArrayD::zeros(self.lower.raw_dim());
        let mut upper = ArrayD::zeros(self.lower.raw_dim());
        Zip::from(&mut lower)
            .and(&mut upper)
            .and(&self.lower)
            .and(&self.upper)
            .and(&other.lower)
            .and(&other.upper)
            .for_each(|lo, hi, &al, &au, &bl, &bu| {
                let r = f(
                    Bound {
                        lower: al,
                        upper: au,
                    },
                    Bound {
                        lower: bl,
                        upper: bu,
                    },
                );
                *lo = r.lower;
                *hi = r.upper;
            });
        Ok(Interval::new_unchecked(lower, upper))
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    /// `[a.l + b.l, a.u + b.u]`.
    pub fn add(&self, other: &Interval) -> Result<Interval> {
        self.expect_shape(other.shape())?;
        Ok(Interval::new_unchecked(
            &self.lower + &other.lower,
            &self.upper + &other.upper,
        ))
    }

    /// `[a.l - b.u, a.u - b.l]`.
    pub fn sub(&self, other: &Interval) -> Result<Interval> {
        self.expect_shape(other.shape())?;
        Ok(Interval::new_unchecked(
            &self.lower - &other.upper,
            &self.upper - &other.lower,
        ))
    }

    /// Shift by a concrete array of the same shape.
    pub fn add_array(&self, values: &ArrayD<f32>) -> Result<Interval> {
        self.expect_shape(values.shape())?;
        Ok(Interval::new_unchecked(
            &self.lower + values,
            &self.upper + values,
        ))
    }

    pub fn neg(&self) -> Interval {
        Interval::new_unchecked(self.upper.mapv(|u| -u), self.lower.mapv(|l| -l))
    }

    /// Multiply by a concrete scalar of either sign.
    pub fn scale(&self, s: f32) -> Interval {
        if s >= 0.0 {
            Interval::new_unchecked(self.lower.mapv(|l| l * s), self.upper.mapv(|u| u * s))
        } else {
            Interval::new_unchecked(self.upper.mapv(|u| u * s), self.lower.mapv(|l| l * s))
        }
    }

    /// Interval product: min/max of the four corner products.
    pub fn mul(&self, other: &Interval) -> Result<Interval> {
        self.zip_bounds(other, |a, b| a.mul(&b))
    }

    /// Product with a concrete array of mixed signs: min/max of the two corners.
    pub fn mul_array(&self, values: &ArrayD<f32>) -> Result<Interval> {
        self.expect_shape(values.shape())?;
        let mut lower = ArrayD::zeros(self.lower.raw_dim());
        let mut upper = ArrayD::zeros(self.lower.raw_dim());
        Zip::from(&mut lower)
            .and(&mut upper)
            .and(&self.lower)
            .and(&self.upper)
            .and(values)
            .for_each(|lo, hi, &l, &u, &v| {
                let a = l * v;
                let b = u * v;
                *lo = a.min(b);
                *hi = a.max(b);
            });
        Ok(Interval::new_unchecked(lower, upper))
    }

    fn count_containing_zero(&self) -> usize {
        Zip::from(&self.lower)
            .and(&self.upper)
            .fold(0, |acc, &l, &u| acc + usize::from(l <= 0.0 && u >= 0.0))
    }

    /// `1 / x`; the interval must exclude zero.
    pub fn reciprocal(&self) -> Result<Interval> {
        let zeros = self.count_containing_zero();
        if zeros > 0 {
            return Err(DerestError::DomainViolation(format!(
                "reciprocal of an interval containing zero ({zeros} element(s))"
            )));
        }
        Ok(Interval::new_unchecked(
            self.upper.mapv(|u| 1.0 / u),
            self.lower.mapv(|l| 1.0 / l),
        ))
    }

    /// Quotient; the divisor must exclude zero.
    pub fn div(&self, divisor: &Interval) -> Result<Interval> {
        self.expect_shape(divisor.shape())?;
        let zeros = divisor.count_containing_zero();
        if zeros > 0 {
            return Err(DerestError::DomainViolation(format!(
                "division by an interval containing zero ({zeros} element(s))"
            )));
        }
        self.zip_bounds(divisor, |a, b| {
            let ll = a.lower / b.lower;
            let lu = a.lower / b.upper;
            let ul = a.upper / b.lower;
            let uu = a.upper / b.upper;
            Bound {
                lower: ll.min(lu).min(ul.min(uu)),
                upper: ll.max(lu).max(ul.max(uu)),
            }
        })
    }

    /// `x²`; zero-straddling elements have lower bound 0.
    pub fn square(&self) -> Interval {
        self.map_bounds(square_bound)
    }

    /// `x^exponent`.
    ///
    /// Integer exponents follow the parity rules (negative exponents need an
    /// interval excluding zero). Non-integer exponents need a non-negative
    /// base (strictly positive for negative exponents).
    pub fn power(&self, exponent: f32) -> Result<Interval> {
        if exponent == 0.0 {
            return Ok(Interval::concrete(ArrayD::ones(self.lower.raw_dim())));
        }
        let is_integer = exponent.fract() == 0.0 && exponent.abs() <= i32::MAX as f32;
        if is_integer {
            let n = exponent as i32;
            if n < 0 {
                let zeros = self.count_containing_zero();
                if zeros > 0 {
                    return Err(DerestError::DomainViolation(format!(
                        "x^{n} on an interval containing zero ({zeros} element(s))"
                    )));
                }
            }
            return Ok(self.map_bounds(|b| power_int_bound(b, n)));
        }

        let min_lower = self.lower.iter().copied().fold(f32::INFINITY, f32::min);
        let violates = if exponent > 0.0 {
            min_lower < 0.0
        } else {
            min_lower <= 0.0
        };
        if violates && !self.is_empty() {
            return Err(DerestError::DomainViolation(format!(
                "x^{exponent} needs a {} base, smallest lower bound is {min_lower}",
                if exponent > 0.0 {
                    "non-negative"
                } else {
                    "positive"
                }
            )));
        }
        Ok(self.map_bounds(|b| {
            let le = b.lower.powf(exponent);
            let ue = b.upper.powf(exponent);
            if exponent > 0.0 {
                Bound {
                    lower: le,
                    upper: ue,
                }
            } else {
                Bound {
                    lower: ue,
                    upper: le,
                }
            }
        }))
    }

    pub fn abs(&self) -> Interval {
        self.map_bounds(|b| {
            if b.lower > 0.0 {
                b
            } else if b.upper < 0.0 {
                Bound {
                    lower: -b.upper,
                    upper: -b.lower,
                }
            } else {
                Bound {
                    lower: 0.0,
                    upper: (-b.lower).max(b.upper),
                }
            }
        })
    }

    pub fn exp(&self) -> Interval {
        Interval::new_unchecked(self.lower.mapv(f32::exp), self.upper.mapv(f32::exp))
    }

    /// Elementwise `max(a, b)` (monotone in both arguments).
    pub fn max(&self, other: &Interval) -> Result<Interval> {
        self.expect_shape(other.shape())?;
        Ok(Interval::new_unchecked(
            Zip::from(&self.lower)
                .and(&other.lower)
                .map_collect(|&a, &b| a.max(b)),
            Zip::from(&self.upper)
                .and(&other.upper)
                .map_collect(|&a, &b| a.max(b)),
        ))
    }

    /// Elementwise `max(a, s)` for a scalar `s`.
    pub fn max_scalar(&self, s: f32) -> Interval {
        Interval::new_unchecked(self.lower.mapv(|l| l.max(s)), self.upper.mapv(|u| u.max(s)))
    }

    /// Widen every element to contain zero.
    pub fn hull_with_zero(&self) -> Interval {
        Interval::new_unchecked(
            self.lower.mapv(|l| l.min(0.0)),
            self.upper.mapv(|u| u.max(0.0)),
        )
    }

    /// Sign-split contraction of the last axis against a concrete weight.
    ///
    /// `weights` is either a vector `(k,)` (the last axis is reduced away) or
    /// a matrix `(k, n)` (the last axis becomes `n`). With `W⁺ = max(W, 0)` and
    /// `W⁻ = min(W, 0)`:
    /// - lower = l·W⁺ + u·W⁻
    /// - upper = u·W⁺ + l·W⁻
    pub fn dot(&self, weights: &ArrayD<f32>) -> Result<Interval> {
        let k = match self.shape().last() {
            Some(&k) => k,
            None => {
                return Err(DerestError::ShapeMismatch {
                    expected: vec![weights.shape().first().copied().unwrap_or(0)],
                    got: vec![],
                })
            }
        };
        let (w, out_cols) = match weights.ndim() {
            1 => (weights_as_matrix(weights, weights.len(), 1)?, None),
            2 => (
                weights_as_matrix(weights, weights.shape()[0], weights.shape()[1])?,
                Some(weights.shape()[1]),
            ),
            _ => {
                return Err(DerestError::InvalidConfig(format!(
                    "dot needs a rank-1 or rank-2 weight, got rank {}",
                    weights.ndim()
                )))
            }
        };
        if w.nrows() != k {
            return Err(DerestError::shape_mismatch(&[k], &[w.nrows()]));
        }
        let rows = self.len() / k.max(1);
        let lower = weights_as_matrix(&self.lower, rows, k)?;
        let upper = weights_as_matrix(&self.upper, rows, k)?;
        let (mut l, mut u) = sign_split_matmul(lower.view(), upper.view(), w.view());
        order_bounds(&mut l, &mut u);

        let mut out_shape = self.shape()[..self.ndim() - 1].to_vec();
        if let Some(n) = out_cols {
            out_shape.push(n);
        }
        Ok(Interval::new_unchecked(
            reshape_owned(l, &out_shape)?,
            reshape_owned(u, &out_shape)?,
        ))
    }

    // =========================================================================
    // Structure
    // =========================================================================

    pub fn reshape(&self, shape: &[usize]) -> Result<Interval> {
        Ok(Interval::new_unchecked(
            reshape_owned(self.lower.clone(), shape)?,
            reshape_owned(self.upper.clone(), shape)?,
        ))
    }

    /// Flatten to 1-D in row-major order.
    pub fn flatten(&self) -> Interval {
        Interval::new_unchecked(
            Array1::from_iter(self.lower.iter().copied()).into_dyn(),
            Array1::from_iter(self.upper.iter().copied()).into_dyn(),
        )
    }

    fn check_axis(&self, axis: usize) -> Result<()> {
        if axis >= self.ndim() {
            return Err(DerestError::InvalidConfig(format!(
                "axis {axis} out of range for rank {}",
                self.ndim()
            )));
        }
        Ok(())
    }

    /// Sum along an axis (the axis is removed).
    pub fn sum_axis(&self, axis: usize) -> Result<Interval> {
        self.check_axis(axis)?;
        Ok(Interval::new_unchecked(
            self.lower.sum_axis(Axis(axis)),
            self.upper.sum_axis(Axis(axis)),
        ))
    }

    /// Bound on the sum of all elements.
    pub fn sum_all(&self) -> Bound {
        Bound {
            lower: self.lower.sum(),
            upper: self.upper.sum(),
        }
    }

    /// Sub-interval `start..end` along an axis.
    pub fn slice_axis(&self, axis: usize, start: usize, end: usize) -> Result<Interval> {
        self.check_axis(axis)?;
        let dim = self.shape()[axis];
        if start > end || end > dim {
            return Err(DerestError::InvalidConfig(format!(
                "slice {start}..{end} out of range for axis {axis} of size {dim}"
            )));
        }
        let slice = Slice::from(start..end);
        Ok(Interval::new_unchecked(
            self.lower.slice_axis(Axis(axis), slice).to_owned(),
            self.upper.slice_axis(Axis(axis), slice).to_owned(),
        ))
    }

    /// Sub-interval at `index` along an axis (the axis is removed).
    pub fn index_axis(&self, axis: usize, index: usize) -> Result<Interval> {
        self.check_axis(axis)?;
        if index >= self.shape()[axis] {
            return Err(DerestError::InvalidConfig(format!(
                "index {index} out of range for axis {axis} of size {}",
                self.shape()[axis]
            )));
        }
        Ok(Interval::new_unchecked(
            self.lower.index_axis(Axis(axis), index).to_owned(),
            self.upper.index_axis(Axis(axis), index).to_owned(),
        ))
    }

    /// Join intervals along an existing axis.
    pub fn concat(parts: &[Interval], axis: usize) -> Result<Interval> {
        let first = parts
            .first()
            .ok_or_else(|| DerestError::InvalidConfig("concat of zero intervals".into()))?;
        first.check_axis(axis)?;
        for part in &parts[1..] {
            if part.ndim() != first.ndim() {
                return Err(DerestError::shape_mismatch(first.shape(), part.shape()));
            }
            let mismatched = (0..first.ndim())
                .any(|d| d != axis && part.shape()[d] != first.shape()[d]);
            if mismatched {
                return Err(DerestError::shape_mismatch(first.shape(), part.shape()));
            }
        }
        let lowers: Vec<_> = parts.iter().map(|p| p.lower.view()).collect();
        let uppers: Vec<_> = parts.iter().map(|p| p.upper.view()).collect();
        let lower = ndarray::concatenate(Axis(axis), &lowers)
            .map_err(|e| DerestError::InvalidConfig(format!("concat: {e}")))?;
        let upper = ndarray::concatenate(Axis(axis), &uppers)
            .map_err(|e| DerestError::InvalidConfig(format!("concat: {e}")))?;
        Ok(Interval::new_unchecked(lower, upper))
    }

    /// Stack same-shaped intervals along a new leading axis.
    pub fn stack(parts: &[Interval]) -> Result<Interval> {
        let first = parts
            .first()
            .ok_or_else(|| DerestError::InvalidConfig("stack of zero intervals".into()))?;
        if let Some(bad) = parts.iter().find(|p| p.shape() != first.shape()) {
            return Err(DerestError::shape_mismatch(first.shape(), bad.shape()));
        }
        let lowers: Vec<_> = parts.iter().map(|p| p.lower.view()).collect();
        let uppers: Vec<_> = parts.iter().map(|p| p.upper.view()).collect();
        let lower = ndarray::stack(Axis(0), &lowers)
            .map_err(|e| DerestError::InvalidConfig(format!("stack: {e}")))?;
        let upper = ndarray::stack(Axis(0), &uppers)
            .map_err(|e| DerestError::InvalidConfig(format!("stack: {e}")))?;
        Ok(Interval::new_unchecked(lower, upper))
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// True when every element is an exact value.
    pub fn is_degenerate(&self) -> bool {
        self.lower == self.upper
    }

    /// Whether every concrete value lies inside its element interval.
    pub fn contains(&self, values: &ArrayD<f32>) -> bool {
        self.contains_with_tolerance(values, 0.0)
    }

    /// `contains` with an absolute slack for floating-point rounding.
    pub fn contains_with_tolerance(&self, values: &ArrayD<f32>, tolerance: f32) -> bool {
        values.shape() == self.shape()
            && Zip::from(values)
                .and(&self.lower)
                .and(&self.upper)
                .all(|&v, &l, &u| l - tolerance <= v && v <= u + tolerance)
    }

    /// Elementwise width `upper - lower`.
    pub fn width(&self) -> ArrayD<f32> {
        &self.upper - &self.lower
    }

    /// Largest element width (0 for an empty interval).
    pub fn max_width(&self) -> f32 {
        Zip::from(&self.lower)
            .and(&self.upper)
            .fold(0.0f32, |acc, &l, &u| acc.max(u - l))
    }

    /// Whether any bound is infinite or NaN.
    pub fn has_non_finite(&self) -> bool {
        self.lower.iter().chain(self.upper.iter()).any(|v| !v.is_finite())
    }
}

/// `x²` for one element.
#[inline]
pub fn square_bound(b: Bound) -> Bound {
    let ll = b.lower * b.lower;
    let uu = b.upper * b.upper;
    if b.lower <= 0.0 && b.upper >= 0.0 {
        Bound {
            lower: 0.0,
            upper: ll.max(uu),
        }
    } else {
        Bound {
            lower: ll.min(uu),
            upper: ll.max(uu),
        }
    }
}

/// `x^n` for one element and a non-zero integer exponent.
///
/// Negative `n` assumes the interval excludes zero.
#[inline]
fn power_int_bound(b: Bound, n: i32) -> Bound {
    let le = b.lower.powi(n);
    let ue = b.upper.powi(n);
    let even = n % 2 == 0;
    match (n > 0, even) {
        (true, false) => Bound {
            lower: le,
            upper: ue,
        },
        (true, true) if b.lower <= 0.0 && b.upper >= 0.0 => Bound {
            lower: 0.0,
            upper: le.max(ue),
        },
        (_, true) => Bound {
            lower: le.min(ue),
            upper: le.max(ue),
        },
        (false, false) => Bound {
            lower: ue,
            upper: le,
        },
    }
}

/// Sign-split product of an interval matrix `[l, u]` (m, k) with a concrete
/// matrix `w` (k, n).
pub fn sign_split_matmul(
    l: ArrayView2<f32>,
    u: ArrayView2<f32>,
    w: ArrayView2<f32>,
) -> (Array2<f32>, Array2<f32>) {
    let w_pos = w.mapv(|v| v.max(0.0));
    let w_neg = w.mapv(|v| v.min(0.0));
    let lower = l.dot(&w_pos) + u.dot(&w_neg);
    let upper = u.dot(&w_pos) + l.dot(&w_neg);
    (lower, upper)
}

/// Swap any pair left inverted by rounding in a sum of products.
///
/// The exact results satisfy `lower <= upper`; only the last ulp can disagree.
pub fn order_bounds<D: Dimension>(lower: &mut Array<f32, D>, upper: &mut Array<f32, D>) {
    Zip::from(lower).and(upper).for_each(|l, u| {
        if *l > *u {
            std::mem::swap(l, u);
        }
    });
}

fn weights_as_matrix(a: &ArrayD<f32>, rows: usize, cols: usize) -> Result<Array2<f32>> {
    if rows * cols != a.len() {
        return Err(DerestError::shape_mismatch(&[rows, cols], a.shape()));
    }
    Array2::from_shape_vec((rows, cols), a.iter().copied().collect())
        .map_err(|_| DerestError::shape_mismatch(&[rows, cols], a.shape()))
}

/// Reshape an owned array, copying into standard layout when needed.
pub fn reshape_owned<D: Dimension>(a: Array<f32, D>, shape: &[usize]) -> Result<ArrayD<f32>> {
    let got = a.shape().to_vec();
    if got.iter().product::<usize>() != shape.iter().product::<usize>() {
        return Err(DerestError::shape_mismatch(shape, &got));
    }
    let a = if a.is_standard_layout() {
        a
    } else {
        a.as_standard_layout().into_owned()
    };
    a.into_shape_with_order(IxDyn(shape))
        .map_err(|_| DerestError::shape_mismatch(shape, &got))
}

#[cfg(test)]
mod tests;
