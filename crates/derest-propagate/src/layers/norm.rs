//! Local response normalization across channels.
//!
//! `y_c = x_c / (k + α Σ_{j∈W(c)} x_j²)^β`
//!
//! The forward bound and both local derivatives are non-monotone rational
//! functions of the inputs, so each is bounded by evaluating a finite set of
//! candidate points (box corners plus the stationary points that fall inside
//! the box) and taking the min and max.

use super::{batch_size, chw, collect_indexed, expect_shape, stack_rows, view3, view4};
use crate::network::LocalResponseNorm;
use derest_core::{Bound, PropagationConfig, Result};
use derest_tensor::{square_bound, Interval};
use ndarray::{Array3, ArrayD, ArrayView3, IxDyn};

#[derive(Debug, Clone)]
pub struct NormTransform {
    params: LocalResponseNorm,
    shape: [usize; 3],
}

/// Running min/max over candidate values.
struct Extremes {
    lower: f32,
    upper: f32,
}

impl Extremes {
    fn new(first: f32) -> Self {
        Self {
            lower: first,
            upper: first,
        }
    }

    #[inline]
    fn push(&mut self, v: f32) {
        self.lower = self.lower.min(v);
        self.upper = self.upper.max(v);
    }

    fn bound(&self) -> Bound {
        Bound {
            lower: self.lower,
            upper: self.upper,
        }
    }
}

/// Bound on `x / (c + αx²)^β` for `x ∈ x`, `c ∈ c`.
///
/// Monotone in `c` for fixed `x`; along `x` the stationary points are
/// `x = ±√(c / (α(2β - 1)))` when β > ½.
pub fn norm_output(x: Bound, c: Bound, alpha: f32, beta: f32) -> Bound {
    let f = |x: f32, c: f32| x / (c + alpha * x * x).powf(beta);
    let mut acc = Extremes::new(f(x.lower, c.lower));
    for cv in [c.lower, c.upper] {
        acc.push(f(x.lower, cv));
        acc.push(f(x.upper, cv));
        if alpha > 0.0 && beta > 0.5 {
            let r = (cv / (alpha * (2.0 * beta - 1.0))).sqrt();
            for xv in [r, -r] {
                if x.contains(xv) {
                    acc.push(f(xv, cv));
                }
            }
        }
    }
    acc.bound()
}

/// Bound on `∂y_c/∂x_c = (c + α(1-2β)u) / (c + αu)^{β+1}` with `u = x_c²`.
///
/// `c` is `k + α Σ x_j²` over the other channels of the window. The function
/// has no interior critical point for β > 0, so the candidates are the box
/// corners, the stationary point `u = 3c / (α(2β-1))` on each `c` edge and
/// the stationary point `c = α(2β+1)u` on each `u` edge.
pub fn norm_self_derivative(x: Bound, c: Bound, alpha: f32, beta: f32) -> Bound {
    let u = square_bound(x);
    let g = |u: f32, c: f32| (c + alpha * (1.0 - 2.0 * beta) * u) / (c + alpha * u).powf(beta + 1.0);
    let mut acc = Extremes::new(g(u.lower, c.lower));
    for cv in [c.lower, c.upper] {
        for uv in [u.lower, u.upper] {
            acc.push(g(uv, cv));
        }
        if alpha > 0.0 && beta > 0.5 {
            let u_star = 3.0 * cv / (alpha * (2.0 * beta - 1.0));
            if u.contains(u_star) {
                acc.push(g(u_star, cv));
            }
        }
    }
    if alpha > 0.0 {
        for uv in [u.lower, u.upper] {
            let c_star = alpha * (2.0 * beta + 1.0) * uv;
            if c.contains(c_star) {
                acc.push(g(uv, c_star));
            }
        }
    }
    acc.bound()
}

/// Bound on `∂y_c/∂x_j = -2αβ x_j x_c / (c + αx_j² + αx_c²)^{β+1}` for a
/// neighbor channel `j ≠ c`.
///
/// `c` is `k + α Σ x²` over the window of `c` without `c` and `j`. The
/// function is monotone in `c`. In `(x_j, x_c)` the candidates are the box
/// corners, the interior points `|x_j| = |x_c| = √(c / (2αβ))`, the edge
/// points `x_c = ±√((c + αx_j²) / (α(2β+1)))` (and symmetrically), and 0
/// whenever either interval contains 0.
pub fn norm_neighbor_derivative(xj: Bound, xc: Bound, c: Bound, alpha: f32, beta: f32) -> Bound {
    if alpha == 0.0 || beta == 0.0 {
        return Bound::zero();
    }
    let scale = -2.0 * alpha * beta;
    let g = |p: f32, q: f32, c: f32| {
        scale * p * q / (c + alpha * p * p + alpha * q * q).powf(beta + 1.0)
    };
    let mut acc = Extremes::new(g(xj.lower, xc.lower, c.lower));
    if xj.contains_zero() || xc.contains_zero() {
        acc.push(0.0);
    }
    for cv in [c.lower, c.upper] {
        for p in [xj.lower, xj.upper] {
            for q in [xc.lower, xc.upper] {
                acc.push(g(p, q, cv));
            }
        }

        let r = (cv / (2.0 * alpha * beta)).sqrt();
        for p in [r, -r] {
            for q in [r, -r] {
                if xj.contains(p) && xc.contains(q) {
                    acc.push(g(p, q, cv));
                }
            }
        }

        let edge = alpha * (2.0 * beta + 1.0);
        for p in [xj.lower, xj.upper] {
            let t = ((cv + alpha * p * p) / edge).sqrt();
            for q in [t, -t] {
                if xc.contains(q) {
                    acc.push(g(p, q, cv));
                }
            }
        }
        for q in [xc.lower, xc.upper] {
            let t = ((cv + alpha * q * q) / edge).sqrt();
            for p in [t, -t] {
                if xj.contains(p) {
                    acc.push(g(p, q, cv));
                }
            }
        }
    }
    acc.bound()
}

impl NormTransform {
    pub fn new(layer: &LocalResponseNorm, input_shape: &[usize]) -> Result<Self> {
        layer.validate()?;
        let shape = chw(input_shape, "local response normalization")?;
        Ok(Self {
            params: layer.clone(),
            shape,
        })
    }

    /// `k + α Σ x_j²` over the window of channel `c`, skipping `skip`.
    fn partial_denominator(
        &self,
        squares: &[Bound],
        c: usize,
        skip: &[usize],
    ) -> Bound {
        let mut sum = Bound::zero();
        for j in self.params.window(c, self.shape[0]) {
            if !skip.contains(&j) {
                sum = sum.add(&squares[j]);
            }
        }
        Bound {
            lower: self.params.k + self.params.alpha * sum.lower,
            upper: self.params.k + self.params.alpha * sum.upper,
        }
    }

    /// Channel bounds and their squares at one spatial position.
    fn column(xl: &ArrayView3<f32>, xu: &ArrayView3<f32>, y: usize, x: usize) -> (Vec<Bound>, Vec<Bound>) {
        let channels = xl.shape()[0];
        let values: Vec<Bound> = (0..channels)
            .map(|c| Bound {
                lower: xl[[c, y, x]],
                upper: xu[[c, y, x]],
            })
            .collect();
        let squares = values.iter().map(|&b| square_bound(b)).collect();
        (values, squares)
    }

    pub fn forward(&self, input: &Interval, config: &PropagationConfig) -> Result<Interval> {
        expect_shape(input, &self.shape)?;
        let xl = view3(&input.lower)?;
        let xu = view3(&input.upper)?;
        let [channels, h, w] = self.shape;
        let spatial = h * w;
        let (alpha, beta) = (self.params.alpha, self.params.beta);

        let columns: Vec<Vec<Bound>> = collect_indexed(spatial, config, |pos| {
            let (values, squares) = Self::column(&xl, &xu, pos / w, pos % w);
            (0..channels)
                .map(|c| {
                    let others = self.partial_denominator(&squares, c, &[c]);
                    norm_output(values[c], others, alpha, beta)
                })
                .collect()
        });

        let mut lower = Array3::<f32>::zeros((channels, h, w));
        let mut upper = Array3::<f32>::zeros((channels, h, w));
        for (pos, column) in columns.iter().enumerate() {
            for (c, b) in column.iter().enumerate() {
                lower[[c, pos / w, pos % w]] = b.lower;
                upper[[c, pos / w, pos % w]] = b.upper;
            }
        }
        Ok(Interval::new_unchecked(lower.into_dyn(), upper.into_dyn()))
    }

    /// Local Jacobian bounds `G(c, j)` at one position, for `j ∈ W(c)` in
    /// window order.
    fn local_jacobian(&self, values: &[Bound], squares: &[Bound]) -> Vec<Vec<Bound>> {
        let (alpha, beta) = (self.params.alpha, self.params.beta);
        let channels = self.shape[0];
        (0..channels)
            .map(|c| {
                self.params
                    .window(c, channels)
                    .map(|j| {
                        if j == c {
                            let others = self.partial_denominator(squares, c, &[c]);
                            norm_self_derivative(values[c], others, alpha, beta)
                        } else {
                            let rest = self.partial_denominator(squares, c, &[c, j]);
                            norm_neighbor_derivative(values[j], values[c], rest, alpha, beta)
                        }
                    })
                    .collect()
            })
            .collect()
    }

    /// Upstream derivative `U[b, j] = Σ_{c : j ∈ W(c)} D[b, c] ⊗ G(c, j)` at
    /// every position.
    pub fn backward(
        &self,
        activation: &Interval,
        derivative: &Interval,
        config: &PropagationConfig,
    ) -> Result<Interval> {
        expect_shape(activation, &self.shape)?;
        let batch = batch_size(derivative, &self.shape)?;
        let xl = view3(&activation.lower)?;
        let xu = view3(&activation.upper)?;
        let dl = view4(&derivative.lower)?;
        let du = view4(&derivative.upper)?;
        let [channels, h, w] = self.shape;
        let spatial = h * w;

        let jacobians: Vec<Vec<Vec<Bound>>> = collect_indexed(spatial, config, |pos| {
            let (values, squares) = Self::column(&xl, &xu, pos / w, pos % w);
            self.local_jacobian(&values, &squares)
        });

        let rows = collect_indexed(batch, config, |b| {
            let mut lo = ArrayD::<f32>::zeros(IxDyn(&self.shape));
            let mut hi = ArrayD::<f32>::zeros(IxDyn(&self.shape));
            for (pos, jacobian) in jacobians.iter().enumerate() {
                let (y, x) = (pos / w, pos % w);
                for (c, row) in jacobian.iter().enumerate() {
                    let d = Bound {
                        lower: dl[[b, c, y, x]],
                        upper: du[[b, c, y, x]],
                    };
                    if d.lower == 0.0 && d.upper == 0.0 {
                        continue;
                    }
                    for (j, g) in self.params.window(c, channels).zip(row) {
                        let term = d.mul(g);
                        lo[[j, y, x]] += term.lower;
                        hi[[j, y, x]] += term.upper;
                    }
                }
            }
            (lo, hi)
        });
        stack_rows(rows)
    }
}
