//! Cross-module tests for the propagation engine, layer transforms,
//! indicators and pruning.
//!
//! Layer transforms are checked against plain concrete evaluators defined
//! here: a point sampled inside an input box, pushed through the concrete
//! function, must land inside the bound the transform computes.

mod inception;

use crate::network::{Convolutional, FullyConnected, LocalResponseNorm, PoolMode, Pooling};
use derest_core::PropagationConfig;
use derest_tensor::Interval;
use ndarray::{Array1, ArrayD, IxDyn};

/// Tolerance for floating-point precision in enclosure checks, scaled by
/// `1 + |value|`.
pub(crate) const FP_TOLERANCE: f32 = 1e-4;

pub(crate) fn seq() -> PropagationConfig {
    PropagationConfig::sequential()
}

/// Parallel even for tiny inputs.
pub(crate) fn par() -> PropagationConfig {
    PropagationConfig {
        parallel: true,
        min_parallel_items: 1,
    }
}

/// Deterministic pseudo-random values in [-1, 1).
pub(crate) fn pseudo_random(n: usize, seed: u64) -> Vec<f32> {
    const A: u64 = 6364136223846793005;
    const C: u64 = 1442695040888963407;
    let mut state = seed.wrapping_mul(A).wrapping_add(C);
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(A).wrapping_add(C);
            ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        })
        .collect()
}

pub(crate) fn random_array(shape: &[usize], seed: u64) -> ArrayD<f32> {
    let n = shape.iter().product();
    ArrayD::from_shape_vec(IxDyn(shape), pseudo_random(n, seed)).unwrap()
}

/// Box with centers in `[-scale, scale)` and half-widths in `[0, radius)`.
pub(crate) fn random_box(shape: &[usize], seed: u64, scale: f32, radius: f32) -> Interval {
    let centers = random_array(shape, seed).mapv(|v| v * scale);
    let radii = random_array(shape, seed ^ 0x9e37_79b9).mapv(|v| v.abs() * radius);
    Interval::new(&centers - &radii, &centers + &radii).unwrap()
}

/// A point inside `interval`.
pub(crate) fn sample_inside(interval: &Interval, seed: u64) -> ArrayD<f32> {
    let t = random_array(interval.shape(), seed).mapv(|v| (v + 1.0) / 2.0);
    let mut out = interval.lower.clone();
    ndarray::Zip::from(&mut out)
        .and(&interval.upper)
        .and(&t)
        .for_each(|o, &u, &t| *o = (*o + (u - *o) * t).clamp(*o, u));
    out
}

pub(crate) fn assert_encloses(bound: &Interval, values: &ArrayD<f32>, what: &str) {
    assert_eq!(bound.shape(), values.shape(), "{what}: shape");
    for ((idx, &v), (&l, &u)) in values
        .indexed_iter()
        .zip(bound.lower.iter().zip(bound.upper.iter()))
    {
        let tol = FP_TOLERANCE * (1.0 + v.abs());
        assert!(
            l - tol <= v && v <= u + tol,
            "{what}: value {v} at {idx:?} outside [{l}, {u}]"
        );
    }
}

pub(crate) fn assert_intervals_close(a: &Interval, b: &Interval, what: &str) {
    assert_eq!(a.shape(), b.shape(), "{what}: shape");
    for (x, y) in a
        .lower
        .iter()
        .zip(b.lower.iter())
        .chain(a.upper.iter().zip(b.upper.iter()))
    {
        assert!(
            (x - y).abs() <= FP_TOLERANCE * (1.0 + x.abs()),
            "{what}: {x} != {y}"
        );
    }
}

pub(crate) fn fc_eval(x: &ArrayD<f32>, fc: &FullyConnected) -> ArrayD<f32> {
    let flat = Array1::from_iter(x.iter().copied());
    (flat.dot(&fc.weights) + &fc.bias).into_dyn()
}

pub(crate) fn conv_eval(x: &ArrayD<f32>, conv: &Convolutional) -> ArrayD<f32> {
    let (c_out, c_in_g, fh, fw) = conv.weights.dim();
    let (h, w) = (x.shape()[1], x.shape()[2]);
    let (s, p) = (conv.stride, conv.padding);
    let oh = (h + 2 * p - fh) / s + 1;
    let ow = (w + 2 * p - fw) / s + 1;
    let c_out_g = c_out / conv.groups;
    let mut out = ArrayD::zeros(IxDyn(&[c_out, oh, ow]));
    for o in 0..c_out {
        let group = o / c_out_g;
        for i in 0..oh {
            for j in 0..ow {
                let mut acc = conv.bias[o];
                for ci in 0..c_in_g {
                    for di in 0..fh {
                        for dj in 0..fw {
                            let y = (i * s + di) as isize - p as isize;
                            let xx = (j * s + dj) as isize - p as isize;
                            if y < 0 || xx < 0 || y as usize >= h || xx as usize >= w {
                                continue;
                            }
                            acc += conv.weights[[o, ci, di, dj]]
                                * x[[group * c_in_g + ci, y as usize, xx as usize]];
                        }
                    }
                }
                out[[o, i, j]] = acc;
            }
        }
    }
    out
}

/// Real input cells covered by pooling window `i` along one axis.
pub(crate) fn pool_cells(i: usize, pool: &Pooling, extent: usize) -> Vec<usize> {
    (0..pool.pool_size)
        .filter_map(|d| {
            let y = (i * pool.stride + d) as isize - pool.padding as isize;
            (y >= 0 && (y as usize) < extent).then_some(y as usize)
        })
        .collect()
}

pub(crate) fn pool_eval(x: &ArrayD<f32>, pool: &Pooling) -> ArrayD<f32> {
    let (c_n, h, w) = (x.shape()[0], x.shape()[1], x.shape()[2]);
    let oh = (h + 2 * pool.padding - pool.pool_size) / pool.stride + 1;
    let ow = (w + 2 * pool.padding - pool.pool_size) / pool.stride + 1;
    let area = (pool.pool_size * pool.pool_size) as f32;
    let mut out = ArrayD::zeros(IxDyn(&[c_n, oh, ow]));
    for c in 0..c_n {
        for i in 0..oh {
            for j in 0..ow {
                let cells = pool_cells(i, pool, h)
                    .into_iter()
                    .flat_map(|y| pool_cells(j, pool, w).into_iter().map(move |x| (y, x)));
                out[[c, i, j]] = match pool.mode {
                    PoolMode::Max => cells
                        .map(|(y, xx)| x[[c, y, xx]])
                        .fold(f32::NEG_INFINITY, f32::max),
                    PoolMode::Avg => cells.map(|(y, xx)| x[[c, y, xx]]).sum::<f32>() / area,
                };
            }
        }
    }
    out
}

/// LRN of one channel column, in f64.
pub(crate) fn lrn_column(x: &[f64], lrn: &LocalResponseNorm) -> Vec<f64> {
    let (k, alpha, beta) = (lrn.k as f64, lrn.alpha as f64, lrn.beta as f64);
    (0..x.len())
        .map(|c| {
            let sum: f64 = lrn.window(c, x.len()).map(|j| x[j] * x[j]).sum();
            x[c] / (k + alpha * sum).powf(beta)
        })
        .collect()
}

/// Central-difference Jacobian `J[c][j] = ∂y_c/∂x_j` of one LRN column.
pub(crate) fn lrn_column_jacobian(x: &[f64], lrn: &LocalResponseNorm) -> Vec<Vec<f64>> {
    const H: f64 = 1e-6;
    let n = x.len();
    let mut jac = vec![vec![0.0; n]; n];
    for j in 0..n {
        let mut plus = x.to_vec();
        let mut minus = x.to_vec();
        plus[j] += H;
        minus[j] -= H;
        let (yp, ym) = (lrn_column(&plus, lrn), lrn_column(&minus, lrn));
        for c in 0..n {
            jac[c][j] = (yp[c] - ym[c]) / (2.0 * H);
        }
    }
    jac
}

pub(crate) fn lrn_eval(x: &ArrayD<f32>, lrn: &LocalResponseNorm) -> ArrayD<f32> {
    let (c_n, h, w) = (x.shape()[0], x.shape()[1], x.shape()[2]);
    let mut out = ArrayD::zeros(x.raw_dim());
    for y in 0..h {
        for xx in 0..w {
            let column: Vec<f64> = (0..c_n).map(|c| x[[c, y, xx]] as f64).collect();
            for (c, v) in lrn_column(&column, lrn).into_iter().enumerate() {
                out[[c, y, xx]] = v as f32;
            }
        }
    }
    out
}

pub(crate) fn softmax_eval(x: &[f32]) -> Vec<f32> {
    let m = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let e: Vec<f32> = x.iter().map(|v| (v - m).exp()).collect();
    let s: f32 = e.iter().sum();
    e.iter().map(|v| v / s).collect()
}
