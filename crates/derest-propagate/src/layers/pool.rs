use super::{batch_size, chw, collect_indexed, expect_shape, stack_rows, view3, view4, window_output};
use crate::network::{PoolMode, Pooling};
use derest_core::{Bound, PropagationConfig, Result};
use derest_tensor::Interval;
use ndarray::{Array3, ArrayView3};
use std::ops::Range;

#[derive(Debug, Clone)]
pub struct PoolTransform {
    mode: PoolMode,
    size: usize,
    stride: usize,
    padding: usize,
    input_shape: [usize; 3],
    output_shape: [usize; 3],
}

impl PoolTransform {
    pub fn new(layer: &Pooling, input_shape: &[usize]) -> Result<Self> {
        layer.validate()?;
        let [c, h, w] = chw(input_shape, "pooling")?;
        let oh = window_output(h, layer.pool_size, layer.stride, layer.padding)?;
        let ow = window_output(w, layer.pool_size, layer.stride, layer.padding)?;
        Ok(Self {
            mode: layer.mode,
            size: layer.pool_size,
            stride: layer.stride,
            padding: layer.padding,
            input_shape: [c, h, w],
            output_shape: [c, oh, ow],
        })
    }

    pub fn kind_name(&self) -> &'static str {
        match self.mode {
            PoolMode::Max => "max_pool",
            PoolMode::Avg => "avg_pool",
        }
    }

    pub fn output_shape(&self) -> &[usize; 3] {
        &self.output_shape
    }

    /// Real (non-padding) input cells covered by window `i` along an axis.
    fn window(&self, i: usize, extent: usize) -> Range<usize> {
        let start = (i * self.stride).saturating_sub(self.padding);
        let end = (i * self.stride + self.size)
            .saturating_sub(self.padding)
            .min(extent);
        start..end
    }

    fn window_area(&self) -> f32 {
        (self.size * self.size) as f32
    }

    pub fn forward(&self, input: &Interval) -> Result<Interval> {
        expect_shape(input, &self.input_shape)?;
        let xl = view3(&input.lower)?;
        let xu = view3(&input.upper)?;
        let [c_n, oh, ow] = self.output_shape;
        let [_, h, w] = self.input_shape;
        let mut lower = Array3::<f32>::zeros((c_n, oh, ow));
        let mut upper = Array3::<f32>::zeros((c_n, oh, ow));

        for c in 0..c_n {
            for i in 0..oh {
                let rows = self.window(i, h);
                for j in 0..ow {
                    let cols = self.window(j, w);
                    let (lo, hi) = match self.mode {
                        PoolMode::Max => {
                            let mut lo = f32::NEG_INFINITY;
                            let mut hi = f32::NEG_INFINITY;
                            for y in rows.clone() {
                                for x in cols.clone() {
                                    lo = lo.max(xl[[c, y, x]]);
                                    hi = hi.max(xu[[c, y, x]]);
                                }
                            }
                            (lo, hi)
                        }
                        PoolMode::Avg => {
                            let mut lo = 0.0;
                            let mut hi = 0.0;
                            for y in rows.clone() {
                                for x in cols.clone() {
                                    lo += xl[[c, y, x]];
                                    hi += xu[[c, y, x]];
                                }
                            }
                            (lo / self.window_area(), hi / self.window_area())
                        }
                    };
                    lower[[c, i, j]] = lo;
                    upper[[c, i, j]] = hi;
                }
            }
        }
        Ok(Interval::new_unchecked(lower.into_dyn(), upper.into_dyn()))
    }

    /// Cells of window `(c, i, j)` that can hold its maximum: those whose
    /// upper bound reaches the window's largest lower bound.
    fn plausible_argmax(
        &self,
        xl: &ArrayView3<f32>,
        xu: &ArrayView3<f32>,
        c: usize,
        i: usize,
        j: usize,
    ) -> Vec<(usize, usize)> {
        let [_, h, w] = self.input_shape;
        let (rows, cols) = (self.window(i, h), self.window(j, w));
        let mut best_lower = f32::NEG_INFINITY;
        for y in rows.clone() {
            for x in cols.clone() {
                best_lower = best_lower.max(xl[[c, y, x]]);
            }
        }
        let mut cells = Vec::new();
        for y in rows {
            for x in cols.clone() {
                if xu[[c, y, x]] >= best_lower {
                    cells.push((y, x));
                }
            }
        }
        cells
    }

    pub fn backward(
        &self,
        activation: &Interval,
        derivative: &Interval,
        config: &PropagationConfig,
    ) -> Result<Interval> {
        expect_shape(activation, &self.input_shape)?;
        let batch = batch_size(derivative, &self.output_shape)?;
        let dl = view4(&derivative.lower)?;
        let du = view4(&derivative.upper)?;
        let [c_n, oh, ow] = self.output_shape;
        let [_, h, w] = self.input_shape;

        // Arg-max candidates depend on the activation only; share them
        // across the batch.
        let routes: Vec<Vec<(usize, usize)>> = match self.mode {
            PoolMode::Max => {
                let xl = view3(&activation.lower)?;
                let xu = view3(&activation.upper)?;
                collect_indexed(c_n * oh * ow, config, |idx| {
                    let (c, rest) = (idx / (oh * ow), idx % (oh * ow));
                    self.plausible_argmax(&xl, &xu, c, rest / ow, rest % ow)
                })
            }
            PoolMode::Avg => Vec::new(),
        };

        let rows = collect_indexed(batch, config, |b| {
            let mut lo = Array3::<f32>::zeros((c_n, h, w));
            let mut hi = Array3::<f32>::zeros((c_n, h, w));
            for c in 0..c_n {
                for i in 0..oh {
                    for j in 0..ow {
                        let d = Bound {
                            lower: dl[[b, c, i, j]],
                            upper: du[[b, c, i, j]],
                        };
                        match self.mode {
                            PoolMode::Max => {
                                let cells = &routes[(c * oh + i) * ow + j];
                                let share = if cells.len() == 1 {
                                    d
                                } else {
                                    d.hull_with_zero()
                                };
                                for &(y, x) in cells {
                                    lo[[c, y, x]] += share.lower;
                                    hi[[c, y, x]] += share.upper;
                                }
                            }
                            PoolMode::Avg => {
                                let share = d.scale(1.0 / self.window_area());
                                for y in self.window(i, h) {
                                    for x in self.window(j, w) {
                                        lo[[c, y, x]] += share.lower;
                                        hi[[c, y, x]] += share.upper;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            (lo.into_dyn(), hi.into_dyn())
        });
        stack_rows(rows)
    }
}
