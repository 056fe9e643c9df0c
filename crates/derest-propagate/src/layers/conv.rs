use super::{batch_size, chw, collect_indexed, expect_shape, stack_rows, view3, view4, window_output};
use crate::network::Convolutional;
use derest_core::{DerestError, PropagationConfig, Result};
use derest_tensor::{order_bounds, Interval};
use ndarray::{Array1, Array2, Array3, Array4, Axis};

/// Grouped 2-D cross-correlation with symmetric zero padding.
#[derive(Debug, Clone)]
pub struct ConvTransform {
    weights: Array4<f32>,
    bias: Array1<f32>,
    stride: usize,
    padding: usize,
    groups: usize,
    input_shape: [usize; 3],
    output_shape: [usize; 3],
}

impl ConvTransform {
    pub fn new(layer: &Convolutional, input_shape: &[usize]) -> Result<Self> {
        layer.validate()?;
        let [c_in, h, w] = chw(input_shape, "convolution")?;
        let expected_c_in = layer.c_in_per_group() * layer.groups;
        if c_in != expected_c_in {
            return Err(DerestError::shape_mismatch(
                &[expected_c_in, h, w],
                input_shape,
            ));
        }
        let (fh, fw) = layer.filter_size();
        let oh = window_output(h, fh, layer.stride, layer.padding)?;
        let ow = window_output(w, fw, layer.stride, layer.padding)?;
        Ok(Self {
            weights: layer.weights.clone(),
            bias: layer.bias.clone(),
            stride: layer.stride,
            padding: layer.padding,
            groups: layer.groups,
            input_shape: [c_in, h, w],
            output_shape: [layer.c_out(), oh, ow],
        })
    }

    pub fn input_shape(&self) -> &[usize; 3] {
        &self.input_shape
    }

    pub fn output_shape(&self) -> &[usize; 3] {
        &self.output_shape
    }

    pub fn weights(&self) -> &Array4<f32> {
        &self.weights
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    fn c_in_per_group(&self) -> usize {
        self.weights.shape()[1]
    }

    fn c_out_per_group(&self) -> usize {
        self.output_shape[0] / self.groups
    }

    /// Absolute input channel of filter channel `ci` for output channel `o`.
    #[inline]
    pub fn input_channel(&self, o: usize, ci: usize) -> usize {
        (o / self.c_out_per_group()) * self.c_in_per_group() + ci
    }

    /// Input coordinate read by output index `i` at filter offset `d`, or
    /// `None` for a padding cell.
    #[inline]
    pub fn source_index(&self, i: usize, d: usize, extent: usize) -> Option<usize> {
        (i * self.stride + d)
            .checked_sub(self.padding)
            .filter(|&y| y < extent)
    }

    /// Sign-split sliding-window contraction, one output channel per task.
    pub fn forward(&self, input: &Interval, config: &PropagationConfig) -> Result<Interval> {
        expect_shape(input, &self.input_shape)?;
        let xl = view3(&input.lower)?;
        let xu = view3(&input.upper)?;
        let [c_out, oh, ow] = self.output_shape;
        let [_, h, w] = self.input_shape;
        let (fh, fw) = (self.weights.shape()[2], self.weights.shape()[3]);

        let planes = collect_indexed(c_out, config, |o| {
            let mut lo = Array2::from_elem((oh, ow), self.bias[o]);
            let mut hi = lo.clone();
            for ci in 0..self.c_in_per_group() {
                let c = self.input_channel(o, ci);
                for di in 0..fh {
                    for dj in 0..fw {
                        let wv = self.weights[[o, ci, di, dj]];
                        if wv == 0.0 {
                            continue;
                        }
                        for i in 0..oh {
                            let Some(y) = self.source_index(i, di, h) else {
                                continue;
                            };
                            for j in 0..ow {
                                let Some(x) = self.source_index(j, dj, w) else {
                                    continue;
                                };
                                let (l, u) = (xl[[c, y, x]], xu[[c, y, x]]);
                                if wv > 0.0 {
                                    lo[[i, j]] += wv * l;
                                    hi[[i, j]] += wv * u;
                                } else {
                                    lo[[i, j]] += wv * u;
                                    hi[[i, j]] += wv * l;
                                }
                            }
                        }
                    }
                }
            }
            (lo, hi)
        });

        let mut lower = Array3::zeros((c_out, oh, ow));
        let mut upper = Array3::zeros((c_out, oh, ow));
        for (o, (lo, hi)) in planes.into_iter().enumerate() {
            lower.index_axis_mut(Axis(0), o).assign(&lo);
            upper.index_axis_mut(Axis(0), o).assign(&hi);
        }
        order_bounds(&mut lower, &mut upper);
        Ok(Interval::new_unchecked(lower.into_dyn(), upper.into_dyn()))
    }

    /// Transposed convolution of the derivative: every output position
    /// scatters `D ⊗ W` back onto the input cells it read.
    pub fn backward(&self, derivative: &Interval, config: &PropagationConfig) -> Result<Interval> {
        let batch = batch_size(derivative, &self.output_shape)?;
        let dl = view4(&derivative.lower)?;
        let du = view4(&derivative.upper)?;
        let [c_out, oh, ow] = self.output_shape;
        let [c_in, h, w] = self.input_shape;
        let (fh, fw) = (self.weights.shape()[2], self.weights.shape()[3]);

        let rows = collect_indexed(batch, config, |b| {
            let mut lo = Array3::<f32>::zeros((c_in, h, w));
            let mut hi = Array3::<f32>::zeros((c_in, h, w));
            for o in 0..c_out {
                for i in 0..oh {
                    for j in 0..ow {
                        let (d_lo, d_hi) = (dl[[b, o, i, j]], du[[b, o, i, j]]);
                        if d_lo == 0.0 && d_hi == 0.0 {
                            continue;
                        }
                        for ci in 0..self.c_in_per_group() {
                            let c = self.input_channel(o, ci);
                            for di in 0..fh {
                                let Some(y) = self.source_index(i, di, h) else {
                                    continue;
                                };
                                for dj in 0..fw {
                                    let Some(x) = self.source_index(j, dj, w) else {
                                        continue;
                                    };
                                    let wv = self.weights[[o, ci, di, dj]];
                                    if wv >= 0.0 {
                                        lo[[c, y, x]] += wv * d_lo;
                                        hi[[c, y, x]] += wv * d_hi;
                                    } else {
                                        lo[[c, y, x]] += wv * d_hi;
                                        hi[[c, y, x]] += wv * d_lo;
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
