use derest_core::{DerestError, Result};
use derest_tensor::Interval;
use ndarray::{ArrayD, Zip};

/// ReLU derivative bound, broadcast over the batch axis.
///
/// The slope is 1 where the activation is strictly positive, 0 where it is
/// strictly negative, and anywhere in [0, 1] otherwise, which widens the
/// incoming derivative to include zero.
pub fn relu_backward(activation: &Interval, derivative: &Interval) -> Result<Interval> {
    let shape = derivative.shape();
    let broadcast_err = || {
        let mut expected = vec![shape.first().copied().unwrap_or(1)];
        expected.extend_from_slice(activation.shape());
        DerestError::shape_mismatch(&expected, shape)
    };
    if shape.len() != activation.ndim() + 1 {
        return Err(broadcast_err());
    }
    let al = activation.lower.broadcast(shape).ok_or_else(broadcast_err)?;
    let au = activation.upper.broadcast(shape).ok_or_else(broadcast_err)?;

    let mut lower = ArrayD::zeros(derivative.lower.raw_dim());
    let mut upper = ArrayD::zeros(derivative.lower.raw_dim());
    Zip::from(&mut lower)
        .and(&mut upper)
        .and(&derivative.lower)
        .and(&derivative.upper)
        .and(&al)
        .and(&au)
        .for_each(|lo, hi, &dl, &du, &a_lo, &a_hi| {
            if a_lo > 0.0 {
                *lo = dl;
                *hi = du;
            } else if a_hi < 0.0 {
                *lo = 0.0;
                *hi = 0.0;
            } else {
                *lo = dl.min(0.0);
                *hi = du.max(0.0);
            }
        });
    Ok(Interval::new_unchecked(lower, upper))
}
