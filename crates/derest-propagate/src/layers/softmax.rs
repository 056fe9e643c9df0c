use derest_core::{DerestError, Result};
use derest_tensor::{order_bounds, Interval};
use ndarray::{ArrayD, Axis, Zip};

/// Softmax over the last axis.
///
/// For each element the tight bounds are
/// `lower_i = e^{l_i} / (e^{l_i} + Σ_{j≠i} e^{u_j})` and
/// `upper_i = e^{u_i} / (e^{u_i} + Σ_{j≠i} e^{l_j})`,
/// evaluated after shifting every lane by its largest upper bound.
pub fn softmax_forward(input: &Interval) -> Result<Interval> {
    let axis = input
        .ndim()
        .checked_sub(1)
        .map(Axis)
        .ok_or_else(|| DerestError::InvalidConfig("softmax of a scalar".into()))?;
    let mut lower = ArrayD::<f32>::zeros(input.lower.raw_dim());
    let mut upper = ArrayD::<f32>::zeros(input.lower.raw_dim());

    Zip::from(lower.lanes_mut(axis))
        .and(upper.lanes_mut(axis))
        .and(input.lower.lanes(axis))
        .and(input.upper.lanes(axis))
        .for_each(|mut lo, mut hi, l, u| {
            let shift = u.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let el: Vec<f32> = l.iter().map(|&v| (v - shift).exp()).collect();
            let eu: Vec<f32> = u.iter().map(|&v| (v - shift).exp()).collect();
            let others_u = exclusive_sums(&eu);
            let others_l = exclusive_sums(&el);
            for i in 0..el.len() {
                // both sums can underflow for lanes with a huge spread
                let below = el[i] + others_u[i];
                let above = eu[i] + others_l[i];
                lo[i] = if below > 0.0 { el[i] / below } else { 0.0 };
                hi[i] = if above > 0.0 { eu[i] / above } else { 1.0 };
            }
        });
    order_bounds(&mut lower, &mut upper);
    Ok(Interval::new_unchecked(lower, upper))
}

/// `Σ_{j≠i} v_j` for every `i`, from prefix and suffix sums.
fn exclusive_sums(v: &[f32]) -> Vec<f32> {
    let n = v.len();
    let mut suffix = vec![0.0f32; n + 1];
    for i in (0..n).rev() {
        suffix[i] = suffix[i + 1] + v[i];
    }
    let mut prefix = 0.0f32;
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        out.push(prefix + suffix[i + 1]);
        prefix += v[i];
    }
    out
}
