//! Interval operator tests.
//!
//! Fixed cases pin the exact results of each rule; the proptest block checks
//! that concrete values drawn from the operands always land inside the result.

use super::*;
use approx::assert_abs_diff_eq;
use ndarray::{arr1, arr2, ArrayD};
use proptest::prelude::*;

fn itv(lower: &[f32], upper: &[f32]) -> Interval {
    Interval::new(arr1(lower).into_dyn(), arr1(upper).into_dyn()).unwrap()
}

fn scalar(lower: f32, upper: f32) -> Interval {
    itv(&[lower], &[upper])
}

fn bounds_of(i: &Interval) -> Vec<(f32, f32)> {
    i.iter_bounds().map(|b| (b.lower, b.upper)).collect()
}

#[test]
fn test_new_rejects_inverted_bounds() {
    let err = Interval::new(arr1(&[1.0, 3.0]).into_dyn(), arr1(&[2.0, 2.0]).into_dyn());
    assert!(matches!(err, Err(DerestError::InvalidInterval(_))));
}

#[test]
fn test_new_rejects_nan() {
    let err = Interval::new(arr1(&[f32::NAN]).into_dyn(), arr1(&[1.0]).into_dyn());
    assert!(matches!(err, Err(DerestError::InvalidInterval(_))));
}

#[test]
fn test_new_rejects_shape_mismatch() {
    let err = Interval::new(arr1(&[0.0, 1.0]).into_dyn(), arr1(&[1.0]).into_dyn());
    assert!(matches!(err, Err(DerestError::ShapeMismatch { .. })));
}

#[test]
fn test_mul_positive_by_negative() {
    let r = scalar(1.0, 2.0).mul(&scalar(-3.0, -1.0)).unwrap();
    assert_eq!(bounds_of(&r), vec![(-6.0, -1.0)]);
}

#[test]
fn test_mul_table() {
    let a = Interval::new(
        arr2(&[[1.0, -2.0, -1.0], [-42.0, -5.0, -1.0]]).into_dyn(),
        arr2(&[[2.0, -1.0, 1.0], [4.0, -4.0, 7.0]]).into_dyn(),
    )
    .unwrap();
    let b = Interval::new(
        arr2(&[[1.0, 1.0, 4.0], [-1.0, -2.0, -13.0]]).into_dyn(),
        arr2(&[[2.0, 2.0, 5.0], [-1.0, -1.0, 1.0]]).into_dyn(),
    )
    .unwrap();
    let r = a.mul(&b).unwrap();
    assert_eq!(
        r.lower,
        arr2(&[[1.0, -4.0, -5.0], [-4.0, 4.0, -91.0]]).into_dyn()
    );
    assert_eq!(
        r.upper,
        arr2(&[[4.0, -1.0, 5.0], [42.0, 10.0, 13.0]]).into_dyn()
    );
    assert_eq!(b.mul(&a).unwrap(), r);
}

#[test]
fn test_mul_array_mixed_signs() {
    let a = itv(&[1.0, -4.0, 0.0], &[1.0, -1.0, 2.0]);
    let r = a.mul_array(&arr1(&[2.5, -2.0, -1.0]).into_dyn()).unwrap();
    assert_eq!(bounds_of(&r), vec![(2.5, 2.5), (2.0, 8.0), (-2.0, 0.0)]);
}

#[test]
fn test_scale_negative_swaps() {
    let r = itv(&[-1.0, 2.0], &[3.0, 5.0]).scale(-2.0);
    assert_eq!(bounds_of(&r), vec![(-6.0, 2.0), (-10.0, -4.0)]);
}

#[test]
fn test_sub_crosses_bounds() {
    let r = scalar(1.0, 4.0).sub(&scalar(-1.0, 2.0)).unwrap();
    assert_eq!(bounds_of(&r), vec![(-1.0, 5.0)]);
}

#[test]
fn test_square_straddling_zero() {
    assert_eq!(bounds_of(&scalar(-2.0, 3.0).square()), vec![(0.0, 9.0)]);
    assert_eq!(bounds_of(&scalar(-3.0, -2.0).square()), vec![(4.0, 9.0)]);
}

#[test]
fn test_reciprocal_positive() {
    let r = scalar(2.0, 4.0).reciprocal().unwrap();
    assert_eq!(bounds_of(&r), vec![(0.25, 0.5)]);
    let r = scalar(-4.0, -2.0).reciprocal().unwrap();
    assert_eq!(bounds_of(&r), vec![(-0.5, -0.25)]);
}

#[test]
fn test_reciprocal_and_div_reject_zero() {
    assert!(matches!(
        scalar(-1.0, 1.0).reciprocal(),
        Err(DerestError::DomainViolation(_))
    ));
    assert!(matches!(
        scalar(0.0, 1.0).reciprocal(),
        Err(DerestError::DomainViolation(_))
    ));
    assert!(matches!(
        scalar(1.0, 2.0).div(&scalar(-0.5, 3.0)),
        Err(DerestError::DomainViolation(_))
    ));
}

#[test]
fn test_div_corners() {
    let r = scalar(-6.0, 3.0).div(&scalar(2.0, 3.0)).unwrap();
    assert_eq!(bounds_of(&r), vec![(-3.0, 1.5)]);
}

#[test]
fn test_power_rules() {
    // odd: monotone
    assert_eq!(
        bounds_of(&scalar(-2.0, 3.0).power(3.0).unwrap()),
        vec![(-8.0, 27.0)]
    );
    // even straddling zero
    assert_eq!(
        bounds_of(&scalar(-2.0, 1.0).power(4.0).unwrap()),
        vec![(0.0, 16.0)]
    );
    // negative odd inverts monotonicity
    assert_eq!(
        bounds_of(&scalar(2.0, 4.0).power(-1.0).unwrap()),
        vec![(0.25, 0.5)]
    );
    // negative even on a negative interval
    assert_eq!(
        bounds_of(&scalar(-4.0, -2.0).power(-2.0).unwrap()),
        vec![(0.0625, 0.25)]
    );
    // non-integer on a non-negative domain
    let r = scalar(4.0, 9.0).power(0.5).unwrap();
    assert_abs_diff_eq!(r.lower[[0]], 2.0, epsilon = 1e-6);
    assert_abs_diff_eq!(r.upper[[0]], 3.0, epsilon = 1e-6);
    // zero exponent
    assert_eq!(
        bounds_of(&scalar(-5.0, 5.0).power(0.0).unwrap()),
        vec![(1.0, 1.0)]
    );
}

#[test]
fn test_power_domain_violations() {
    assert!(matches!(
        scalar(-1.0, 4.0).power(0.5),
        Err(DerestError::DomainViolation(_))
    ));
    assert!(matches!(
        scalar(0.0, 4.0).power(-0.5),
        Err(DerestError::DomainViolation(_))
    ));
    assert!(matches!(
        scalar(-1.0, 1.0).power(-2.0),
        Err(DerestError::DomainViolation(_))
    ));
}

#[test]
fn test_abs_cases() {
    let r = itv(&[1.0, -5.0, -2.0], &[3.0, -1.0, 7.0]).abs();
    assert_eq!(bounds_of(&r), vec![(1.0, 3.0), (1.0, 5.0), (0.0, 7.0)]);
}

#[test]
fn test_dot_sign_split_vector() {
    // two elements each in [1, 2] against W = [-1, 3]
    let a = itv(&[1.0, 1.0], &[2.0, 2.0]);
    let r = a.dot(&arr1(&[-1.0, 3.0]).into_dyn()).unwrap();
    assert_eq!(r.shape(), &[] as &[usize]);
    assert_eq!(r.get(&[]).unwrap(), Bound::new(1.0, 5.0));
}

#[test]
fn test_dot_matrix_keeps_leading_axes() {
    let a = Interval::new(
        arr2(&[[0.0, 1.0], [2.0, 2.0]]).into_dyn(),
        arr2(&[[1.0, 1.0], [3.0, 2.0]]).into_dyn(),
    )
    .unwrap();
    let w = arr2(&[[1.0, -1.0, 0.0], [2.0, 1.0, 1.0]]).into_dyn();
    let r = a.dot(&w).unwrap();
    assert_eq!(r.shape(), &[2, 3]);
    // row 0: x0 in [0,1], x1 = 1
    assert_eq!(r.get(&[0, 0]).unwrap(), Bound::new(2.0, 3.0));
    assert_eq!(r.get(&[0, 1]).unwrap(), Bound::new(0.0, 1.0));
    // row 1: x0 in [2,3], x1 = 2
    assert_eq!(r.get(&[1, 1]).unwrap(), Bound::new(-1.0, 0.0));
}

#[test]
fn test_dot_shape_mismatch() {
    let a = itv(&[0.0, 0.0, 0.0], &[1.0, 1.0, 1.0]);
    assert!(matches!(
        a.dot(&arr1(&[1.0, 2.0]).into_dyn()),
        Err(DerestError::ShapeMismatch { .. })
    ));
    assert!(matches!(
        a.dot(&ArrayD::ones(ndarray::IxDyn(&[3, 2, 2]))),
        Err(DerestError::InvalidConfig(_))
    ));
}

#[test]
fn test_max_and_relu() {
    let a = itv(&[-3.0, 1.0], &[2.0, 4.0]);
    let b = itv(&[0.0, -1.0], &[1.0, 5.0]);
    assert_eq!(bounds_of(&a.max(&b).unwrap()), vec![(0.0, 2.0), (1.0, 5.0)]);
    assert_eq!(bounds_of(&a.max_scalar(0.0)), vec![(0.0, 2.0), (1.0, 4.0)]);
}

#[test]
fn test_concat_and_slice_are_inverse() {
    let a = Interval::from_shape(&[2, 3], 0.0, 1.0).unwrap();
    let b = Interval::from_shape(&[1, 3], -1.0, 2.0).unwrap();
    let joined = Interval::concat(&[a.clone(), b.clone()], 0).unwrap();
    assert_eq!(joined.shape(), &[3, 3]);
    assert_eq!(joined.slice_axis(0, 0, 2).unwrap(), a);
    assert_eq!(joined.slice_axis(0, 2, 3).unwrap(), b);
}

#[test]
fn test_concat_rejects_mismatched_shapes() {
    let a = Interval::zeros(&[2, 3]);
    let b = Interval::zeros(&[2, 4]);
    assert!(matches!(
        Interval::concat(&[a, b], 0),
        Err(DerestError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_identity_seed() {
    let seed = Interval::identity_seed(3);
    assert!(seed.is_degenerate());
    assert_eq!(seed.shape(), &[3, 3]);
    assert_eq!(seed.lower[[1, 1]], 1.0);
    assert_eq!(seed.lower[[1, 2]], 0.0);
}

#[test]
fn test_reshape_flatten_sum() {
    let a = Interval::from_shape(&[2, 3], -1.0, 2.0).unwrap();
    let r = a.reshape(&[3, 2]).unwrap();
    assert_eq!(r.shape(), &[3, 2]);
    assert!(a.reshape(&[4]).is_err());
    assert_eq!(a.flatten().shape(), &[6]);
    let s = a.sum_axis(1).unwrap();
    assert_eq!(bounds_of(&s), vec![(-3.0, 6.0), (-3.0, 6.0)]);
    assert_eq!(a.sum_all(), Bound::new(-6.0, 12.0));
    assert_eq!(a.max_width(), 3.0);
}

#[test]
fn test_stack_and_index_axis() {
    let a = Interval::from_shape(&[2], 0.0, 1.0).unwrap();
    let b = Interval::from_shape(&[2], 2.0, 3.0).unwrap();
    let s = Interval::stack(&[a.clone(), b.clone()]).unwrap();
    assert_eq!(s.shape(), &[2, 2]);
    assert_eq!(s.index_axis(0, 1).unwrap(), b);
}

#[test]
fn test_exp_monotone() {
    let r = scalar(0.0, 1.0).exp();
    assert_abs_diff_eq!(r.lower[[0]], 1.0);
    assert_abs_diff_eq!(r.upper[[0]], std::f32::consts::E, epsilon = 1e-6);
}

// =============================================================================
// Property-based soundness
// =============================================================================

/// Slack for rounding in the concrete evaluation.
const FP_TOLERANCE: f32 = 1e-4;

fn valid_interval(range: f32) -> impl Strategy<Value = (f32, f32)> {
    (-range..range, -range..range).prop_map(|(a, b)| (a.min(b), a.max(b)))
}

fn sample_points(lower: f32, upper: f32, num_samples: usize) -> Vec<f32> {
    if lower == upper {
        return vec![lower];
    }
    (0..=num_samples)
        .map(|i| {
            let t = i as f32 / num_samples as f32;
            (lower + (upper - lower) * t).clamp(lower, upper)
        })
        .collect()
}

fn within(r: &Interval, v: f32) -> bool {
    let b = r.get(&[0]).unwrap();
    let tol = FP_TOLERANCE * (1.0 + v.abs());
    b.lower - tol <= v && v <= b.upper + tol
}

fn check_binary<F, G>((al, au): (f32, f32), (bl, bu): (f32, f32), op: F, concrete: G)
where
    F: Fn(&Interval, &Interval) -> Interval,
    G: Fn(f32, f32) -> f32,
{
    let a = scalar(al, au);
    let b = scalar(bl, bu);
    let r = op(&a, &b);
    assert!(r.lower[[0]] <= r.upper[[0]]);
    for x in sample_points(al, au, 8) {
        for y in sample_points(bl, bu, 8) {
            let v = concrete(x, y);
            assert!(within(&r, v), "{v} not in {:?} for x={x}, y={y}", r.get(&[0]));
        }
    }
}

fn check_unary<F, G>((l, u): (f32, f32), op: F, concrete: G)
where
    F: Fn(&Interval) -> Interval,
    G: Fn(f32) -> f32,
{
    let a = scalar(l, u);
    let r = op(&a);
    assert!(r.lower[[0]] <= r.upper[[0]]);
    for x in sample_points(l, u, 32) {
        let v = concrete(x);
        assert!(within(&r, v), "{v} not in {:?} for x={x}", r.get(&[0]));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn soundness_add(a in valid_interval(100.0), b in valid_interval(100.0)) {
        check_binary(a, b, |x, y| x.add(y).unwrap(), |x, y| x + y);
    }

    #[test]
    fn soundness_sub(a in valid_interval(100.0), b in valid_interval(100.0)) {
        check_binary(a, b, |x, y| x.sub(y).unwrap(), |x, y| x - y);
    }

    #[test]
    fn soundness_mul(a in valid_interval(50.0), b in valid_interval(50.0)) {
        check_binary(a, b, |x, y| x.mul(y).unwrap(), |x, y| x * y);
    }

    #[test]
    fn soundness_div(a in valid_interval(50.0), (bl, bu) in valid_interval(50.0), shift in 0.5f32..10.0) {
        // move the divisor off zero
        let b = if bl > 0.0 || bu < 0.0 { (bl, bu) } else { (bu.abs() + shift, bu.abs() + 2.0 * shift) };
        check_binary(a, b, |x, y| x.div(y).unwrap(), |x, y| x / y);
    }

    #[test]
    fn soundness_max(a in valid_interval(100.0), b in valid_interval(100.0)) {
        check_binary(a, b, |x, y| x.max(y).unwrap(), f32::max);
    }

    #[test]
    fn soundness_square(a in valid_interval(30.0)) {
        check_unary(a, Interval::square, |x| x * x);
    }

    #[test]
    fn soundness_abs(a in valid_interval(100.0)) {
        check_unary(a, Interval::abs, f32::abs);
    }

    #[test]
    fn soundness_exp(a in valid_interval(10.0)) {
        check_unary(a, Interval::exp, f32::exp);
    }

    #[test]
    fn soundness_power_integer(a in valid_interval(4.0), n in 1i32..6) {
        check_unary(a, |x| x.power(n as f32).unwrap(), |x| x.powi(n));
    }

    #[test]
    fn soundness_power_negative_integer(
        (l, u) in valid_interval(4.0),
        negative in any::<bool>(),
        n in -5i32..0,
    ) {
        let (lo, hi) = (0.25 + l.abs().min(u.abs()), 0.25 + l.abs().max(u.abs()));
        let a = if negative { (-hi, -lo) } else { (lo, hi) };
        check_unary(a, |x| x.power(n as f32).unwrap(), |x| x.powi(n));
    }

    #[test]
    fn soundness_power_fractional((l, u) in valid_interval(20.0), e in 0.1f32..3.0) {
        let a = (l.abs().min(u.abs()), l.abs().max(u.abs()));
        check_unary(a, |x| x.power(e).unwrap(), |x| x.powf(e));
    }

    #[test]
    fn soundness_dot(
        (l0, u0) in valid_interval(10.0),
        (l1, u1) in valid_interval(10.0),
        w0 in -5.0f32..5.0,
        w1 in -5.0f32..5.0,
    ) {
        let a = itv(&[l0, l1], &[u0, u1]);
        let r = a.dot(&arr1(&[w0, w1]).into_dyn()).unwrap();
        let b = r.get(&[]).unwrap();
        prop_assert!(b.lower <= b.upper);
        for x0 in sample_points(l0, u0, 6) {
            for x1 in sample_points(l1, u1, 6) {
                let v = x0 * w0 + x1 * w1;
                let tol = FP_TOLERANCE * (1.0 + v.abs());
                prop_assert!(b.lower - tol <= v && v <= b.upper + tol);
            }
        }
    }

    #[test]
    fn degenerate_operands_give_exact_results(x in -20.0f32..20.0, y in 0.5f32..20.0) {
        let a = scalar(x, x);
        let b = scalar(y, y);
        prop_assert!(a.add(&b).unwrap().is_degenerate());
        prop_assert_eq!(a.mul(&b).unwrap().lower[[0]], x * y);
        prop_assert!(a.mul(&b).unwrap().is_degenerate());
        prop_assert_eq!(a.div(&b).unwrap().lower[[0]], x / y);
        prop_assert!(a.square().is_degenerate());
        prop_assert!(a.abs().is_degenerate());
        prop_assert_eq!(a.abs().lower[[0]], x.abs());
        prop_assert!(a.max(&b).unwrap().is_degenerate());
        let d = itv(&[x, y], &[x, y]).dot(&ArrayD::from_elem(ndarray::IxDyn(&[2]), -1.5)).unwrap();
        prop_assert!(d.is_degenerate());
    }
}
