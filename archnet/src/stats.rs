//! Statistics functions

use ndarray::prelude::*;
use ndarray::{Data, DataMut};
use num_traits::FromPrimitive;
use std::ops::{Add, Div};

/// Return the median, or `None` for an empty slice. Sorts its argument in place.
pub fn median_mut<T>(xs: &mut [T]) -> Option<T>
where
    T: Copy + Ord + FromPrimitive + Add<Output = T> + Div<Output = T>,
{
    if xs.is_empty() {
        return None;
    }
    xs.sort_unstable();
    let n = xs.len();
    if n % 2 == 0 {
        Some((xs[n / 2] + xs[n / 2 - 1]) / T::from_u64(2)?)
    } else {
        Some(xs[n / 2])
    }
}

/// Pearson correlation of two equal-length vectors. A constant vector has zero correlation
/// with everything.
pub fn pearson<S1, S2>(a: &ArrayBase<S1, Ix1>, b: &ArrayBase<S2, Ix1>) -> f64
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    assert_eq!(a.len(), b.len());
    let n = a.len() as f64;
    if a.is_empty() {
        return 0.0;
    }
    let mean_a = a.sum() / n;
    let mean_b = b.sum() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return 0.0;
    }
    (cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0)
}

/// Scale each row of `x` to unit L2 norm. All-zero rows are left alone.
pub fn l2_normalize_rows<S: DataMut<Elem = f64>>(x: &mut ArrayBase<S, Ix2>) {
    for mut row in x.axis_iter_mut(Axis(0)) {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row /= norm;
        }
    }
}

/// Upper bound on the largest eigenvalue of a symmetric positive semi-definite matrix: the
/// smaller of the Gershgorin bound and the Frobenius norm.
pub fn max_eigenvalue_bound<S: Data<Elem = f64>>(m: &ArrayBase<S, Ix2>) -> f64 {
    let gershgorin = m
        .axis_iter(Axis(0))
        .map(|row| row.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0, f64::max);
    let frobenius = m.iter().map(|v| v * v).sum::<f64>().sqrt();
    gershgorin.min(frobenius)
}

/// Largest eigenvalue of a symmetric positive semi-definite matrix by power iteration,
/// padded by 1% and capped at [`max_eigenvalue_bound`].
pub fn max_eigenvalue<S: Data<Elem = f64>>(m: &ArrayBase<S, Ix2>) -> f64 {
    let bound = max_eigenvalue_bound(m);
    let n = m.nrows();
    if n == 0 || bound <= 0.0 || !bound.is_finite() {
        return bound;
    }

    let mut v = Array1::from_elem(n, 1.0 / (n as f64).sqrt());
    let mut lambda = 0.0;
    for _ in 0..POWER_ITER {
        let mv = m.dot(&v);
        let norm = mv.dot(&mv).sqrt();
        if norm <= 0.0 {
            return bound;
        }
        let next = v.dot(&mv);
        v = mv / norm;
        if (next - lambda).abs() <= 1e-6 * next.abs() {
            lambda = next;
            break;
        }
        lambda = next;
    }
    (lambda * 1.01).min(bound)
}

const POWER_ITER: usize = 100;

/// Sum of squares of all entries
pub fn sum_sq<S: Data<Elem = f64>, D: Dimension>(m: &ArrayBase<S, D>) -> f64 {
    m.iter().map(|v| v * v).sum()
}
