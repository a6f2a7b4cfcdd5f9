//! Projection onto the probability simplex and the simplex-constrained least squares solve
//! used by both halves of the archetypal decomposition.

use ndarray::{Array1, ArrayBase, ArrayView1, ArrayView2, DataMut, Ix1};
use std::cmp::Ordering;

/// Replace `v` by its Euclidean projection onto `{x : x >= 0, sum(x) = 1}`.
/// Non-finite input is replaced by the uniform vector.
pub fn project_simplex<S: DataMut<Elem = f64>>(v: &mut ArrayBase<S, Ix1>) {
    let n = v.len();
    if n == 0 {
        return;
    }
    if v.iter().any(|x| !x.is_finite()) {
        v.fill(1.0 / n as f64);
        return;
    }

    let mut u: Vec<f64> = v.to_vec();
    u.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));

    let mut cumsum = 0.0;
    let mut theta = 0.0;
    for (j, &uj) in u.iter().enumerate() {
        cumsum += uj;
        let t = (cumsum - 1.0) / (j + 1) as f64;
        if uj - t > 0.0 {
            theta = t;
        }
    }
    v.mapv_inplace(|x| (x - theta).max(0.0));

    let total = v.sum();
    if total > 0.0 {
        *v /= total;
    } else {
        v.fill(1.0 / n as f64);
    }
}

/// Solve `min_h 1/2 |x - h Z|^2` over the simplex by accelerated projected gradient descent,
/// starting from `h`. The problem is given through its Gram matrix `gram = Z Z^T` and
/// `zx = Z x`. `lipschitz` must bound the largest eigenvalue of `gram`.
///
/// The momentum is reset whenever a step would raise the objective, so the objective never
/// increases.
pub fn simplex_lsq(gram: &ArrayView2<f64>, zx: &ArrayView1<f64>, h: &mut Array1<f64>, lipschitz: f64, n_iter: usize) {
    if lipschitz <= 0.0 || !lipschitz.is_finite() {
        return;
    }
    let step = 1.0 / lipschitz;
    let objective = |v: &Array1<f64>| 0.5 * v.dot(&gram.dot(v)) - v.dot(zx);

    let mut f = objective(&*h);
    let mut y = h.clone();
    let mut t: f64 = 1.0;
    for _ in 0..n_iter {
        let grad = gram.dot(&y) - zx;
        let mut next = &y - &(grad * step);
        project_simplex(&mut next);

        let f_next = objective(&next);
        if f_next > f {
            if t > 1.0 {
                y.assign(&*h);
                t = 1.0;
                continue;
            }
            break;
        }

        let change = next
            .iter()
            .zip(h.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        let t_next = (1.0 + (1.0 + 4.0 * t * t).sqrt()) / 2.0;
        y = &next + &((&next - &*h) * ((t - 1.0) / t_next));
        *h = next;
        f = f_next;
        t = t_next;
        if change < 1e-12 {
            break;
        }
    }
}

/// `true` if `v` is non-negative and sums to one within `tol`
pub fn on_simplex(v: &ArrayView1<f64>, tol: f64) -> bool {
    v.iter().all(|&x| x >= 0.0) && (v.sum() - 1.0).abs() <= tol
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    #[test]
    fn test_projection() {
        let mut v = array![0.2, 0.3, 0.5];
        project_simplex(&mut v);
        assert_abs_diff_eq!(v, array![0.2, 0.3, 0.5], epsilon = 1e-12);

        let mut v = array![2.0, 0.0, -1.0];
        project_simplex(&mut v);
        assert_abs_diff_eq!(v, array![1.0, 0.0, 0.0], epsilon = 1e-12);

        let mut v = array![1.0, 1.0];
        project_simplex(&mut v);
        assert_abs_diff_eq!(v, array![0.5, 0.5], epsilon = 1e-12);

        let mut v = array![f64::NAN, 1.0, 0.0, 0.0];
        project_simplex(&mut v);
        assert_eq!(v, array![0.25, 0.25, 0.25, 0.25]);
    }

    #[test]
    fn test_projection_is_closest_point() {
        let mut v = array![0.9, 0.6, -0.2, 0.1];
        let orig = v.clone();
        project_simplex(&mut v);
        assert!(on_simplex(&v.view(), 1e-12));

        // any other simplex point is at least as far away
        let candidates = [array![0.6, 0.4, 0.0, 0.0], array![0.5, 0.3, 0.0, 0.2], Array1::from_elem(4, 0.25)];
        let d = |p: &Array1<f64>| (&orig - p).mapv(|x| x * x).sum();
        for c in &candidates {
            assert!(d(&v) <= d(c) + 1e-12);
        }
    }

    #[test]
    fn test_simplex_lsq_recovers_mixture() {
        let z = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let truth = array![0.2, 0.5, 0.3];
        let x = truth.dot(&z);

        let gram: Array2<f64> = z.dot(&z.t());
        let zx = z.dot(&x);
        let mut h = Array1::from_elem(3, 1.0 / 3.0);
        simplex_lsq(&gram.view(), &zx.view(), &mut h, 4.0, 500);

        assert!(on_simplex(&h.view(), 1e-9));
        assert_abs_diff_eq!(h.dot(&z), x, epsilon = 1e-6);
    }

    #[test]
    fn test_simplex_lsq_never_increases_objective() {
        let z = array![[3.0, 0.0, 1.0], [0.0, 1.0, 0.0], [1.0, 1.0, 1.0], [0.2, 0.1, 4.0]];
        let x = array![2.0, 0.5, 1.5];
        let gram: Array2<f64> = z.dot(&z.t());
        let zx = z.dot(&x);
        let objective = |h: &Array1<f64>| 0.5 * h.dot(&gram.dot(h)) - h.dot(&zx);

        let mut h = Array1::from_elem(4, 0.25);
        let mut prev = objective(&h);
        for _ in 0..30 {
            simplex_lsq(&gram.view(), &zx.view(), &mut h, crate::stats::max_eigenvalue(&gram), 1);
            let cur = objective(&h);
            assert!(cur <= prev + 1e-12);
            assert!(on_simplex(&h.view(), 1e-9));
            prev = cur;
        }
    }
}
