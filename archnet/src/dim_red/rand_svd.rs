#![allow(non_snake_case)]

use super::{DataMat, Pca, PcaResult};
use anyhow::{format_err, Error};
use ndarray::linalg::Dot;
use ndarray::{s, Array2, ArrayView2};
use ndarray_linalg::svddc::JobSvd;
use ndarray_linalg::{SVDDCInto, QR};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

/// Settings for Randomized PCA
pub struct RandSvd {
    /// Multiple of the requested k to use in randomized projections
    pub l_multiplier: f64,

    /// Number of power iteration to perform
    pub n_iter: usize,

    /// Seed of the random projection
    pub seed: u64,
}

impl RandSvd {
    /// Create a new RandSvd with default settings.
    pub fn new() -> RandSvd {
        RandSvd {
            l_multiplier: 10.0,
            n_iter: 2,
            seed: 0,
        }
    }
}

impl Default for RandSvd {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Pca<T, f64> for RandSvd
where
    T: DataMat + for<'a> Dot<ArrayView2<'a, f64>, Output = Array2<f64>> + Dot<Array2<f64>, Output = Array2<f64>>,
    for<'a> ArrayView2<'a, f64>: Dot<T, Output = Array2<f64>>,
    Array2<f64>: Dot<T, Output = Array2<f64>>,
    Array2<f64>: Dot<Array2<f64>, Output = Array2<f64>>,
{
    fn run_pca(&self, array: &T, k: usize) -> Result<PcaResult, Error> {
        let [m, n] = array.shape();
        let l = std::cmp::max(k + 4, ((k as f64) * self.l_multiplier) as usize);
        let l = l.min(m.min(n));
        let (u, s, vt) = svd_rand(array, k, l, self.n_iter, self.seed)?;
        Ok((u, s, vt.reversed_axes()))
    }
}

/// Perform an SVD of matrix `A`, making a rank `k` approximation. Use `l` projection dimensions and `n_iter` power iterations.
#[inline(never)]
pub fn svd_rand<T>(
    A: &T,
    k: usize, // svd rank
    l: usize,
    n_iter: usize, // power iterations
    seed: u64,
) -> Result<PcaResult, Error>
where
    T: DataMat + for<'a> Dot<ArrayView2<'a, f64>, Output = Array2<f64>> + Dot<Array2<f64>, Output = Array2<f64>>,
    for<'a> ArrayView2<'a, f64>: Dot<T, Output = Array2<f64>>,
    Array2<f64>: Dot<T, Output = Array2<f64>>,
    Array2<f64>: Dot<Array2<f64>, Output = Array2<f64>>,
{
    let m = A.shape()[0];
    let n = A.shape()[1];

    if m < 2 || n < 2 {
        return Err(format_err!("The input matrix must be at least 2x2."));
    }

    if k > std::cmp::min(m, n) || k > l {
        return Err(format_err!("invalid k = {} for a {} x {} matrix with l = {}", k, m, n, l));
    }

    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let unif = Uniform::new(-1.0, 1.0);

    if m >= n {
        let omega = Array2::random_using((n, l), unif, &mut rng);
        let mut Q: Array2<f64> = A.dot(&omega).qr()?.0;

        for _ in 0..n_iter {
            Q = Q.t().dot(A).reversed_axes().qr()?.0;
            Q = A.dot(&Q).qr()?.0;
        }

        let B = Q.t().dot(A);
        let (U, sigma, Va) = truncated_svd(B, k)?;
        let U = Q.dot(&U);
        Ok((U, sigma, Va))
    } else {
        // n > m
        let omega = Array2::random_using((l, m), unif, &mut rng);
        let mut Q = omega.dot(A).reversed_axes().qr()?.0;

        for _ in 0..n_iter {
            Q = A.dot(&Q).qr()?.0;
            Q = Q.t().dot(A).reversed_axes().qr()?.0;
        }

        let B = A.dot(&Q);
        let (U, sigma, Va) = truncated_svd(B, k)?;
        let Va = Va.dot(&Q.t());
        Ok((U, sigma, Va))
    }
}

fn truncated_svd(B: Array2<f64>, k: usize) -> Result<PcaResult, Error> {
    let (U, sigma, Vt) = B.svddc_into(JobSvd::Some)?;
    let U = U.ok_or_else(|| format_err!("SVD returned no left singular vectors"))?;
    let Vt = Vt.ok_or_else(|| format_err!("SVD returned no right singular vectors"))?;
    Ok((
        U.slice(s![.., ..k]).to_owned(),
        sigma.slice(s![..k]).to_owned(),
        Vt.slice(s![..k, ..]).to_owned(),
    ))
}
