use super::*;
use crate::config::ReduceConfig;
use crate::error::ArchnetError;
use crate::normalization::{normalize, Normalization};
use approx::assert_abs_diff_eq;
use ndarray::{s, Array2};
use ndarray_linalg::SVD;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Poisson};
use rand_pcg::Pcg64Mcg;
use sprs::{CsMat, TriMat};

fn seeded_rng() -> Pcg64Mcg {
    Pcg64Mcg::seed_from_u64(0)
}

/// rank-`r` matrix plus a little gaussian noise
fn low_rank(m: usize, n: usize, r: usize) -> Array2<f64> {
    let mut rng = seeded_rng();
    let norm = Normal::new(0.0, 1.0).unwrap();
    let a = Array2::from_shape_fn((m, r), |_| norm.sample(&mut rng));
    let b = Array2::from_shape_fn((r, n), |_| norm.sample(&mut rng));
    let noise = Array2::from_shape_fn((m, n), |_| 1e-3 * norm.sample(&mut rng));
    a.dot(&b) + noise
}

fn poisson_counts(m: usize, n: usize) -> CsMat<f64> {
    let mut rng = seeded_rng();
    let mut tri = TriMat::new((m, n));
    for i in 0..m {
        for j in 0..n {
            let lambda = if (i * 3 + j) % 7 < 2 { 6.0 } else { 0.5 };
            let v = Poisson::new(lambda).unwrap().sample(&mut rng);
            if v > 0.0 {
                tri.add_triplet(i, j, v);
            }
        }
    }
    tri.to_csr()
}

fn check_against_exact(a: &Array2<f64>, k: usize) {
    let (_, s_true, _) = a.svd(false, false).unwrap();
    let (u, s, v) = RandSvd::new().run_pca(a, k).unwrap();

    assert_eq!(u.shape(), &[a.nrows(), k]);
    assert_eq!(v.shape(), &[a.ncols(), k]);
    assert_abs_diff_eq!(s, s_true.slice(s![..k]).to_owned(), epsilon = 1e-6 * s_true[0]);

    // A v = U sigma
    let av = a.dot(&v);
    let us = &u * &s;
    assert_abs_diff_eq!(av, us, epsilon = 1e-6 * s_true[0]);
}

#[test]
fn test_rand_svd_tall() {
    check_against_exact(&low_rank(200, 40, 5), 5);
}

#[test]
fn test_rand_svd_wide() {
    check_against_exact(&low_rank(40, 200, 5), 5);
}

#[test]
fn test_rand_svd_sparse_operator() {
    let counts = poisson_counts(60, 30);
    let norm = normalize(counts.view(), Normalization::LogNormalize);
    let dense = norm.to_dense();

    let (_, s_sparse, _) = RandSvd::new().run_pca(&norm, 4).unwrap();
    let (_, s_dense, _) = RandSvd::new().run_pca(&dense, 4).unwrap();
    assert_abs_diff_eq!(s_sparse, s_dense, epsilon = 1e-8);
}

#[test]
fn test_reduce_zero_cells() {
    let mut counts = poisson_counts(50, 20).to_dense();
    counts.row_mut(7).fill(0.0);
    counts.row_mut(31).fill(0.0);
    let counts = CsMat::csr_from_dense(counts.view(), 0.0);

    let cfg = ReduceConfig {
        target_rank: 5,
        ..Default::default()
    };
    let reduced = reduce(counts.view(), &cfg).unwrap();
    assert_eq!(reduced.embedding.shape(), &[50, 5]);
    assert_eq!(reduced.loadings.shape(), &[20, 5]);
    assert_eq!(reduced.n_zero_cells(), 2);
    assert!(reduced.zero_cells[7] && reduced.zero_cells[31]);
    assert!(reduced.embedding.row(7).iter().all(|&v| v == 0.0));
    assert!(reduced.embedding.row(31).iter().all(|&v| v == 0.0));
    assert!(reduced.embedding.row(0).iter().any(|&v| v != 0.0));

    let s = &reduced.singular_values;
    assert!(s.windows(2).into_iter().all(|w| w[0] >= w[1]));
}

#[test]
fn test_reduce_is_deterministic() {
    let counts = poisson_counts(40, 25);
    let cfg = ReduceConfig {
        target_rank: 4,
        seed: 17,
        ..Default::default()
    };
    let a = reduce(counts.view(), &cfg).unwrap();
    let b = reduce(counts.view(), &cfg).unwrap();
    assert_eq!(a.embedding, b.embedding);
}

#[test]
fn test_reduce_rejects_rank() {
    let counts = poisson_counts(10, 8);
    for rank in [1, 9] {
        let cfg = ReduceConfig {
            target_rank: rank,
            ..Default::default()
        };
        match reduce(counts.view(), &cfg) {
            Err(ArchnetError::InvalidConfig { param, range, .. }) => {
                assert_eq!(param, "target_rank");
                assert!(range.contains("[2, 8]"), "{range}");
            }
            other => panic!("expected InvalidConfig, got {:?}", other.map(|r| r.rank())),
        }
    }
}
