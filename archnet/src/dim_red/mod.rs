#![allow(non_snake_case)]

//! Notes on generic matrix algos
//! The SVD is written generically over the data matrix type, so the same code runs on dense
//! arrays, plain sparse matrices, or structured operators such as a sparse matrix with an
//! implicit per-feature centering ([`crate::normalization::NormalizedCounts`]). A data matrix
//! only needs to multiply a dense matrix on the right (`A * b`) and to be multiplied by one on
//! the left (`b * A`). Both are expressed as `ndarray::linalg::Dot` impls and listed directly
//! on the algorithm, since collapsing them into `trait DataMat` super-traits leaves only one
//! `dot` method visible and loses the overloading over `Array2` and `ArrayView2`.

use crate::config::ReduceConfig;
use crate::error::{ArchnetError, Result};
use crate::normalization::normalize;
use anyhow::Error;
use log::{info, warn};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use sprs::{CsMatBase, CsMatView, SpIndex};
use std::ops::Deref;

/// Randomized SVD method
pub mod rand_svd;

#[cfg(test)]
pub(crate) mod test;

pub use rand_svd::RandSvd;

pub(crate) type PcaResult = (Array2<f64>, Array1<f64>, Array2<f64>);

/// Trait for getting the dimensions of a matrix
pub trait DataMat {
    /// Get the shape of the matrix
    fn shape(&self) -> [usize; 2];
}

impl DataMat for ArrayView2<'_, f64> {
    fn shape(&self) -> [usize; 2] {
        [self.shape()[0], self.shape()[1]]
    }
}

impl DataMat for Array2<f64> {
    fn shape(&self) -> [usize; 2] {
        [self.shape()[0], self.shape()[1]]
    }
}

impl<N, I, IptrStorage, IndStorage, DataStorage> DataMat for CsMatBase<N, I, IptrStorage, IndStorage, DataStorage>
where
    I: SpIndex,
    IptrStorage: Deref<Target = [I]>,
    IndStorage: Deref<Target = [I]>,
    DataStorage: Deref<Target = [N]>,
{
    fn shape(&self) -> [usize; 2] {
        [self.rows(), self.cols()]
    }
}

/// Perform a SVD of a `matrix`, retaining `k` singular vectors.
/// This trait always performs the pure SVD of the matrix. Special cases of SVD
/// such as PCA can be achieved by the appropriate shifts and scaling of `matrix`
pub trait Pca<T, N> {
    /// Compute a rank `k` decomposition `(U, sigma, V)` of `matrix`, with `V` stored
    /// column-wise (features x k)
    fn run_pca(&self, matrix: &T, k: usize) -> Result<PcaResult, Error>;
}

/// Dense low-rank embedding of the cells
#[derive(Clone, Debug)]
pub struct ReducedMatrix {
    /// cells x r coordinates, `U * diag(sigma)`
    pub embedding: Array2<f64>,
    /// The r leading singular values, descending
    pub singular_values: Array1<f64>,
    /// features x r right singular vectors
    pub loadings: Array2<f64>,
    /// Cells whose input row was entirely zero. Their embedding row is exactly zero.
    pub zero_cells: Vec<bool>,
}

impl ReducedMatrix {
    /// Number of cells
    pub fn n_cells(&self) -> usize {
        self.embedding.nrows()
    }

    /// Rank of the embedding
    pub fn rank(&self) -> usize {
        self.embedding.ncols()
    }

    /// Number of cells with an all-zero input row
    pub fn n_zero_cells(&self) -> usize {
        self.zero_cells.iter().filter(|&&z| z).count()
    }
}

/// Normalize `matrix` (cells x features, non-negative) and project it onto its
/// `cfg.target_rank` leading singular directions.
pub fn reduce(matrix: CsMatView<f64>, cfg: &ReduceConfig) -> Result<ReducedMatrix> {
    let (cells, features) = (matrix.rows(), matrix.cols());
    let max_rank = cells.min(features);
    if cfg.target_rank < 2 || cfg.target_rank > max_rank {
        return Err(ArchnetError::invalid(
            "target_rank",
            cfg.target_rank,
            format!("[2, {max_rank}] (min of cells and features)"),
        ));
    }

    let mut zero_cells = vec![true; cells];
    for (&v, (i, _)) in matrix.iter() {
        if v != 0.0 {
            zero_cells[i] = false;
        }
    }
    let n_zero = zero_cells.iter().filter(|&&z| z).count();
    if n_zero > 0 {
        warn!("{} of {} cells have no counts and get a zero embedding", n_zero, cells);
    }

    let normalized = normalize(matrix, cfg.normalization);
    let svd = RandSvd {
        l_multiplier: cfg.l_multiplier,
        n_iter: cfg.n_iter,
        seed: cfg.seed,
    };
    let (mut u, sigma, mut v) = svd.run_pca(&normalized, cfg.target_rank)?;
    fix_signs(&mut u, &mut v);

    let mut embedding = &u * &sigma.view().insert_axis(Axis(0));
    for (i, &zero) in zero_cells.iter().enumerate() {
        if zero {
            embedding.row_mut(i).fill(0.0);
        }
    }

    info!(
        "reduced {} x {} matrix to rank {}, leading singular value {:.4}",
        cells,
        features,
        cfg.target_rank,
        sigma.get(0).copied().unwrap_or(0.0)
    );

    Ok(ReducedMatrix {
        embedding,
        singular_values: sigma,
        loadings: v,
        zero_cells,
    })
}

/// Flip each singular pair so the largest-magnitude loading is positive.
fn fix_signs(u: &mut Array2<f64>, v: &mut Array2<f64>) {
    for j in 0..v.ncols() {
        let mut pivot = 0.0f64;
        for &x in v.column(j) {
            if x.abs() > pivot.abs() {
                pivot = x;
            }
        }
        if pivot < 0.0 {
            v.column_mut(j).mapv_inplace(|x| -x);
            u.column_mut(j).mapv_inplace(|x| -x);
        }
    }
}
