use crate::dim_red::DataMat;
use crate::stats::median_mut;
use anyhow::{bail, Error};
use ndarray::linalg::Dot;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix2};
use noisy_float::types::{n64, N64};
use sprs::{CsMat, CsMatView, TriMat};
use std::str::FromStr;

/// Normalization scheme for a cells x features count matrix
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Normalization {
    /// Cell totals are scaled to the median cell total and `x -> ln(1 + x)` is applied.
    /// Each feature is then centered and scaled to unit variance.
    LogNormalize,
    /// Like `LogNormalize`, minus the per-feature centering and scaling
    LogNormalizeUncentered,
    /// Use the values as given
    None,
}

impl FromStr for Normalization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lognorm" => Ok(Normalization::LogNormalize),
            "lognorm_uncentered" => Ok(Normalization::LogNormalizeUncentered),
            "none" => Ok(Normalization::None),
            _ => bail!("Normalization not recognized: {}", s),
        }
    }
}

/// A normalized matrix `A = (S - 1 * offset^T) * diag(scale)` where `S` is sparse.
/// The centering term is a rank-1 offset, so products with `A` never densify `S`.
pub struct NormalizedCounts {
    values: CsMat<f64>,
    offset: Option<Array1<f64>>,
    scale: Option<Array1<f64>>,
}

impl NormalizedCounts {
    /// Wrap a CSR matrix with an optional per-feature offset and scale.
    pub fn new(values: CsMat<f64>, offset: Option<Array1<f64>>, scale: Option<Array1<f64>>) -> NormalizedCounts {
        let values = if values.is_csr() { values } else { values.to_csr() };
        if let Some(o) = &offset {
            assert_eq!(o.len(), values.cols());
        }
        if let Some(s) = &scale {
            assert_eq!(s.len(), values.cols());
        }
        NormalizedCounts { values, offset, scale }
    }

    /// number of rows (cells)
    pub fn rows(&self) -> usize {
        self.values.rows()
    }

    /// number of columns (features)
    pub fn cols(&self) -> usize {
        self.values.cols()
    }

    /// The sparse part `S`
    pub fn inner_sparse(&self) -> &CsMat<f64> {
        &self.values
    }

    /// Convert to a dense matrix
    pub fn to_dense(&self) -> Array2<f64> {
        self.dot(&Array2::<f64>::eye(self.cols()))
    }
}

impl DataMat for NormalizedCounts {
    fn shape(&self) -> [usize; 2] {
        [self.rows(), self.cols()]
    }
}

impl<DS> Dot<ArrayBase<DS, Ix2>> for NormalizedCounts
where
    DS: Data<Elem = f64>,
{
    type Output = Array2<f64>;

    fn dot(&self, rhs: &ArrayBase<DS, Ix2>) -> Array2<f64> {
        assert_eq!(self.cols(), rhs.shape()[0]);
        let rhs = match &self.scale {
            Some(scale) => rhs * &scale.view().insert_axis(Axis(1)),
            None => rhs.to_owned(),
        };
        let rhs = rhs.as_standard_layout();

        let mut res: Array2<f64> = &self.values * &rhs;
        if let Some(offset) = &self.offset {
            let shift = offset.dot(&rhs);
            res -= &shift.insert_axis(Axis(0));
        }
        res
    }
}

impl<DS> Dot<NormalizedCounts> for ArrayBase<DS, Ix2>
where
    DS: Data<Elem = f64>,
{
    type Output = Array2<f64>;

    fn dot(&self, rhs: &NormalizedCounts) -> Array2<f64> {
        assert_eq!(self.shape()[1], rhs.rows());
        let lhs_t = self.t();
        let lhs_t = lhs_t.as_standard_layout();
        let values_t = rhs.values.transpose_view();

        let res: Array2<f64> = &values_t * &lhs_t;
        let mut res = res.reversed_axes();

        if let Some(offset) = &rhs.offset {
            let row_sums = self.sum_axis(Axis(1));
            for (mut row, &s) in res.axis_iter_mut(Axis(0)).zip(row_sums.iter()) {
                row.scaled_add(-s, offset);
            }
        }
        if let Some(scale) = &rhs.scale {
            res *= &scale.view().insert_axis(Axis(0));
        }
        res
    }
}

/// Normalize a cells x features matrix according to `norm`
pub fn normalize(matrix: CsMatView<f64>, norm: Normalization) -> NormalizedCounts {
    match norm {
        Normalization::None => NormalizedCounts::new(matrix.to_owned(), None, None),
        Normalization::LogNormalizeUncentered => NormalizedCounts::new(log_normalize(matrix, None), None, None),
        Normalization::LogNormalize => {
            let values = log_normalize(matrix, None);
            let (mean, scale) = feature_moments(&values);
            NormalizedCounts::new(values, Some(mean), Some(scale))
        }
    }
}

/// Log-normalize a cells x features matrix:
/// 1. Scale each row (cell) to the total given by `target_total`. If `target_total` is
///    `None`, use the median of the non-zero cell totals
/// 2. Apply the transform `x -> ln(1 + x)`
///
/// Cells with a zero total stay all-zero.
pub fn log_normalize(matrix: CsMatView<f64>, target_total: Option<f64>) -> CsMat<f64> {
    let csr;
    let matrix = if matrix.is_csr() {
        matrix
    } else {
        csr = matrix.to_csr();
        csr.view()
    };

    let totals: Vec<f64> = matrix.outer_iterator().map(|row| row.data().iter().sum()).collect();
    let target = match target_total {
        Some(t) => t,
        None => {
            let mut nonzero: Vec<N64> = totals.iter().filter(|&&t| t > 0.0).map(|&t| n64(t)).collect();
            median_mut(&mut nonzero).map_or(1.0, |m| m.raw())
        }
    };

    let mut tri = TriMat::with_capacity((matrix.rows(), matrix.cols()), matrix.nnz());
    for (i, row) in matrix.outer_iterator().enumerate() {
        let total = totals[i];
        if total <= 0.0 {
            continue;
        }
        let f = target / total;
        for (j, &v) in row.iter() {
            let y = (v * f).ln_1p();
            if y != 0.0 {
                tri.add_triplet(i, j, y);
            }
        }
    }
    tri.to_csr()
}

/// Per-feature mean and inverse standard deviation. Constant features get a scale of zero.
fn feature_moments(values: &CsMat<f64>) -> (Array1<f64>, Array1<f64>) {
    let n = values.rows().max(1) as f64;
    let mut sum = Array1::<f64>::zeros(values.cols());
    let mut sum_sq = Array1::<f64>::zeros(values.cols());
    for row in values.outer_iterator() {
        for (j, &v) in row.iter() {
            sum[j] += v;
            sum_sq[j] += v * v;
        }
    }
    let mean = sum / n;
    let scale = Array1::from_shape_fn(values.cols(), |j| {
        let var = sum_sq[j] / n - mean[j] * mean[j];
        if var > 1e-12 {
            1.0 / var.sqrt()
        } else {
            0.0
        }
    });
    (mean, scale)
}
