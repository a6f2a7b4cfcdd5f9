use crate::metadata::CellMetadata;
use anyhow::{format_err, Error};
use ndarray::ArrayView2;
use sprs::{CsMat, CsMatView};
use std::collections::{HashMap, HashSet};

/// A cells x features matrix with ordered, unique identifiers on both axes.
#[derive(Clone, Debug)]
pub struct GenericCellFeatureMatrix<M> {
    pub name: String,
    pub cell_ids: Vec<String>,
    pub feature_ids: Vec<String>,
    pub metadata: CellMetadata,
    pub matrix: M,
}

/// Sparse expression matrix, always held in CSR (cell-major) layout.
pub type CellFeatureMatrix = GenericCellFeatureMatrix<CsMat<f64>>;

fn check_unique(ids: &[String], axis: &str) -> Result<(), Error> {
    let mut seen = HashSet::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(id.as_str()) {
            return Err(format_err!("duplicate {} id '{}'", axis, id));
        }
    }
    Ok(())
}

impl CellFeatureMatrix {
    /// Wrap `matrix` (cells x features). CSC input is converted to CSR. The values must be finite
    /// and non-negative.
    pub fn new(
        name: impl Into<String>,
        cell_ids: Vec<String>,
        feature_ids: Vec<String>,
        matrix: CsMat<f64>,
    ) -> Result<CellFeatureMatrix, Error> {
        if matrix.rows() != cell_ids.len() || matrix.cols() != feature_ids.len() {
            return Err(format_err!(
                "matrix shape {:?} doesn't match {} cell ids x {} feature ids",
                matrix.shape(),
                cell_ids.len(),
                feature_ids.len()
            ));
        }
        check_unique(&cell_ids, "cell")?;
        check_unique(&feature_ids, "feature")?;

        if let Some(bad) = matrix.data().iter().find(|v| !v.is_finite() || **v < 0.0) {
            return Err(format_err!("matrix values must be finite and non-negative, found {}", bad));
        }

        let matrix = if matrix.is_csr() { matrix } else { matrix.to_csr() };
        let metadata = CellMetadata::new(cell_ids.len());

        Ok(CellFeatureMatrix {
            name: name.into(),
            cell_ids,
            feature_ids,
            metadata,
            matrix,
        })
    }

    /// Build from a dense cells x features array, dropping exact zeros.
    pub fn from_dense(
        name: impl Into<String>,
        cell_ids: Vec<String>,
        feature_ids: Vec<String>,
        dense: ArrayView2<f64>,
    ) -> Result<CellFeatureMatrix, Error> {
        let matrix = CsMat::csr_from_dense(dense, 0.0);
        Self::new(name, cell_ids, feature_ids, matrix)
    }

    /// Replace the pass-through metadata. Its cell count must match.
    pub fn with_metadata(mut self, metadata: CellMetadata) -> Result<CellFeatureMatrix, Error> {
        if metadata.n_cells != self.n_cells() {
            return Err(format_err!(
                "metadata describes {} cells, matrix has {}",
                metadata.n_cells,
                self.n_cells()
            ));
        }
        self.metadata = metadata;
        Ok(self)
    }

    pub fn n_cells(&self) -> usize {
        self.matrix.rows()
    }

    pub fn n_features(&self) -> usize {
        self.matrix.cols()
    }

    pub fn view(&self) -> CsMatView<'_, f64> {
        self.matrix.view()
    }

    /// Column indices of the requested features, in request order. Unknown ids are skipped.
    pub fn feature_indices<S: AsRef<str>>(&self, features: &[S]) -> Vec<usize> {
        let lookup: HashMap<&str, usize> = self
            .feature_ids
            .iter()
            .enumerate()
            .map(|(i, f)| (f.as_str(), i))
            .collect();
        features
            .iter()
            .filter_map(|f| lookup.get(f.as_ref()).copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    #[test]
    fn test_from_dense() {
        let dense = arr2(&[[0.0, 1.0, 2.0], [3.0, 0.0, 0.0]]);
        let m = CellFeatureMatrix::from_dense("t", ids("c", 2), ids("g", 3), dense.view()).unwrap();
        assert_eq!(m.n_cells(), 2);
        assert_eq!(m.n_features(), 3);
        assert_eq!(m.matrix.nnz(), 3);
        assert!(m.matrix.is_csr());
        assert_eq!(m.feature_indices(&["g2", "missing", "g0"]), vec![2, 0]);
    }

    #[test]
    fn test_rejects_bad_input() {
        let dense = arr2(&[[0.0, 1.0], [3.0, 0.0]]);
        assert!(CellFeatureMatrix::from_dense("t", ids("c", 3), ids("g", 2), dense.view()).is_err());
        assert!(CellFeatureMatrix::from_dense("t", vec!["a".into(), "a".into()], ids("g", 2), dense.view()).is_err());

        let negative = arr2(&[[0.0, -1.0], [3.0, 0.0]]);
        assert!(CellFeatureMatrix::from_dense("t", ids("c", 2), ids("g", 2), negative.view()).is_err());
    }

    #[test]
    fn test_metadata_passthrough() {
        let dense = arr2(&[[0.0, 1.0], [3.0, 0.0]]);
        let m = CellFeatureMatrix::from_dense("t", ids("c", 2), ids("g", 2), dense.view()).unwrap();
        let mut md = CellMetadata::new(2);
        md.add_column("sample", vec!["s1".into(), "s2".into()]).unwrap();
        let m = m.with_metadata(md.clone()).unwrap();
        assert_eq!(m.metadata, md);
        assert!(m.with_metadata(CellMetadata::new(5)).is_err());
    }
}
