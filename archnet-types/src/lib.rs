//! Input containers shared by the archnet crates: the cell-by-feature expression matrix and
//! the per-cell metadata that rides along with it.

pub mod matrix;
pub mod metadata;

pub use matrix::{CellFeatureMatrix, GenericCellFeatureMatrix};
pub use metadata::CellMetadata;
