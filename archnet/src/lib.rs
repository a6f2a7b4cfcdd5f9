//! # archnet: multi-resolution archetypal analysis and network fusion for single cell data
//!
//! A run reduces the cell-by-feature matrix to a dense low-rank embedding, fits archetypal
//! decompositions at every archetype count in a range, merges the archetypes of all levels
//! into a consensus set, and fuses the per-level cell neighborhoods into one weighted
//! cell-cell network. See [`pipeline::run`].

#![warn(missing_docs)]

#[allow(unused_extern_crates)]
extern crate blas_src;

/// Consensus archetypes across levels
pub mod aggregate;

/// Archetypal analysis of a single level
pub mod archetype;

/// Cancellation, progress and resource limits
pub mod budget;

/// Pipeline configuration
pub mod config;

/// Dimensionality reduction methods
pub mod dim_red;

/// Error types
pub mod error;

/// Fused cell-cell networks
pub mod network;

/// Nearest-neighbor search
pub mod nn;

/// Count matrix normalization methods
pub mod normalization;

/// End-to-end pipeline
pub mod pipeline;

/// Least squares on the probability simplex
pub mod simplex;

/// Network diffusion and imputation
pub mod smooth;

/// Small numerical helpers
pub mod stats;

pub use archnet_types::{CellFeatureMatrix, CellMetadata};
pub use config::{FuseConfig, PipelineConfig, ReduceConfig, SolverConfig};
pub use error::{ArchnetError, Result};
pub use pipeline::{run, run_with_budget, ArchnetOutput, LevelStatus};
