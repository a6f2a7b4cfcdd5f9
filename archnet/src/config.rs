//! Pipeline configuration. Each stage has its own settings struct with sensible defaults,
//! and [`PipelineConfig::validate`] checks everything against the input shape before any
//! work starts.

use crate::error::{ArchnetError, Result};
use crate::network::{FusionRule, Similarity};
use crate::normalization::Normalization;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Settings for the Reducer
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct ReduceConfig {
    /// Rank of the reduced embedding
    pub target_rank: usize,
    /// Count normalization applied before the factorization
    pub normalization: Normalization,
    /// Seed of the randomized range finder
    pub seed: u64,
    /// Multiple of the target rank used for the random projection
    pub l_multiplier: f64,
    /// Number of power iterations
    pub n_iter: usize,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        ReduceConfig {
            target_rank: 30,
            normalization: Normalization::LogNormalize,
            seed: 0,
            l_multiplier: 10.0,
            n_iter: 2,
        }
    }
}

/// Settings for the archetypal solver
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct SolverConfig {
    /// Maximum number of alternating iterations
    pub max_iter: usize,
    /// Stop once the relative residual improvement of an iteration drops below this
    pub tolerance: f64,
    /// Accelerated projected-gradient steps per subproblem per iteration
    pub inner_iter: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            max_iter: 100,
            tolerance: 1e-6,
            inner_iter: 20,
        }
    }
}

impl SolverConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(ArchnetError::invalid("max_iter", self.max_iter, "[1, inf)"));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(ArchnetError::invalid("tolerance", self.tolerance, "(0, inf)"));
        }
        if self.inner_iter == 0 {
            return Err(ArchnetError::invalid("inner_iter", self.inner_iter, "[1, inf)"));
        }
        Ok(())
    }
}

/// Settings for the network fuser
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct FuseConfig {
    /// Nearest neighbors per cell in each level's graph
    pub neighbors_per_level: usize,
    /// How a level embeds cells and weights their edges
    pub similarity: Similarity,
    /// How per-level edge weights combine into the fused network
    pub fusion: FusionRule,
}

impl Default for FuseConfig {
    fn default() -> Self {
        FuseConfig {
            neighbors_per_level: 15,
            similarity: Similarity::MembershipCosine,
            fusion: FusionRule::Consistent,
        }
    }
}

impl FuseConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.neighbors_per_level == 0 {
            return Err(ArchnetError::invalid(
                "neighbors_per_level",
                self.neighbors_per_level,
                "[1, inf)",
            ));
        }
        Ok(())
    }
}

/// Full pipeline configuration
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct PipelineConfig {
    /// Reducer settings
    pub reduce: ReduceConfig,
    /// Smallest archetype count in the resolution sweep
    pub k_min: usize,
    /// Largest archetype count in the resolution sweep
    pub k_max: usize,
    /// Archetypal solver settings
    pub solver: SolverConfig,
    /// Archetypes correlated above this are merged into one consensus archetype
    pub merge_threshold: f64,
    /// Consensus archetypes must be found in at least this many levels
    pub min_level_support: usize,
    /// Network fuser settings
    pub network: FuseConfig,
    /// Worker threads for the pipeline's pool. 0 lets rayon decide.
    pub threads: usize,
    /// Wall-clock budget, checked between stages and levels
    pub time_budget: Option<Duration>,
    /// Upper bound on the dense working memory of a run, in bytes
    pub memory_budget_bytes: Option<usize>,
    /// Return the per-level decompositions along with the consensus
    pub keep_levels: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            reduce: ReduceConfig::default(),
            k_min: 2,
            k_max: 30,
            solver: SolverConfig::default(),
            merge_threshold: 0.85,
            min_level_support: 2,
            network: FuseConfig::default(),
            threads: 0,
            time_budget: None,
            memory_budget_bytes: None,
            keep_levels: false,
        }
    }
}

impl PipelineConfig {
    /// Check every parameter against a `cells` x `features` input.
    pub fn validate(&self, cells: usize, features: usize) -> Result<()> {
        let max_rank = cells.min(features);
        if self.reduce.target_rank < 2 || self.reduce.target_rank > max_rank {
            return Err(ArchnetError::invalid(
                "target_rank",
                self.reduce.target_rank,
                format!("[2, {max_rank}] (min of cells and features)"),
            ));
        }
        if !(self.reduce.l_multiplier.is_finite() && self.reduce.l_multiplier >= 1.0) {
            return Err(ArchnetError::invalid("l_multiplier", self.reduce.l_multiplier, "[1, inf)"));
        }
        if self.k_min < 2 || self.k_min > cells {
            return Err(ArchnetError::invalid(
                "k_min",
                self.k_min,
                format!("[2, {cells}] (number of cells)"),
            ));
        }
        if self.k_max < self.k_min || self.k_max > cells {
            return Err(ArchnetError::invalid(
                "k_max",
                self.k_max,
                format!("[{}, {cells}] (k_min to number of cells)", self.k_min),
            ));
        }
        if !(self.merge_threshold > 0.0 && self.merge_threshold <= 1.0) {
            return Err(ArchnetError::invalid("merge_threshold", self.merge_threshold, "(0, 1]"));
        }
        if self.min_level_support == 0 {
            return Err(ArchnetError::invalid("min_level_support", self.min_level_support, "[1, inf)"));
        }
        self.solver.validate()?;
        self.network.validate()?;
        Ok(())
    }

    /// The archetype counts swept by the pipeline
    pub fn levels(&self) -> std::ops::RangeInclusive<usize> {
        self.k_min..=self.k_max
    }
}
