//! End-to-end run: reduce, sweep the archetype levels, aggregate, and fuse.

use crate::aggregate::{aggregate, Consensus};
use crate::archetype::{decompose, ArchetypeLevel, Convergence};
use crate::budget::{check_memory, RunBudget};
use crate::config::PipelineConfig;
use crate::dim_red::{reduce, ReducedMatrix};
use crate::error::{ArchnetError, Result};
use crate::network::{fuse, FusedNetwork, LevelEmbedding};
use anyhow::Context;
use archnet_types::{CellFeatureMatrix, CellMetadata};
use log::info;
use rayon::prelude::*;
use sprs::CsMatView;
use std::collections::HashSet;
use std::mem::size_of;

/// Outcome of one level of the sweep
#[derive(Clone, Debug, PartialEq)]
pub struct LevelStatus {
    /// archetype count
    pub k: usize,
    /// how the solver stopped
    pub status: Convergence,
    /// final Frobenius residual
    pub residual: f64,
    /// fraction of the reduced matrix's sum of squares explained
    pub explained_variance: f64,
}

impl From<&ArchetypeLevel> for LevelStatus {
    fn from(level: &ArchetypeLevel) -> Self {
        LevelStatus {
            k: level.k,
            status: level.status,
            residual: level.residual(),
            explained_variance: level.explained_variance(),
        }
    }
}

/// Everything a run produces, keyed by the input cell order
#[derive(Clone, Debug)]
pub struct ArchnetOutput {
    /// cell ids of the input
    pub cell_ids: Vec<String>,
    /// per-cell metadata of the input, unchanged
    pub metadata: CellMetadata,
    /// low-rank embedding of the cells
    pub reduced: ReducedMatrix,
    /// consensus archetypes and memberships
    pub consensus: Consensus,
    /// fused cell-cell network
    pub network: FusedNetwork,
    /// one entry per level, in k order
    pub level_status: Vec<LevelStatus>,
    /// the per-level decompositions, when `keep_levels` is set
    pub levels: Option<Vec<ArchetypeLevel>>,
}

/// Upper bound on the dense working memory of a run, in bytes
pub fn estimate_memory(cells: usize, features: usize, cfg: &PipelineConfig) -> usize {
    let rank = cfg.reduce.target_rank;
    let l = ((rank as f64 * cfg.reduce.l_multiplier).ceil() as usize).min(cells.min(features));
    let svd = (cells + features) * l + features * rank;

    let levels: usize = cfg
        .levels()
        .map(|k| 2 * cells * k + k * rank + k * k)
        .sum();
    let max_k = cfg.k_max;
    let consensus = cells * max_k * 2;
    let network = cells * cfg.network.neighbors_per_level * 2 * (cfg.levels().count() + 1);

    (cells * rank + svd + levels + consensus + network) * size_of::<f64>()
}

/// Number of distinct cells (rows) of `matrix`. Explicitly stored zeros are ignored.
pub fn distinct_cells(matrix: CsMatView<f64>) -> usize {
    let mut seen = HashSet::with_capacity(matrix.rows());
    for row in matrix.outer_iterator() {
        let key: Vec<(usize, u64)> = row
            .iter()
            .filter(|(_, &v)| v != 0.0)
            .map(|(j, &v)| (j, v.to_bits()))
            .collect();
        seen.insert(key);
    }
    seen.len()
}

/// Run the full pipeline on `input` with no external cancellation.
pub fn run(input: &CellFeatureMatrix, cfg: &PipelineConfig) -> Result<ArchnetOutput> {
    let budget = crate::budget::budget(cfg.time_budget).1;
    run_with_budget(input, cfg, &budget)
}

/// Run the full pipeline on `input`, checking `budget` between stages and before each level.
pub fn run_with_budget(input: &CellFeatureMatrix, cfg: &PipelineConfig, budget: &RunBudget) -> Result<ArchnetOutput> {
    let (cells, features) = (input.n_cells(), input.n_features());
    cfg.validate(cells, features)?;
    let distinct = distinct_cells(input.view());
    if cfg.k_max > distinct {
        return Err(ArchnetError::invalid(
            "k_max",
            cfg.k_max,
            format!("[{}, {distinct}] (k_min to number of distinct cells)", cfg.k_min),
        ));
    }
    check_memory(estimate_memory(cells, features, cfg), cfg.memory_budget_bytes)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.threads)
        .build()
        .context("building worker pool")
        .map_err(ArchnetError::Numerical)?;

    info!(
        "running {}: {} cells x {} features, k = {}..={}",
        input.name, cells, features, cfg.k_min, cfg.k_max
    );

    pool.install(|| -> Result<ArchnetOutput> {
        budget.check("reduce")?;
        let reduced = reduce(input.view(), &cfg.reduce)?;

        let ks = cfg.levels();
        budget.start_levels(ks.clone().count());
        let levels = ks
            .into_par_iter()
            .map(|k| -> Result<ArchetypeLevel> {
                budget.check("archetype level")?;
                let level = decompose(&reduced.embedding.view(), k, &cfg.solver)?;
                budget.level_done();
                info!(
                    "k = {} done: residual {:.4e}, explained variance {:.4}",
                    k,
                    level.residual(),
                    level.explained_variance()
                );
                Ok(level)
            })
            .collect::<Result<Vec<_>>>()?;

        budget.check("aggregate")?;
        let consensus = aggregate(&levels, cfg.merge_threshold, cfg.min_level_support)?;

        budget.check("fuse")?;
        let embeddings: Vec<LevelEmbedding> = levels.iter().map(LevelEmbedding::from).collect();
        let network = fuse(&embeddings, Some(&reduced.zero_cells[..]), &cfg.network)?;

        let level_status = levels.iter().map(LevelStatus::from).collect();
        info!(
            "finished in {:.2}s: {} consensus archetypes, {} edges",
            budget.elapsed().as_secs_f64(),
            consensus.len(),
            network.n_edges()
        );

        Ok(ArchnetOutput {
            cell_ids: input.cell_ids.clone(),
            metadata: input.metadata.clone(),
            reduced,
            consensus,
            network,
            level_status,
            levels: cfg.keep_levels.then_some(levels),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::budget;

    #[test]
    fn test_memory_estimate_grows_with_levels() {
        let small = PipelineConfig {
            k_max: 5,
            ..Default::default()
        };
        let large = PipelineConfig::default();
        assert!(estimate_memory(1000, 2000, &small) < estimate_memory(1000, 2000, &large));
        assert!(estimate_memory(1000, 2000, &large) > 1000 * 30 * 8);
    }

    fn duplicated_cells() -> CellFeatureMatrix {
        // 3 distinct cells, each repeated 4 times
        let dense = ndarray::Array2::from_shape_fn((12, 6), |(i, j)| ((i % 3) * 2 + j % 2 + (j == i % 3) as usize) as f64);
        let ids = |p: &str, n: usize| (0..n).map(|i| format!("{p}{i}")).collect::<Vec<_>>();
        CellFeatureMatrix::from_dense("dup", ids("c", 12), ids("g", 6), dense.view()).unwrap()
    }

    #[test]
    fn test_distinct_cells() {
        let input = duplicated_cells();
        assert_eq!(distinct_cells(input.view()), 3);

        let dense = ndarray::arr2(&[[1.0, 0.0], [1.0, 0.0], [0.0, 0.0], [0.0, 0.0], [0.0, 2.0]]);
        let ids = |p: &str, n: usize| (0..n).map(|i| format!("{p}{i}")).collect::<Vec<_>>();
        let input = CellFeatureMatrix::from_dense("t", ids("c", 5), ids("g", 2), dense.view()).unwrap();
        assert_eq!(distinct_cells(input.view()), 3);
    }

    #[test]
    fn test_too_few_distinct_cells_fails_before_any_level() {
        let input = duplicated_cells();
        let cfg = PipelineConfig {
            reduce: crate::config::ReduceConfig {
                target_rank: 3,
                ..Default::default()
            },
            k_max: 4,
            ..Default::default()
        };
        let (state, run_budget) = budget(None);
        match run_with_budget(&input, &cfg, &run_budget) {
            Err(ArchnetError::InvalidConfig { param, range, .. }) => {
                assert_eq!(param, "k_max");
                assert!(range.contains("distinct"), "{range}");
            }
            other => panic!("expected InvalidConfig, got {:?}", other.map(|o| o.consensus.len())),
        }
        // no level was started
        assert_eq!(state.levels_done(), 0);
        assert_eq!(state.progress(), 0.0);

        let cfg = PipelineConfig { k_max: 3, ..cfg };
        assert!(cfg.validate(12, 6).is_ok());
        assert!(run(&input, &cfg).is_ok());
    }

    #[test]
    fn test_budget_errors_stop_the_run() {
        let dense = ndarray::Array2::from_shape_fn((12, 6), |(i, j)| ((i * 7 + j * 3) % 5) as f64);
        let ids = |p: &str, n: usize| (0..n).map(|i| format!("{p}{i}")).collect::<Vec<_>>();
        let input = CellFeatureMatrix::from_dense("t", ids("c", 12), ids("g", 6), dense.view()).unwrap();
        let cfg = PipelineConfig {
            reduce: crate::config::ReduceConfig {
                target_rank: 3,
                ..Default::default()
            },
            k_max: 3,
            ..Default::default()
        };

        let limited = PipelineConfig {
            memory_budget_bytes: Some(16),
            ..cfg.clone()
        };
        assert!(matches!(
            run(&input, &limited),
            Err(ArchnetError::ResourceExhausted { resource: "memory", .. })
        ));

        let (state, run_budget) = budget(None);
        state.cancel();
        assert!(matches!(
            run_with_budget(&input, &cfg, &run_budget),
            Err(ArchnetError::Cancelled)
        ));
    }
}
