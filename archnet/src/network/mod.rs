//! Cell-cell networks: one kNN graph per archetype level, fused into a single symmetric
//! weighted network.

use crate::aggregate::Consensus;
use crate::archetype::ArchetypeLevel;
use crate::config::FuseConfig;
use crate::error::{ArchnetError, Result};
use crate::nn::{knn, NO_NEIGHBOR};
use log::info;
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use sprs::{CsMat, TriMat};
use std::collections::{BTreeMap, BTreeSet};

/// Per-level edge fusion rules
pub mod fusion;

/// Per-level embeddings and edge weights
pub mod similarity;

pub use fusion::{fuzzy_union, Fuse, FusionRule};
pub use similarity::{EdgeWeighting, KernelScale, Similarity};

/// The parts of an archetype level a network is built from
#[derive(Clone, Copy, Debug)]
pub struct LevelEmbedding<'a> {
    /// archetype count
    pub k: usize,
    /// cells x k membership
    pub membership: ArrayView2<'a, f64>,
    /// k x r archetype profiles
    pub archetypes: ArrayView2<'a, f64>,
}

impl<'a> From<&'a ArchetypeLevel> for LevelEmbedding<'a> {
    fn from(level: &'a ArchetypeLevel) -> Self {
        LevelEmbedding {
            k: level.k,
            membership: level.membership.view(),
            archetypes: level.archetypes.view(),
        }
    }
}

impl<'a> From<&'a Consensus> for LevelEmbedding<'a> {
    fn from(consensus: &'a Consensus) -> Self {
        LevelEmbedding {
            k: consensus.membership.ncols(),
            membership: consensus.membership.view(),
            archetypes: consensus.archetypes.view(),
        }
    }
}

/// Symmetrized kNN graph of one level, keyed by `(i, j)` with `i < j`
#[derive(Clone, Debug, PartialEq)]
pub struct LevelGraph {
    n: usize,
    edges: BTreeMap<(usize, usize), f64>,
    similarity: Similarity,
    coords: Array2<f64>,
    scales: Vec<KernelScale>,
}

impl LevelGraph {
    /// Number of nodes
    pub fn n_nodes(&self) -> usize {
        self.n
    }

    /// Number of undirected edges, including those of zero weight
    pub fn n_edges(&self) -> usize {
        self.edges.len()
    }

    /// Weight of the edge between `i` and `j`, if there is one
    pub fn weight(&self, i: usize, j: usize) -> Option<f64> {
        self.edges.get(&(i.min(j), i.max(j))).copied()
    }

    /// Iterate `((i, j), weight)` with `i < j`, in order
    pub fn edges(&self) -> impl Iterator<Item = ((usize, usize), f64)> + '_ {
        self.edges.iter().map(|(&e, &w)| (e, w))
    }

    /// Similarity of `i` and `j` in this level's embedding, whether or not they are neighbors
    pub fn similarity(&self, i: usize, j: usize) -> f64 {
        self.similarity.pair_weight(&self.coords.view(), &self.scales, i, j)
    }
}

/// Build the kNN graph of one level. Directed neighbor edges are merged by fuzzy union, so an
/// edge found from both ends gets weight `a + b - a b`. Cells flagged in `mask` get no edges.
pub fn level_graph(level: &LevelEmbedding, mask: Option<&[bool]>, cfg: &FuseConfig) -> Result<LevelGraph> {
    cfg.validate()?;
    let n = level.membership.nrows();
    if let Some(mask) = mask {
        if mask.len() != n {
            return Err(ArchnetError::invalid("mask", mask.len(), format!("{n} (number of cells)")));
        }
    }

    let coords = cfg.similarity.coordinates(level);
    let neighbors = knn(&coords.view(), cfg.neighbors_per_level, mask);
    let weights = cfg.similarity.weights(&neighbors);
    let scales = cfg.similarity.scales(&neighbors);

    let mut edges = BTreeMap::new();
    for i in 0..n {
        for slot in 0..neighbors.k() {
            let j = neighbors.indices[[i, slot]];
            if j == NO_NEIGHBOR {
                continue;
            }
            let key = (i.min(j), i.max(j));
            let w = weights[[i, slot]];
            let e = edges.entry(key).or_insert(0.0);
            *e = fuzzy_union(*e, w);
        }
    }
    Ok(LevelGraph {
        n,
        edges,
        similarity: cfg.similarity,
        coords,
        scales,
    })
}

/// Symmetric weighted cell-cell network with no self-loops. Every cell is a node.
#[derive(Clone, Debug, PartialEq)]
pub struct FusedNetwork {
    adjacency: CsMat<f64>,
}

impl FusedNetwork {
    /// Build from undirected edges `(i, j, w)` with `i != j`. Each pair must appear once.
    pub fn from_edges(n: usize, edges: impl IntoIterator<Item = (usize, usize, f64)>) -> FusedNetwork {
        let mut tri = TriMat::new((n, n));
        for (i, j, w) in edges {
            debug_assert!(i != j);
            tri.add_triplet(i, j, w);
            tri.add_triplet(j, i, w);
        }
        FusedNetwork {
            adjacency: tri.to_csr(),
        }
    }

    /// Number of nodes, equal to the number of cells
    pub fn n_nodes(&self) -> usize {
        self.adjacency.rows()
    }

    /// Number of undirected edges
    pub fn n_edges(&self) -> usize {
        self.adjacency.nnz() / 2
    }

    /// Weight between `i` and `j`, 0 if they are not connected
    pub fn weight(&self, i: usize, j: usize) -> f64 {
        self.adjacency.get(i, j).copied().unwrap_or(0.0)
    }

    /// Number of neighbors of `i`
    pub fn degree(&self, i: usize) -> usize {
        self.adjacency.outer_view(i).map_or(0, |row| row.nnz())
    }

    /// Sum of the edge weights of `i`
    pub fn strength(&self, i: usize) -> f64 {
        self.adjacency.outer_view(i).map_or(0.0, |row| row.data().iter().sum())
    }

    /// Iterate `(j, weight)` over the neighbors of `i`
    pub fn neighbors(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.adjacency
            .outer_view(i)
            .into_iter()
            .flat_map(|row| row.iter().map(|(j, &w)| (j, w)).collect::<Vec<_>>())
    }

    /// Edge list `(i, j, weight)` with `i < j`
    pub fn edges(&self) -> Vec<(usize, usize, f64)> {
        let mut edges = Vec::with_capacity(self.n_edges());
        for (i, row) in self.adjacency.outer_iterator().enumerate() {
            for (j, &w) in row.iter() {
                if i < j {
                    edges.push((i, j, w));
                }
            }
        }
        edges
    }

    /// The symmetric cells x cells adjacency matrix in CSR layout
    pub fn adjacency(&self) -> &CsMat<f64> {
        &self.adjacency
    }
}

/// Build one kNN graph per level in parallel and fuse them, in level order, with `cfg.fusion`.
/// Every pair that is an edge at some level is fused. Pairs whose fused weight is zero are
/// dropped.
pub fn fuse(levels: &[LevelEmbedding], mask: Option<&[bool]>, cfg: &FuseConfig) -> Result<FusedNetwork> {
    cfg.validate()?;
    let Some(first) = levels.first() else {
        return Err(ArchnetError::invalid("levels", 0, "[1, inf) (at least one level)"));
    };
    let n = first.membership.nrows();
    if let Some(bad) = levels.iter().find(|l| l.membership.nrows() != n) {
        return Err(ArchnetError::invalid(
            "levels",
            format!("k = {} with {} cells", bad.k, bad.membership.nrows()),
            format!("{n} cells for every level"),
        ));
    }

    let graphs = levels
        .par_iter()
        .map(|level| level_graph(level, mask, cfg))
        .collect::<Result<Vec<_>>>()?;

    let rule = cfg.fusion;
    let pairs: Vec<(usize, usize)> = graphs
        .iter()
        .flat_map(|g| g.edges().map(|(key, _)| key))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let fused: Vec<(usize, usize, f64)> = pairs
        .into_par_iter()
        .map(|(i, j)| {
            let acc = graphs.iter().fold(rule.identity(), |acc, graph| {
                let w = if rule.every_level() {
                    Some(graph.similarity(i, j))
                } else {
                    graph.weight(i, j)
                };
                w.map_or(acc, |w| rule.combine(acc, w))
            });
            (i, j, rule.finish(acc, levels.len()))
        })
        .filter(|&(_, _, w)| w > 0.0)
        .collect();

    let network = FusedNetwork::from_edges(n, fused);
    info!(
        "fused {} level graphs into a network of {} nodes and {} edges",
        graphs.len(),
        network.n_nodes(),
        network.n_edges()
    );
    Ok(network)
}
