//! Merge the archetypes of every level into one consensus set.

use crate::archetype::ArchetypeLevel;
use crate::error::{ArchnetError, Result};
use crate::stats::pearson;
use itertools::Itertools;
use log::{debug, info};
use ndarray::{Array2, Axis};
use std::cmp::Ordering;

/// Where a consensus archetype came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArchetypeOrigin {
    /// archetype count of the level
    pub k: usize,
    /// row of the archetype within its level
    pub index: usize,
}

/// Consensus archetypes and the memberships of the cells in them
#[derive(Clone, Debug)]
pub struct Consensus {
    /// m x r profiles of the representative archetypes
    pub archetypes: Array2<f64>,
    /// m x cells landmark weights of the representatives
    pub landmarks: Array2<f64>,
    /// cells x m consensus membership, each row on the simplex
    pub membership: Array2<f64>,
    /// the level archetype each representative is
    pub origins: Vec<ArchetypeOrigin>,
    /// for level `l` (in input order) and archetype `j`, the representative it was merged into
    pub assignment: Vec<Vec<usize>>,
    /// number of levels with an archetype merged into each representative
    pub support: Vec<usize>,
}

impl Consensus {
    /// Number of consensus archetypes
    pub fn len(&self) -> usize {
        self.origins.len()
    }

    /// `true` if there are no consensus archetypes
    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

struct Candidate {
    level: usize,
    index: usize,
    explained: f64,
    residual: f64,
    k: usize,
}

impl Candidate {
    fn order(&self, other: &Candidate) -> Ordering {
        other
            .explained
            .total_cmp(&self.explained)
            .then(self.residual.total_cmp(&other.residual))
            .then(self.k.cmp(&other.k))
            .then(self.index.cmp(&other.index))
    }
}

/// The representative in `reps` whose profile correlates most with `cand`'s, and that correlation
fn most_correlated(levels: &[ArchetypeLevel], cand: &Candidate, reps: &[&Candidate]) -> Option<(usize, f64)> {
    let profile = levels[cand.level].archetypes.row(cand.index);
    let mut best: Option<(usize, f64)> = None;
    for (r, rep) in reps.iter().enumerate() {
        let corr = pearson(&profile, &levels[rep.level].archetypes.row(rep.index));
        if best.map_or(true, |(_, b)| corr > b) {
            best = Some((r, corr));
        }
    }
    best
}

/// Greedily merge the archetypes of `levels` whose profiles correlate above `threshold`.
///
/// Archetypes are visited from the best-explaining level down. Each one joins the retained
/// representative it correlates with most strongly if that correlation exceeds `threshold`
/// (the earlier representative wins ties). Otherwise it becomes a representative itself.
///
/// A representative found in fewer than `min_support` levels is dropped, and its archetypes
/// are folded into the kept representative they correlate with most. `min_support` is capped
/// at the best support any representative reaches, so something is always kept.
pub fn aggregate(levels: &[ArchetypeLevel], threshold: f64, min_support: usize) -> Result<Consensus> {
    if !(threshold > 0.0 && threshold <= 1.0) {
        return Err(ArchnetError::invalid("merge_threshold", threshold, "(0, 1]"));
    }
    if min_support == 0 {
        return Err(ArchnetError::invalid("min_level_support", min_support, "[1, inf)"));
    }
    let Some(first) = levels.first() else {
        return Err(ArchnetError::invalid("levels", 0, "[1, inf) (at least one level)"));
    };
    let (cells, rank) = (first.membership.nrows(), first.archetypes.ncols());
    for level in levels {
        if level.membership.nrows() != cells || level.archetypes.ncols() != rank {
            return Err(ArchnetError::invalid(
                "levels",
                format!("k = {} with {} cells", level.k, level.membership.nrows()),
                format!("{cells} cells and rank {rank} for every level"),
            ));
        }
    }

    let candidates = levels
        .iter()
        .enumerate()
        .flat_map(|(l, level)| {
            let explained = level.explained_variance();
            let residual = level.residual();
            (0..level.k).map(move |index| Candidate {
                level: l,
                index,
                explained,
                residual,
                k: level.k,
            })
        })
        .sorted_by(|a, b| a.order(b))
        .collect::<Vec<_>>();

    let mut reps: Vec<&Candidate> = Vec::new();
    let mut merged: Vec<Vec<&Candidate>> = Vec::new();
    for cand in &candidates {
        match most_correlated(levels, cand, &reps) {
            Some((r, corr)) if corr > threshold => merged[r].push(cand),
            _ => {
                reps.push(cand);
                merged.push(vec![cand]);
            }
        }
    }

    let support: Vec<usize> = merged
        .iter()
        .map(|group| group.iter().map(|c| c.level).unique().count())
        .collect();
    let required = min_support.min(support.iter().copied().max().unwrap_or(1));

    let mut kept: Vec<&Candidate> = Vec::new();
    let mut kept_support = Vec::new();
    let mut dropped: Vec<&Candidate> = Vec::new();
    let mut assignment: Vec<Vec<usize>> = levels.iter().map(|l| vec![usize::MAX; l.k]).collect();
    for (group, &n) in merged.iter().zip(&support) {
        if n >= required {
            for c in group {
                assignment[c.level][c.index] = kept.len();
            }
            kept.push(group[0]);
            kept_support.push(n);
        } else {
            dropped.extend(group.iter().copied());
        }
    }
    for &c in &dropped {
        // `kept` is never empty: the best supported group always meets `required`
        let (r, _) = most_correlated(levels, c, &kept).unwrap_or((0, 0.0));
        assignment[c.level][c.index] = r;
    }
    if !dropped.is_empty() {
        debug!(
            "folded {} archetypes seen in fewer than {} levels into stable representatives",
            dropped.len(),
            required
        );
    }

    let m = kept.len();
    let mut archetypes = Array2::zeros((m, rank));
    let mut landmarks = Array2::zeros((m, cells));
    for (r, rep) in kept.iter().enumerate() {
        let level = &levels[rep.level];
        archetypes.row_mut(r).assign(&level.archetypes.row(rep.index));
        landmarks.row_mut(r).assign(&level.landmarks.row(rep.index));
    }

    let mut membership = Array2::<f64>::zeros((cells, m));
    for (level, assigned) in levels.iter().zip(&assignment) {
        for (j, &target) in assigned.iter().enumerate() {
            let mut col = membership.column_mut(target);
            col += &level.membership.column(j);
        }
    }
    for mut row in membership.axis_iter_mut(Axis(0)) {
        let total = row.sum();
        if total > 0.0 {
            row /= total;
        } else {
            row.fill(1.0 / m as f64);
        }
    }

    let origins = kept
        .iter()
        .map(|rep| ArchetypeOrigin {
            k: rep.k,
            index: rep.index,
        })
        .collect();

    info!(
        "merged {} archetypes from {} levels into {} consensus archetypes",
        candidates.len(),
        levels.len(),
        m
    );

    Ok(Consensus {
        archetypes,
        landmarks,
        membership,
        origins,
        assignment,
        support: kept_support,
    })
}
