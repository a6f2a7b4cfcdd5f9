use ball_tree::{BallTree, Point};
use log::{debug, warn};
use ndarray::parallel::prelude::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

/// Marks an unused slot in [`Neighbors::indices`]
pub const NO_NEIGHBOR: usize = usize::MAX;

#[derive(PartialEq)]
struct Pt(Vec<f64>);

impl Pt {
    fn from_row(row: ArrayView1<f64>) -> Pt {
        Pt(row.iter().copied().collect())
    }
}

impl Point for Pt {
    fn distance(&self, other: &Self) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|p| (p.1 - p.0).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    fn move_towards(&self, other: &Self, d: f64) -> Self {
        let total_dist = self.distance(other);
        let frac = if total_dist == 0.0 { 0.0 } else { d / total_dist };

        Pt(self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(&s, &o)| s + frac * (o - s))
            .collect())
    }
}

/// k-nearest-neighbor lists, one row per cell, nearest first
#[derive(Clone, Debug)]
pub struct Neighbors {
    /// neighbor cell indices, [`NO_NEIGHBOR`] for masked cells
    pub indices: Array2<usize>,
    /// Euclidean distances matching `indices`, infinite for masked cells
    pub distances: Array2<f64>,
}

impl Neighbors {
    /// Neighbors actually found per cell after clamping
    pub fn k(&self) -> usize {
        self.indices.ncols()
    }

    /// Iterate `(neighbor, distance)` for cell `i`, skipping empty slots
    pub fn of(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.indices
            .row(i)
            .into_iter()
            .zip(self.distances.row(i))
            .filter(|(&j, _)| j != NO_NEIGHBOR)
            .map(|(&j, &d)| (j, d))
    }
}

/// Compute the `k` nearest neighbors of each row in `v`, using Euclidean distance. Each row represents a n-dimensional
/// vector where n is the number of columns in `v`.
///
/// Rows flagged in `mask` are neither queried nor returned as neighbors. `k` is clamped to one
/// less than the number of unmasked rows.
pub fn knn(v: &ArrayView2<f64>, k: usize, mask: Option<&[bool]>) -> Neighbors {
    let (cells, _) = v.dim();
    let masked = |i: usize| mask.map_or(false, |m| m[i]);
    let active: Vec<usize> = (0..cells).filter(|&i| !masked(i)).collect();

    let k_eff = k.min(active.len().saturating_sub(1));
    if k_eff < k {
        warn!(
            "requested {} neighbors but only {} cells are available, using k = {}",
            k,
            active.len(),
            k_eff
        );
    }

    let mut indices = Array2::from_elem((cells, k_eff), NO_NEIGHBOR);
    let mut distances = Array2::from_elem((cells, k_eff), f64::INFINITY);
    if k_eff == 0 {
        return Neighbors { indices, distances };
    }

    let points: Vec<Pt> = active.iter().map(|&i| Pt::from_row(v.row(i))).collect();
    debug!("constructing ball tree of {} points", points.len());
    let ball_tree = BallTree::new(points, active.clone());

    debug!("querying points for {} neighbors", k_eff);
    indices
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(distances.axis_iter_mut(Axis(0)).into_par_iter())
        .enumerate()
        .for_each_init(
            || ball_tree.query(),
            |query, (cell, (mut ind_row, mut dist_row))| {
                if masked(cell) {
                    return;
                }
                let mut ind = 0;
                let pt = Pt::from_row(v.row(cell));
                for (_, d, &other) in query.nn(&pt).take(k_eff + 1) {
                    if other != cell && ind < k_eff {
                        ind_row[ind] = other;
                        dist_row[ind] = d;
                        ind += 1;
                    }
                }
            },
        );
    Neighbors { indices, distances }
}
