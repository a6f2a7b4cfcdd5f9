use super::{fuzzy_union, LevelEmbedding};
use crate::nn::{Neighbors, NO_NEIGHBOR};
use crate::stats::l2_normalize_rows;
use anyhow::{bail, Error};
use ndarray::{Array2, ArrayView1, ArrayView2};
use std::str::FromStr;

const BANDWIDTH: f64 = 1.0;
const NITER: usize = 64;
const SMOOTH_K_TOLERANCE: f64 = 1e-5;
const MIN_K_DIST_SCALE: f64 = 1e-3;

/// Computes the space a level's kNN graph is built in, and the directed weight of each
/// neighbor edge.
pub trait EdgeWeighting {
    /// cells x d coordinates searched for nearest neighbors
    fn coordinates(&self, level: &LevelEmbedding) -> Array2<f64>;

    /// Directed edge weights in `[0, 1]`, laid out like `neighbors.indices`.
    /// Empty slots get weight 0.
    fn weights(&self, neighbors: &Neighbors) -> Array2<f64>;

    /// Per-cell kernel scales, empty if the weighting has none
    fn scales(&self, neighbors: &Neighbors) -> Vec<KernelScale>;

    /// Symmetric weight in `[0, 1]` of cells `i` and `j`, whether or not they are neighbors.
    /// `coords` comes from [`EdgeWeighting::coordinates`] and `scales` from
    /// [`EdgeWeighting::scales`].
    fn pair_weight(&self, coords: &ArrayView2<f64>, scales: &[KernelScale], i: usize, j: usize) -> f64;
}

/// Per-cell parameters of the smooth kNN kernel
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct KernelScale {
    /// distance to the nearest non-identical neighbor
    pub rho: f64,
    /// bandwidth
    pub sigma: f64,
}

impl KernelScale {
    /// `exp(-(d - rho) / sigma)`, 1 within `rho`
    pub fn strength(&self, d: f64) -> f64 {
        if d - self.rho <= 0.0 {
            1.0
        } else if self.sigma <= 0.0 {
            0.0
        } else {
            (-((d - self.rho) / self.sigma)).exp()
        }
    }
}

/// How a level embeds the cells and weights their neighbor edges
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Similarity {
    /// Cosine similarity of the membership rows
    MembershipCosine,
    /// Euclidean distance between the archetypal reconstructions `H Z` of the cells,
    /// turned into weights with a per-cell smooth kNN kernel
    ReducedEuclidean,
}

impl FromStr for Similarity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "membership_cosine" => Ok(Similarity::MembershipCosine),
            "reduced_euclidean" => Ok(Similarity::ReducedEuclidean),
            _ => bail!("Similarity not recognized: {}", s),
        }
    }
}

impl EdgeWeighting for Similarity {
    fn coordinates(&self, level: &LevelEmbedding) -> Array2<f64> {
        match self {
            Similarity::MembershipCosine => {
                let mut coords = level.membership.to_owned();
                l2_normalize_rows(&mut coords);
                coords
            }
            Similarity::ReducedEuclidean => level.membership.dot(&level.archetypes),
        }
    }

    fn weights(&self, neighbors: &Neighbors) -> Array2<f64> {
        match self {
            // unit vectors: cos = 1 - d^2 / 2
            Similarity::MembershipCosine => {
                let mut w = neighbors.distances.mapv(|d| (1.0 - d * d / 2.0).clamp(0.0, 1.0));
                w.zip_mut_with(&neighbors.indices, |w, &j| {
                    if j == NO_NEIGHBOR {
                        *w = 0.0;
                    }
                });
                w
            }
            Similarity::ReducedEuclidean => smooth_knn_weights(neighbors),
        }
    }

    fn scales(&self, neighbors: &Neighbors) -> Vec<KernelScale> {
        match self {
            Similarity::MembershipCosine => Vec::new(),
            Similarity::ReducedEuclidean => smooth_knn_scales(neighbors),
        }
    }

    fn pair_weight(&self, coords: &ArrayView2<f64>, scales: &[KernelScale], i: usize, j: usize) -> f64 {
        let (a, b) = (coords.row(i), coords.row(j));
        match self {
            Similarity::MembershipCosine => a.dot(&b).clamp(0.0, 1.0),
            Similarity::ReducedEuclidean => {
                let d = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt();
                let strength = |c: usize| scales.get(c).map_or(0.0, |s| s.strength(d));
                fuzzy_union(strength(i), strength(j))
            }
        }
    }
}

/// UMAP-style membership strengths `exp(-(d - rho_i) / sigma_i)`, where `rho_i` is the distance
/// to the nearest non-identical neighbor and `sigma_i` normalizes the strengths of each row to
/// sum to `log2(k)`.
pub fn smooth_knn_weights(neighbors: &Neighbors) -> Array2<f64> {
    let scales = smooth_knn_scales(neighbors);
    let mut weights = Array2::zeros(neighbors.distances.dim());
    for ((i, j), w) in weights.indexed_iter_mut() {
        if neighbors.indices[[i, j]] != NO_NEIGHBOR {
            *w = scales[i].strength(neighbors.distances[[i, j]]);
        }
    }
    weights
}

/// The `rho_i` and `sigma_i` of [`smooth_knn_weights`] for every cell. Cells without neighbors
/// get zeros.
pub fn smooth_knn_scales(neighbors: &Neighbors) -> Vec<KernelScale> {
    let (cells, k) = neighbors.distances.dim();
    let mut scales = vec![KernelScale::default(); cells];
    if k == 0 {
        return scales;
    }

    let finite: Vec<f64> = neighbors.distances.iter().copied().filter(|d| d.is_finite()).collect();
    let mean_distance = if finite.is_empty() {
        0.0
    } else {
        finite.iter().sum::<f64>() / finite.len() as f64
    };

    for (i, scale) in scales.iter_mut().enumerate() {
        if neighbors.indices[[i, 0]] == NO_NEIGHBOR {
            continue;
        }
        let row = neighbors.distances.row(i);
        let rho = row.iter().copied().find(|&d| d > 0.0).unwrap_or(0.0);
        let sigma = smooth_knn_dist(row, rho, k, BANDWIDTH, NITER);

        let floor = if rho > 0.0 {
            MIN_K_DIST_SCALE * row.iter().filter(|d| d.is_finite()).sum::<f64>() / k as f64
        } else {
            MIN_K_DIST_SCALE * mean_distance
        };
        *scale = KernelScale {
            rho,
            sigma: sigma.max(floor),
        };
    }
    scales
}

/// calculate sigma for an individual point
fn smooth_knn_dist(distances: ArrayView1<f64>, rho: f64, k: usize, bandwidth: f64, n_iter: usize) -> f64 {
    let target = (k as f64).log2() * bandwidth;
    let mut lo = 0.0;
    let mut mid = 1.0;
    let mut hi = f64::MAX;

    for _ in 0..n_iter {
        let psum = distances
            .iter()
            .fold(0.0_f64, |acc, &v| acc + (-((v - rho).max(0.0) / mid)).exp());

        if (psum - target).abs() < SMOOTH_K_TOLERANCE {
            break;
        }
        if psum > target {
            hi = mid;
            mid = lo + (hi - lo) / 2.0;
        } else {
            lo = mid;
            if hi == f64::MAX {
                mid *= 2.0;
            } else {
                mid = lo + (hi - lo) / 2.0;
            }
        }
    }
    mid
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    #[test]
    fn smooth_knn_dist_test() {
        let dists = arr1(&[0., 1., 2., 3., 4., 5.]);
        let rho = 1.0;
        let k = 6;
        let sigma = smooth_knn_dist(dists.view(), rho, k, BANDWIDTH, NITER);
        let psum = dists
            .iter()
            .fold(0.0_f64, |acc, &v| acc + (-((v - rho).max(0.0) / sigma)).exp());
        assert!((psum - (k as f64).log2()).abs() <= SMOOTH_K_TOLERANCE);
    }

    #[test]
    fn test_smooth_weights() {
        let neighbors = Neighbors {
            indices: arr2(&[[1, 2], [0, 2], [NO_NEIGHBOR, NO_NEIGHBOR]]),
            distances: arr2(&[[0.5, 1.5], [0.5, 2.0], [f64::INFINITY, f64::INFINITY]]),
        };
        let w = smooth_knn_weights(&neighbors);
        // the nearest neighbor always has full strength
        assert_eq!(w[[0, 0]], 1.0);
        assert_eq!(w[[1, 0]], 1.0);
        assert!(w[[0, 1]] > 0.0 && w[[0, 1]] < 1.0);
        assert!(w[[1, 1]] > 0.0 && w[[1, 1]] < 1.0);
        assert_eq!(w.row(2), arr1(&[0.0, 0.0]));
    }

    #[test]
    fn test_cosine_weights() {
        let membership = arr2(&[[1.0, 0.0], [0.5, 0.5], [0.0, 1.0]]);
        let archetypes = arr2(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        let level = LevelEmbedding {
            k: 2,
            membership: membership.view(),
            archetypes: archetypes.view(),
        };
        let coords = Similarity::MembershipCosine.coordinates(&level);
        let d01 = (&coords.row(0) - &coords.row(1)).mapv(|v| v * v).sum().sqrt();
        let d02 = (&coords.row(0) - &coords.row(2)).mapv(|v| v * v).sum().sqrt();

        let neighbors = Neighbors {
            indices: arr2(&[[1, 2]]),
            distances: arr2(&[[d01, d02]]),
        };
        let w = Similarity::MembershipCosine.weights(&neighbors);
        assert_abs_diff_eq!(w[[0, 0]], 0.5f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(w[[0, 1]], 0.0, epsilon = 1e-12);

        let coords = Similarity::ReducedEuclidean.coordinates(&level);
        assert_eq!(coords.row(1), arr1(&[0.5, 0.5, 0.0]));
    }
}
