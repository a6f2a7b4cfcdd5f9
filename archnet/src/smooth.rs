//! Smoothing and imputation over the fused network and the consensus archetypes.

use crate::aggregate::Consensus;
use crate::dim_red::DataMat;
use crate::error::{ArchnetError, Result};
use crate::network::FusedNetwork;
use ndarray::linalg::Dot;
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use std::f64::consts::LN_10;

fn check_diffusion(net: &FusedNetwork, signal: &ArrayView2<f64>, alpha: f64, n_iter: usize) -> Result<()> {
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(ArchnetError::invalid("alpha", alpha, "(0, 1)"));
    }
    if n_iter == 0 {
        return Err(ArchnetError::invalid("n_iter", n_iter, "[1, inf)"));
    }
    if signal.nrows() != net.n_nodes() {
        return Err(ArchnetError::invalid(
            "signal",
            format!("{} rows", signal.nrows()),
            format!("{} rows (number of cells)", net.n_nodes()),
        ));
    }
    Ok(())
}

/// One step of the random walk `P x`, where `P` is column-stochastic. Isolated cells keep
/// their own value.
fn random_walk(net: &FusedNetwork, strength: &[f64], x: &Array2<f64>) -> Array2<f64> {
    let mut scaled = x.clone();
    for (mut row, &s) in scaled.axis_iter_mut(Axis(0)).zip(strength) {
        if s > 0.0 {
            row /= s;
        }
    }
    let mut out: Array2<f64> = net.adjacency() * &scaled;
    for (i, &s) in strength.iter().enumerate() {
        if s <= 0.0 {
            out.row_mut(i).assign(&x.row(i));
        }
    }
    out
}

/// Diffuse each column of `signal` (cells x m) over the network:
/// `x <- alpha P x + (1 - alpha) x0`, repeated `n_iter` times. The column sums of the signal
/// are preserved.
pub fn network_diffusion(net: &FusedNetwork, signal: &ArrayView2<f64>, alpha: f64, n_iter: usize) -> Result<Array2<f64>> {
    check_diffusion(net, signal, alpha, n_iter)?;
    let strength: Vec<f64> = (0..net.n_nodes()).map(|i| net.strength(i)).collect();

    let x0 = signal.to_owned();
    let mut x = x0.clone();
    for _ in 0..n_iter {
        let mut next = random_walk(net, &strength, &x) * alpha;
        next.scaled_add(1.0 - alpha, &x0);
        x = next;
    }
    Ok(x)
}

/// Impute features by network diffusion. Negative values are clipped and each column is scaled
/// to unit sum before diffusing. Each diffused column is then rescaled so its maximum matches
/// the maximum of the scaled input column, and clipped there. All-zero columns stay zero.
pub fn impute_by_diffusion(net: &FusedNetwork, signal: &ArrayView2<f64>, alpha: f64, n_iter: usize) -> Result<Array2<f64>> {
    check_diffusion(net, signal, alpha, n_iter)?;

    let mut u = signal.mapv(|v| if v > 0.0 { v } else { 0.0 });
    for mut col in u.axis_iter_mut(Axis(1)) {
        let total = col.sum();
        if total > 0.0 {
            col /= total;
        }
    }

    let mut imputed = network_diffusion(net, &u.view(), alpha, n_iter)?;
    imputed.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v });

    for (mut y, x) in imputed.axis_iter_mut(Axis(1)).zip(u.axis_iter(Axis(1))) {
        let x_max = x.fold(0.0f64, |a, &b| a.max(b));
        let y_max = y.fold(0.0f64, |a, &b| a.max(b));
        if y_max <= 0.0 {
            y.fill(0.0);
            continue;
        }
        y.mapv_inplace(|v| (v * x_max / y_max).min(x_max));
    }
    Ok(imputed)
}

/// Feature profile of each consensus archetype: the landmark-weighted average of the cells'
/// `values` (cells x features). Returns features x m.
pub fn archetype_feature_profiles<T>(values: &T, consensus: &Consensus) -> Result<Array2<f64>>
where
    T: DataMat,
    Array2<f64>: Dot<T, Output = Array2<f64>>,
{
    let [cells, _] = values.shape();
    if consensus.landmarks.ncols() != cells {
        return Err(ArchnetError::invalid(
            "values",
            format!("{cells} rows"),
            format!("{} rows (number of cells)", consensus.landmarks.ncols()),
        ));
    }
    Ok(consensus.landmarks.dot(values).reversed_axes())
}

/// Interpolate the selected rows of `profiles` (features x m) over the consensus membership.
/// Returns cells x `features.len()`.
pub fn impute_from_archetypes(profiles: &ArrayView2<f64>, consensus: &Consensus, features: &[usize]) -> Result<Array2<f64>> {
    if profiles.ncols() != consensus.len() {
        return Err(ArchnetError::invalid(
            "profiles",
            format!("{} columns", profiles.ncols()),
            format!("{} columns (consensus archetypes)", consensus.len()),
        ));
    }
    if let Some(&bad) = features.iter().find(|&&f| f >= profiles.nrows()) {
        return Err(ArchnetError::invalid(
            "features",
            bad,
            format!("[0, {})", profiles.nrows()),
        ));
    }
    let selected = profiles.select(Axis(0), features);
    Ok(consensus.membership.dot(&selected.t()))
}

/// How specifically each feature marks each consensus archetype. `values` is cells x features
/// and non-negative. Returns features x m scores in `-log10(p)` units, 0 where a feature is not
/// enriched.
///
/// Each feature is scaled to `[0, 1]` by its maximum. The membership column of an archetype,
/// scaled to mean 1, weights the cells. The weighted sum of the feature is compared to its value
/// under no association, and the excess is turned into a Bernstein tail bound.
pub fn archetype_feature_specificity(values: &ArrayView2<f64>, consensus: &Consensus) -> Result<Array2<f64>> {
    let (cells, features) = values.dim();
    if consensus.membership.nrows() != cells {
        return Err(ArchnetError::invalid(
            "values",
            format!("{cells} rows"),
            format!("{} rows (number of cells)", consensus.membership.nrows()),
        ));
    }
    if let Some(&bad) = values.iter().find(|&&v| !(v >= 0.0 && v.is_finite())) {
        return Err(ArchnetError::invalid("values", bad, "[0, inf)"));
    }

    let mut weights = consensus.membership.to_owned();
    for mut col in weights.axis_iter_mut(Axis(1)) {
        let mean = col.sum() / cells.max(1) as f64;
        if mean > 0.0 {
            col /= mean;
        }
    }
    let total: Array1<f64> = weights.sum_axis(Axis(0));
    let sq_total: Array1<f64> = weights.mapv(|w| w * w).sum_axis(Axis(0));
    let peak: Array1<f64> = weights.fold_axis(Axis(0), 0.0, |&a, &b| a.max(b));

    let mut specificity = Array2::zeros((features, consensus.len()));
    Zip::from(specificity.rows_mut())
        .and(values.columns())
        .par_for_each(|mut out, x| {
            let x_max = x.fold(0.0f64, |a, &b| a.max(b));
            if x_max <= 0.0 {
                return;
            }
            let x = x.mapv(|v| v / x_max);
            let p = x.sum() / cells as f64;
            let variance = p * (1.0 - p);
            let observed = weights.t().dot(&x);

            for (a, score) in out.iter_mut().enumerate() {
                let excess = observed[a] - p * total[a];
                let denom = 2.0 * (variance * sq_total[a] + peak[a] * excess / 3.0);
                if excess > 0.0 && denom > 0.0 {
                    *score = excess * excess / denom / LN_10;
                }
            }
        });
    Ok(specificity)
}

/// Interpolate `log1p` of the selected rows of `specificity` (features x m) over the consensus
/// membership. Returns cells x `features.len()`.
pub fn impute_specific_from_archetypes(
    specificity: &ArrayView2<f64>,
    consensus: &Consensus,
    features: &[usize],
) -> Result<Array2<f64>> {
    if let Some(&bad) = specificity.iter().find(|&&v| !(v >= 0.0)) {
        return Err(ArchnetError::invalid("specificity", bad, "[0, inf)"));
    }
    let scores = specificity.mapv(f64::ln_1p);
    impute_from_archetypes(&scores.view(), consensus, features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::ArchetypeOrigin;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, Array2};

    /// path 0 - 1 - 2 plus the isolated node 3
    fn path() -> FusedNetwork {
        FusedNetwork::from_edges(4, vec![(0, 1, 1.0), (1, 2, 0.5)])
    }

    #[test]
    fn test_diffusion_preserves_mass() {
        let net = path();
        let signal = arr2(&[[1.0, 0.0], [0.0, 2.0], [0.0, 0.0], [3.0, 1.0]]);
        let out = network_diffusion(&net, &signal.view(), 0.85, 10).unwrap();
        for (a, b) in out.axis_iter(Axis(1)).zip(signal.axis_iter(Axis(1))) {
            assert_abs_diff_eq!(a.sum(), b.sum(), epsilon = 1e-12);
        }
        // isolated node keeps its value
        assert_abs_diff_eq!(out[[3, 0]], 3.0, epsilon = 1e-12);
        // mass spreads along the path
        assert!(out[[2, 0]] > 0.0);
    }

    #[test]
    fn test_diffusion_rejects_bad_parameters() {
        let net = path();
        let signal = Array2::<f64>::zeros((4, 1));
        for alpha in [0.0, 1.0, f64::NAN] {
            assert!(network_diffusion(&net, &signal.view(), alpha, 3).is_err());
        }
        assert!(network_diffusion(&net, &signal.view(), 0.5, 0).is_err());
        assert!(network_diffusion(&net, &Array2::zeros((3, 1)).view(), 0.5, 1).is_err());
    }

    #[test]
    fn test_impute_by_diffusion() {
        let net = path();
        let signal = arr2(&[[4.0, 0.0, -1.0], [0.0, 0.0, 2.0], [0.0, 0.0, 2.0], [0.0, 0.0, 0.0]]);
        let out = impute_by_diffusion(&net, &signal.view(), 0.5, 5).unwrap();

        // column 0 is scaled to unit sum, so its max is 1
        assert_abs_diff_eq!(out.column(0).fold(0.0f64, |a, &b| a.max(b)), 1.0, epsilon = 1e-12);
        assert!(out[[1, 0]] > 0.0);
        assert!(out.column(1).iter().all(|&v| v == 0.0));
        assert!(out.iter().all(|&v| v >= 0.0));
        assert!(out.column(2).iter().all(|&v| v <= 0.5 + 1e-12));
    }

    fn consensus() -> Consensus {
        Consensus {
            archetypes: arr2(&[[1.0, 0.0], [0.0, 1.0]]),
            landmarks: arr2(&[[1.0, 0.0, 0.0], [0.0, 0.5, 0.5]]),
            membership: arr2(&[[1.0, 0.0], [0.25, 0.75], [0.0, 1.0]]),
            origins: vec![ArchetypeOrigin { k: 2, index: 0 }, ArchetypeOrigin { k: 2, index: 1 }],
            assignment: vec![vec![0, 1]],
            support: vec![1, 1],
        }
    }

    #[test]
    fn test_archetype_profiles() {
        let c = consensus();
        let values = arr2(&[[2.0, 0.0, 1.0, 5.0], [0.0, 4.0, 1.0, 5.0], [0.0, 2.0, 3.0, 5.0]]);
        let profiles = archetype_feature_profiles(&values, &c).unwrap();
        assert_eq!(profiles, arr2(&[[2.0, 0.0], [0.0, 3.0], [1.0, 2.0], [5.0, 5.0]]));

        let imputed = impute_from_archetypes(&profiles.view(), &c, &[1, 3]).unwrap();
        assert_abs_diff_eq!(imputed, arr2(&[[0.0, 5.0], [2.25, 5.0], [3.0, 5.0]]), epsilon = 1e-12);

        assert!(impute_from_archetypes(&profiles.view(), &c, &[4]).is_err());
        assert!(archetype_feature_profiles(&Array2::<f64>::zeros((2, 4)), &c).is_err());
    }

    #[test]
    fn test_feature_specificity() {
        let c = consensus();
        // feature 0 marks cell 0, feature 1 marks cells 1 and 2, feature 2 is flat, feature 3 empty
        let values = arr2(&[[6.0, 0.0, 5.0, 0.0], [0.0, 3.0, 5.0, 0.0], [0.0, 4.0, 5.0, 0.0]]);
        let scores = archetype_feature_specificity(&values.view(), &c).unwrap();
        assert_eq!(scores.dim(), (4, 2));
        assert!(scores.iter().all(|&v| v >= 0.0));

        assert!(scores[[0, 0]] > 0.0);
        assert_eq!(scores[[0, 1]], 0.0);
        assert!(scores[[1, 1]] > 0.0);
        assert_eq!(scores[[1, 0]], 0.0);
        assert!(scores[[2, 0]] < 1e-9 && scores[[2, 1]] < 1e-9);
        assert_eq!(scores.row(3), arr1(&[0.0, 0.0]));

        // rescaling a feature does not change its scores
        let scaled = arr2(&[[60.0, 0.0, 5.0, 0.0], [0.0, 3.0, 5.0, 0.0], [0.0, 4.0, 5.0, 0.0]]);
        let again = archetype_feature_specificity(&scaled.view(), &c).unwrap();
        assert_abs_diff_eq!(again, scores, epsilon = 1e-12);

        let imputed = impute_specific_from_archetypes(&scores.view(), &c, &[0, 1]).unwrap();
        assert_eq!(imputed.dim(), (3, 2));
        assert_abs_diff_eq!(imputed[[0, 0]], scores[[0, 0]].ln_1p(), epsilon = 1e-12);
        assert_eq!(imputed[[2, 0]], 0.0);
        assert!(imputed[[2, 1]] > imputed[[0, 1]]);
        assert_abs_diff_eq!(imputed[[1, 0]], 0.25 * scores[[0, 0]].ln_1p(), epsilon = 1e-12);

        assert!(archetype_feature_specificity(&arr2(&[[-1.0], [0.0], [0.0]]).view(), &c).is_err());
        assert!(archetype_feature_specificity(&Array2::zeros((2, 1)).view(), &c).is_err());
        assert!(impute_specific_from_archetypes(&scores.view(), &c, &[7]).is_err());
    }
}
