use anyhow::{bail, Error};
use std::str::FromStr;

/// Folds the weights a cell pair gets at each level into one fused weight.
///
/// Only pairs that are neighbors at some level are fused. Unless [`Fuse::every_level`] is set,
/// levels where the pair are not neighbors contribute nothing, so `combine` only sees the
/// levels that have the edge. `finish` receives the total number of levels.
pub trait Fuse {
    /// `true` if `combine` sees the pair's weight at every level, neighbors there or not
    fn every_level(&self) -> bool {
        false
    }

    /// Accumulator before any level is seen
    fn identity(&self) -> f64;

    /// Add one level's weight to the accumulator
    fn combine(&self, acc: f64, weight: f64) -> f64;

    /// Turn the accumulator into the fused weight
    fn finish(&self, acc: f64, n_levels: usize) -> f64;
}

/// Rule for combining per-level edge weights
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FusionRule {
    /// Sum of the level weights over the number of levels
    Mean,
    /// `1 - prod(1 - w)`: the pair is connected unless every level says otherwise
    ProbabilisticUnion,
    /// The smallest weight the pair has at any level, neighbors there or not
    Consistent,
}

impl FromStr for FusionRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mean" => Ok(FusionRule::Mean),
            "union" => Ok(FusionRule::ProbabilisticUnion),
            "consistent" => Ok(FusionRule::Consistent),
            _ => bail!("Fusion rule not recognized: {}", s),
        }
    }
}

impl Fuse for FusionRule {
    fn every_level(&self) -> bool {
        matches!(self, FusionRule::Consistent)
    }

    fn identity(&self) -> f64 {
        match self {
            FusionRule::Mean => 0.0,
            FusionRule::ProbabilisticUnion | FusionRule::Consistent => 1.0,
        }
    }

    fn combine(&self, acc: f64, weight: f64) -> f64 {
        match self {
            FusionRule::Mean => acc + weight,
            FusionRule::ProbabilisticUnion => acc * (1.0 - weight),
            FusionRule::Consistent => acc.min(weight),
        }
    }

    fn finish(&self, acc: f64, n_levels: usize) -> f64 {
        let w = match self {
            FusionRule::Mean => acc / n_levels.max(1) as f64,
            FusionRule::ProbabilisticUnion => 1.0 - acc,
            FusionRule::Consistent => acc,
        };
        w.clamp(0.0, 1.0)
    }
}

/// Fuzzy set union of two memberships, `a + b - a b`
pub fn fuzzy_union(a: f64, b: f64) -> f64 {
    a + b - a * b
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn fold(rule: FusionRule, weights: &[f64], n_levels: usize) -> f64 {
        let acc = weights.iter().fold(rule.identity(), |acc, &w| rule.combine(acc, w));
        rule.finish(acc, n_levels)
    }

    #[test]
    fn test_rules() {
        assert_abs_diff_eq!(fold(FusionRule::Mean, &[0.6, 0.2], 4), 0.2);
        assert_abs_diff_eq!(fold(FusionRule::ProbabilisticUnion, &[0.5, 0.5], 4), 0.75);
        assert_eq!(fold(FusionRule::Mean, &[], 3), 0.0);
        assert_eq!(fold(FusionRule::ProbabilisticUnion, &[], 3), 0.0);
        assert_abs_diff_eq!(fold(FusionRule::Consistent, &[0.9, 0.3, 0.7], 3), 0.3);
        assert_eq!(fold(FusionRule::Consistent, &[0.9, 0.0], 2), 0.0);
        assert!(FusionRule::Consistent.every_level());
        assert!(!FusionRule::Mean.every_level());
        assert_eq!("consistent".parse::<FusionRule>().unwrap(), FusionRule::Consistent);
    }

    #[test]
    fn test_more_levels_never_weaken() {
        for rule in [FusionRule::Mean, FusionRule::ProbabilisticUnion] {
            let mut prev = 0.0;
            for n in 1..=5 {
                let w = fold(rule, &vec![0.4; n], 5);
                assert!(w >= prev && w <= 1.0);
                prev = w;
            }
        }
        assert_eq!(fuzzy_union(0.5, 0.5), 0.75);
        assert_eq!(fuzzy_union(1.0, 0.3), 1.0);
    }
}
