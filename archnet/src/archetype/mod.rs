//! Archetypal analysis for a single archetype count.
//!
//! A level with `k` archetypes factors the reduced matrix `X` (cells x r) as `X ~ H C X`, where
//! every row of the membership `H` (cells x k) and of the landmarks `C` (k x cells) lies on the
//! probability simplex. The archetypes `Z = C X` are therefore convex combinations of cells.
//! `H` and `C` are optimized alternately by projected gradient, starting from a successive
//! projection pick of `k` extreme cells.

use crate::config::SolverConfig;
use crate::error::{ArchnetError, Result};
use crate::simplex::{project_simplex, simplex_lsq};
use crate::stats::{max_eigenvalue, sum_sq};
use log::{debug, warn};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use std::collections::HashSet;

/// Successive projection initialization
pub mod spa;

/// Halvings of the C-step size tried before the step is skipped
const MAX_BACKTRACK: usize = 4;

/// How the alternating optimization of a level ended
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Convergence {
    /// The relative residual improvement dropped below the tolerance
    Converged {
        /// iterations run
        iterations: usize,
    },
    /// `max_iter` iterations ran without meeting the tolerance
    MaxIterations {
        /// iterations run
        iterations: usize,
        /// relative improvement of the final iteration
        last_improvement: f64,
    },
}

impl Convergence {
    /// `true` for [`Convergence::Converged`]
    pub fn is_converged(&self) -> bool {
        matches!(self, Convergence::Converged { .. })
    }

    /// Number of alternating iterations that ran
    pub fn iterations(&self) -> usize {
        match *self {
            Convergence::Converged { iterations } => iterations,
            Convergence::MaxIterations { iterations, .. } => iterations,
        }
    }
}

/// Decomposition of the reduced matrix at one archetype count
#[derive(Clone, Debug)]
pub struct ArchetypeLevel {
    /// number of archetypes
    pub k: usize,
    /// k x r archetype profiles, `landmarks . X`
    pub archetypes: Array2<f64>,
    /// k x cells simplex weights expressing each archetype through the cells
    pub landmarks: Array2<f64>,
    /// cells x k simplex weights expressing each cell through the archetypes
    pub membership: Array2<f64>,
    /// `|X - H Z|_F` after initialization and after every iteration
    pub residuals: Vec<f64>,
    /// `|X|_F^2`
    pub total_ss: f64,
    /// how the optimization ended
    pub status: Convergence,
}

impl ArchetypeLevel {
    /// Final residual `|X - H Z|_F`
    pub fn residual(&self) -> f64 {
        self.residuals.last().copied().unwrap_or(f64::INFINITY)
    }

    /// Fraction of `|X|_F^2` explained by the decomposition
    pub fn explained_variance(&self) -> f64 {
        if self.total_ss > 0.0 {
            1.0 - self.residual().powi(2) / self.total_ss
        } else {
            0.0
        }
    }
}

/// Number of distinct rows of `x`, comparing bit patterns with `-0.0 == 0.0`
pub fn distinct_rows(x: &ArrayView2<f64>) -> usize {
    let mut seen = HashSet::with_capacity(x.nrows());
    for row in x.axis_iter(Axis(0)) {
        let key: Vec<u64> = row.iter().map(|&v| if v == 0.0 { 0 } else { v.to_bits() }).collect();
        seen.insert(key);
    }
    seen.len()
}

/// Decompose `x` (cells x r) into `k` archetypes.
///
/// Fails with `InvalidConfig` if `k` is below 2 or exceeds the number of cells or of distinct
/// cells. Running out of iterations is reported through [`ArchetypeLevel::status`].
pub fn decompose(x: &ArrayView2<f64>, k: usize, cfg: &SolverConfig) -> Result<ArchetypeLevel> {
    cfg.validate()?;
    let n = x.nrows();
    if k < 2 || k > n {
        return Err(ArchnetError::invalid("k", k, format!("[2, {n}] (number of cells)")));
    }
    let distinct = distinct_rows(x);
    if k > distinct {
        return Err(ArchnetError::invalid(
            "k",
            k,
            format!("[2, {distinct}] (number of distinct cells)"),
        ));
    }

    let picks = spa::successive_projection(x, k);
    let mut c = Array2::<f64>::zeros((k, n));
    for (j, &cell) in picks.iter().enumerate() {
        c[[j, cell]] = 1.0;
    }
    let mut z = c.dot(x);
    let mut h = Array2::from_elem((n, k), 1.0 / k as f64);

    let mut errors = cell_errors(x, &h, &z);
    h_step(x, &z, &mut h, &mut errors, cfg.inner_iter);

    let total_ss = sum_sq(x);
    let x_lambda = max_eigenvalue(&x.t().dot(x));

    let mut residuals = vec![total(&errors).sqrt()];
    let mut status = None;
    let mut last_improvement = 0.0;

    for iter in 1..=cfg.max_iter {
        let prev = total(&errors);

        c_step(x, &h, &mut c, &mut z, &mut errors, x_lambda, cfg.inner_iter);
        h_step(x, &z, &mut h, &mut errors, cfg.inner_iter);

        let cur = total(&errors);
        residuals.push(cur.sqrt());
        last_improvement = if prev > 0.0 { (prev - cur) / prev } else { 0.0 };
        debug!("k = {}, iteration {}: residual {:.6e}", k, iter, cur.sqrt());

        if last_improvement < cfg.tolerance {
            status = Some(Convergence::Converged { iterations: iter });
            break;
        }
    }

    let status = status.unwrap_or_else(|| {
        warn!(
            "k = {}: no convergence after {} iterations, last relative improvement {:.3e}",
            k, cfg.max_iter, last_improvement
        );
        Convergence::MaxIterations {
            iterations: cfg.max_iter,
            last_improvement,
        }
    });

    Ok(ArchetypeLevel {
        k,
        archetypes: z,
        landmarks: c,
        membership: h,
        residuals,
        total_ss,
        status,
    })
}

fn total(errors: &[f64]) -> f64 {
    errors.iter().sum()
}

fn cell_error(x: ArrayView1<f64>, h: ArrayView1<f64>, z: &Array2<f64>) -> f64 {
    let recon = h.dot(z);
    x.iter().zip(recon.iter()).map(|(a, b)| (a - b) * (a - b)).sum()
}

fn cell_errors(x: &ArrayView2<f64>, h: &Array2<f64>, z: &Array2<f64>) -> Vec<f64> {
    (0..x.nrows())
        .into_par_iter()
        .map(|i| cell_error(x.row(i), h.row(i), z))
        .collect()
}

/// Update every membership row against fixed archetypes `z`. A row is only replaced when its
/// squared error in `errors` does not grow.
fn h_step(x: &ArrayView2<f64>, z: &Array2<f64>, h: &mut Array2<f64>, errors: &mut [f64], inner_iter: usize) {
    let gram = z.dot(&z.t());
    let lipschitz = max_eigenvalue(&gram);
    let zx = x.dot(&z.t());

    h.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(errors.par_iter_mut())
        .enumerate()
        .for_each(|(i, (mut row, err))| {
            let mut candidate = row.to_owned();
            simplex_lsq(&gram.view(), &zx.row(i), &mut candidate, lipschitz, inner_iter);
            let e = cell_error(x.row(i), candidate.view(), z);
            if e <= *err {
                row.assign(&candidate);
                *err = e;
            }
        });
}

/// Accelerated projected gradient steps on the landmarks `c` for fixed memberships `h`. A step
/// is accepted only if the total error does not grow. A rejected step first drops the
/// momentum, then is halved up to `MAX_BACKTRACK` times.
fn c_step(
    x: &ArrayView2<f64>,
    h: &Array2<f64>,
    c: &mut Array2<f64>,
    z: &mut Array2<f64>,
    errors: &mut Vec<f64>,
    x_lambda: f64,
    inner_iter: usize,
) {
    let lipschitz = max_eigenvalue(&h.t().dot(h)) * x_lambda;
    if lipschitz <= 0.0 || !lipschitz.is_finite() {
        return;
    }

    let mut y = c.clone();
    let mut t: f64 = 1.0;
    for _ in 0..inner_iter {
        let current = total(errors);
        let resid = h.dot(&y.dot(x)) - x;
        let grad = h.t().dot(&resid).dot(&x.t());

        let mut step = 1.0 / lipschitz;
        let mut accepted = false;
        for _ in 0..=MAX_BACKTRACK {
            let mut candidate = &y - &(&grad * step);
            candidate
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .for_each(|mut row| project_simplex(&mut row));

            let candidate_z = candidate.dot(x);
            let candidate_errors = cell_errors(x, h, &candidate_z);
            if total(&candidate_errors) <= current {
                let t_next = (1.0 + (1.0 + 4.0 * t * t).sqrt()) / 2.0;
                y = &candidate + &((&candidate - &*c) * ((t - 1.0) / t_next));
                t = t_next;
                *c = candidate;
                *z = candidate_z;
                *errors = candidate_errors;
                accepted = true;
                break;
            }
            if t > 1.0 {
                break;
            }
            step *= 0.5;
        }

        if !accepted {
            if t > 1.0 {
                y.assign(&*c);
                t = 1.0;
                continue;
            }
            break;
        }
    }
}
