use log::warn;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};

/// Relative squared norm below which the projected residual is considered exhausted
const COLLAPSE_EPS: f64 = 1e-10;

/// Select `k` extreme rows of `x` (cells x r) by successive projection.
///
/// The rows are lifted to homogeneous coordinates `[x_i, s]` so that affinely independent
/// points can be told apart. Each round takes the row with the largest residual norm and
/// projects its direction out of all rows. Once the residual is exhausted (more than `r + 1`
/// picks) the remaining rows are picked farthest-first. Ties go to the lower row index.
pub fn successive_projection(x: &ArrayView2<f64>, k: usize) -> Vec<usize> {
    let n = x.nrows();
    let k = k.min(n);

    let mean_norm = x.axis_iter(Axis(0)).map(|r| r.dot(&r).sqrt()).sum::<f64>() / n.max(1) as f64;
    let lift = if mean_norm > 0.0 { mean_norm } else { 1.0 };
    let mut residual = Array2::from_elem((n, x.ncols() + 1), lift);
    residual.slice_mut(s![.., ..x.ncols()]).assign(x);

    let mut norms: Array1<f64> = residual.map_axis(Axis(1), |r| r.dot(&r));
    let first_max = norms.iter().cloned().fold(0.0, f64::max);
    let mut picked = vec![false; n];
    let mut picks = Vec::with_capacity(k);

    while picks.len() < k {
        let Some(best) = argmax(norms.iter().copied(), &picked) else {
            break;
        };
        if norms[best] <= COLLAPSE_EPS * first_max {
            break;
        }
        picked[best] = true;
        picks.push(best);

        let u = residual.row(best).to_owned() / norms[best].sqrt();
        for (mut row, norm) in residual.axis_iter_mut(Axis(0)).zip(norms.iter_mut()) {
            let proj = row.dot(&u);
            row.scaled_add(-proj, &u);
            *norm = row.dot(&row);
        }
    }

    if picks.len() < k {
        warn!(
            "successive projection found {} of {} archetypes, picking the rest farthest-first",
            picks.len(),
            k
        );
        farthest_first(x, k, &mut picks, &mut picked);
    }
    picks
}

/// Extend `picks` to `k` rows, each time taking the row farthest from all rows picked so far.
fn farthest_first(x: &ArrayView2<f64>, k: usize, picks: &mut Vec<usize>, picked: &mut [bool]) {
    let n = x.nrows();
    let dist2 = |a: usize, b: usize| {
        x.row(a)
            .iter()
            .zip(x.row(b).iter())
            .map(|(p, q)| (p - q) * (p - q))
            .sum::<f64>()
    };

    let mut min_dist = vec![f64::INFINITY; n];
    for &p in picks.iter() {
        for (i, d) in min_dist.iter_mut().enumerate() {
            *d = d.min(dist2(i, p));
        }
    }

    while picks.len() < k {
        let Some(best) = argmax(min_dist.iter().copied(), picked) else {
            return;
        };
        picked[best] = true;
        picks.push(best);
        for (i, d) in min_dist.iter_mut().enumerate() {
            *d = d.min(dist2(i, best));
        }
    }
}

/// Index of the largest value among the unpicked entries, lowest index on ties
fn argmax(values: impl Iterator<Item = f64>, picked: &[bool]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, v) in values.enumerate() {
        if picked[i] {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => (),
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_picks_vertices() {
        let x = array![
            [0.3, 0.3],
            [0.0, 0.0],
            [0.2, 0.5],
            [4.0, 0.0],
            [0.5, 0.1],
            [0.0, 3.0],
            [1.0, 1.0],
        ];
        let mut picks = successive_projection(&x.view(), 3);
        picks.sort_unstable();
        assert_eq!(picks, vec![1, 3, 5]);
    }

    #[test]
    fn test_farthest_first_fallback() {
        // collinear points only have two affinely independent extremes
        let x = array![[0.0], [1.0], [2.0], [3.0], [10.0]];
        let picks = successive_projection(&x.view(), 4);
        assert_eq!(picks.len(), 4);
        assert_eq!(&picks[..2], &[4, 0]);

        let mut sorted = picks.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 4);
        // 3 is the farthest from {0, 10}, then 1 and 2 tie and the lower index wins
        assert_eq!(&picks[2..], &[3, 1]);
    }
}
