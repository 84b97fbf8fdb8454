use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::cmp::Ordering;

/// Feature difference with the minimum-image convention when `period != 0`.
#[inline]
pub fn periodic_delta(delta: f64, period: f64) -> f64 {
    if period != 0.0 {
        delta - (delta / period).round_ties_even() * period
    } else {
        delta
    }
}

/// Squared feature differences between `row` and `column`, after periodic
/// correction, written into `out`.
#[inline]
pub(crate) fn squared_differences(
    row: ArrayView1<'_, f64>,
    column: ArrayView1<'_, f64>,
    periods: Option<ArrayView1<'_, f64>>,
    out: &mut [f64],
) {
    for f in 0..row.len() {
        let mut delta = row[f] - column[f];
        if let Some(p) = periods {
            delta = periodic_delta(delta, p[f]);
        }
        out[f] = delta * delta;
    }
}

/// `d[p, q] = Σ_f (w_f δ_pqf)²` between every row point and column point.
pub fn weighted_dist2_matrix(
    params: ArrayView1<'_, f64>,
    rows: ArrayView2<'_, f64>,
    columns: ArrayView2<'_, f64>,
    periods: Option<ArrayView1<'_, f64>>,
) -> Array2<f64> {
    let n_features = rows.ncols();
    let w2: Vec<f64> = params.iter().map(|w| w * w).collect();
    let mut dist2 = Array2::<f64>::zeros((rows.nrows(), columns.nrows()));
    dist2
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each_init(
            || vec![0.0; n_features],
            |sq, (p, mut line)| {
                for (q, value) in line.iter_mut().enumerate() {
                    squared_differences(rows.row(p), columns.row(q), periods, sq);
                    *value = sq.iter().zip(&w2).map(|(s, w)| s * w).sum();
                }
            },
        );
    dist2
}

/// Distance ranks of every column as seen from each row, in the unweighted
/// target space.
///
/// `rank[p, q]` counts the columns strictly closer to row `p` than `q`, with
/// ties broken by column order. When `self_columns[p]` names the column of
/// the row point itself, that column always ranks 0. `offset` is added to
/// every rank.
pub fn rank_matrix(
    rows: ArrayView2<'_, f64>,
    columns: ArrayView2<'_, f64>,
    periods: Option<ArrayView1<'_, f64>>,
    self_columns: Option<&[usize]>,
    offset: usize,
) -> Array2<f64> {
    let ones = Array1::<f64>::ones(rows.ncols());
    let dist2 = weighted_dist2_matrix(ones.view(), rows, columns, periods);
    let n_cols = columns.nrows();
    let mut ranks = Array2::<f64>::zeros(dist2.dim());
    ranks
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(p, mut rank_row)| {
            let own = self_columns.map(|cols| cols[p]);
            let d = dist2.row(p);
            let mut order: Vec<usize> = (0..n_cols).collect();
            order.sort_by(|&a, &b| {
                d[a].total_cmp(&d[b])
                    .then_with(|| match (Some(a) == own, Some(b) == own) {
                        (true, false) => Ordering::Less,
                        (false, true) => Ordering::Greater,
                        _ => Ordering::Equal,
                    })
                    .then(a.cmp(&b))
            });
            for (rank, &q) in order.iter().enumerate() {
                rank_row[q] = (rank + offset) as f64;
            }
        });
    ranks
}
