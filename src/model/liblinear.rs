//! Dual coordinate descent solvers for the per-node linear problems, ported
//! from liblinear with ffi-related overhead removed. Both solvers work
//! directly on borrowed sparse rows and accept a per-instance cost so that
//! class and instance weighting collapse into one slice.

use crate::{Index, Weight};
use itertools::Itertools;
use ndarray::Array1;
use rand::prelude::*;

pub(crate) type DenseVec = Array1<Weight>;
pub(crate) type FeatureRow<'a> = &'a [(Index, Weight)];

fn row_dot_self(row: FeatureRow) -> Weight {
    row.iter().map(|&(_, v)| v * v).sum()
}

fn row_dot_dense(row: FeatureRow, w: &DenseVec) -> Weight {
    row.iter().map(|&(i, v)| w[i as usize] * v).sum()
}

fn dense_add_assign_row_mul_scalar(w: &mut DenseVec, row: FeatureRow, scalar: Weight) {
    for &(i, v) in row {
        w[i as usize] += v * scalar;
    }
}

/// A coordinate descent solver for L2-loss SVM dual problems.
///
///  min_a  0.5(a^T (Q + D)a) - e^T a,  s.t. 0 <= a_i,
///
/// where Qij = yi yj xi^T xj and D_ii = 1/(2 C_i).
///
/// See Algorithm 3 of Hsieh et al., ICML 2008.
#[allow(clippy::many_single_char_names)]
pub(crate) fn solve_l2r_l2_svc(
    w_size: usize,
    rows: &[FeatureRow],
    y: &[bool],
    costs: &[Weight],
    eps: Weight,
    max_iter: u32,
) -> DenseVec {
    assert_eq!(rows.len(), y.len());
    assert_eq!(rows.len(), costs.len());

    let l = rows.len();
    let mut w = DenseVec::zeros(w_size);

    let mut active_size = l;

    // PG: projected gradient, for shrinking and stopping
    let mut pg: Weight;
    let mut pgmax_old = Weight::INFINITY;
    let mut pgmax_new: Weight;
    let mut pgmin_new: Weight;

    let diag = costs.iter().map(|&c| 0.5 / c).collect_vec();

    // Note that 0 <= alpha[i]; the upper bound is folded into D
    let mut alpha = vec![0.0; l];

    let mut index = (0..l).collect_vec();
    let qd = rows
        .iter()
        .zip(&diag)
        .map(|(&xi, d)| d + row_dot_self(xi))
        .collect_vec();

    let mut iter = 0;
    let mut rng = thread_rng();
    while iter < max_iter {
        pgmax_new = Weight::NEG_INFINITY;
        pgmin_new = Weight::INFINITY;

        index.shuffle(&mut rng);

        let mut s = 0;
        while s < active_size {
            let i = index[s];
            let yi_sign = if y[i] { 1.0 } else { -1.0 };
            let xi = rows[i];
            let alpha_i = &mut alpha[i];

            let g = yi_sign * row_dot_dense(xi, &w) - 1.0 + *alpha_i * diag[i];

            pg = 0.0;
            if *alpha_i == 0.0 {
                if g > pgmax_old {
                    active_size -= 1;
                    index.swap(s, active_size);
                    continue;
                } else if g < 0.0 {
                    pg = g;
                }
            } else {
                pg = g;
            }

            pgmax_new = pgmax_new.max(pg);
            pgmin_new = pgmin_new.min(pg);

            if pg.abs() > 1e-12 {
                let alpha_old = *alpha_i;
                *alpha_i = (*alpha_i - g / qd[i]).max(0.0);
                let d = (*alpha_i - alpha_old) * yi_sign;
                dense_add_assign_row_mul_scalar(&mut w, xi, d);
            }

            s += 1;
        }

        iter += 1;

        if pgmax_new - pgmin_new <= eps {
            if active_size == l {
                break;
            } else {
                active_size = l;
                pgmax_old = Weight::INFINITY;
                continue;
            }
        }
        pgmax_old = pgmax_new;
        if pgmax_old <= 0.0 {
            pgmax_old = Weight::INFINITY;
        }
    }

    w
}

/// A coordinate descent solver for the dual of L2-regularized logistic
/// regression problems.
///
///  min_a  0.5(a^T Q a) + sum a_i log(a_i) + (C_i - a_i) log(C_i - a_i),
///    s.t. 0 <= a_i <= C_i,
///
/// where Qij = yi yj xi^T xj.
///
/// See Algorithm 5 of Yu et al., MLJ 2010.
#[allow(clippy::many_single_char_names)]
pub(crate) fn solve_l2r_lr_dual(
    w_size: usize,
    rows: &[FeatureRow],
    y: &[bool],
    costs: &[Weight],
    eps: Weight,
    max_iter: u32,
) -> DenseVec {
    assert_eq!(rows.len(), y.len());
    assert_eq!(rows.len(), costs.len());

    let l = rows.len();

    let max_inner_iter = 100; // for inner Newton
    let mut innereps = 1e-2;
    let innereps_min = eps.min(1e-8);

    // store alpha and C - alpha, where 0 < alpha[i] < C_i and
    // alpha[2*i] + alpha[2*i+1] = C_i
    let mut alpha = costs
        .iter()
        .flat_map(|&c| {
            let alpha = (0.001 * c).min(1e-8);
            vec![alpha, c - alpha]
        })
        .collect_vec();

    let xtx = rows.iter().map(|&xi| row_dot_self(xi)).collect_vec();

    let mut w = DenseVec::zeros(w_size);
    for (i, (&xi, &yi)) in rows.iter().zip(y).enumerate() {
        let yi_sign = if yi { 1.0 } else { -1.0 };
        dense_add_assign_row_mul_scalar(&mut w, xi, yi_sign * alpha[2 * i]);
    }

    let mut index = (0..l).collect_vec();

    let mut iter = 0;
    let mut rng = thread_rng();
    while iter < max_iter {
        index.shuffle(&mut rng);
        let mut newton_iter = 0;
        let mut gmax: Weight = 0.0;
        for &i in &index {
            let yi_sign = if y[i] { 1.0 } else { -1.0 };
            let c = costs[i];
            let xi = rows[i];
            let a = xtx[i];
            let b = yi_sign * row_dot_dense(xi, &w);

            // Decide to minimize g_1(z) or g_2(z)
            let (ind1, ind2, sign) = if 0.5 * a * (alpha[2 * i + 1] - alpha[2 * i]) + b < 0.0 {
                (2 * i + 1, 2 * i, -1.0)
            } else {
                (2 * i, 2 * i + 1, 1.0)
            };

            //  g_t(z) = z*log(z) + (C-z)*log(C-z) + 0.5a(z-alpha_old)^2 + sign*b(z-alpha_old)
            let alpha_old = alpha[ind1];
            let mut z = if c - alpha_old < 0.5 * c {
                0.1 * alpha_old
            } else {
                alpha_old
            };
            let mut gp = a * (z - alpha_old) + sign * b + (z / (c - z)).ln();
            gmax = gmax.max(gp.abs());

            // Newton method on the sub-problem
            let eta = 0.1; // xi in the paper
            let mut inner_iter = 0;
            while inner_iter <= max_inner_iter {
                if gp.abs() < innereps {
                    break;
                }
                let gpp = a + c / (c - z) / z;
                let tmpz = z - gp / gpp;
                if tmpz <= 0.0 {
                    z *= eta;
                } else {
                    // tmpz in (0, C)
                    z = tmpz;
                }
                gp = a * (z - alpha_old) + sign * b + (z / (c - z)).ln();
                newton_iter += 1;
                inner_iter += 1;
            }

            if inner_iter > 0 {
                // update w
                alpha[ind1] = z;
                alpha[ind2] = c - z;
                dense_add_assign_row_mul_scalar(&mut w, xi, sign * (z - alpha_old) * yi_sign);
            }
        }

        iter += 1;

        if gmax < eps {
            break;
        }

        if newton_iter <= l / 10 {
            innereps = innereps_min.max(0.1 * innereps);
        }
    }

    w
}

#[cfg(test)]
mod tests {
    use super::*;

    // positives sit at x > 0 along feature 2, negatives at x < 0; bias at 1
    fn toy_problem() -> (Vec<Vec<(Index, Weight)>>, Vec<bool>) {
        let mut rows = Vec::new();
        let mut y = Vec::new();
        for i in 0..20 {
            let positive = i % 2 == 0;
            let sign = if positive { 1.0 } else { -1.0 };
            rows.push(vec![(1, 1.0), (2, sign * (1.0 + 0.05 * (i % 5) as Weight))]);
            y.push(positive);
        }
        (rows, y)
    }

    #[test]
    fn test_svc_separates_toy_problem() {
        let (rows, y) = toy_problem();
        let row_refs = rows.iter().map(|r| r.as_slice()).collect_vec();
        let costs = vec![1.0; y.len()];
        let w = solve_l2r_l2_svc(3, &row_refs, &y, &costs, 0.01, 100);
        for (row, &yi) in row_refs.iter().zip(&y) {
            let pred = row_dot_dense(row, &w);
            assert_eq!(yi, pred > 0.0, "misclassified row {:?}", row);
        }
    }

    #[test]
    fn test_lr_dual_separates_toy_problem() {
        let (rows, y) = toy_problem();
        let row_refs = rows.iter().map(|r| r.as_slice()).collect_vec();
        let costs = vec![1.0; y.len()];
        let w = solve_l2r_lr_dual(3, &row_refs, &y, &costs, 0.01, 100);
        for (row, &yi) in row_refs.iter().zip(&y) {
            let pred = row_dot_dense(row, &w);
            assert_eq!(yi, pred > 0.0, "misclassified row {:?}", row);
        }
    }

    #[test]
    fn test_higher_cost_tightens_fit() {
        let (rows, y) = toy_problem();
        let row_refs = rows.iter().map(|r| r.as_slice()).collect_vec();
        let low = solve_l2r_l2_svc(3, &row_refs, &y, &vec![0.01; y.len()], 0.001, 200);
        let high = solve_l2r_l2_svc(3, &row_refs, &y, &vec![100.0; y.len()], 0.001, 200);
        assert!(low[2].abs() < high[2].abs());
    }
}
