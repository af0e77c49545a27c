// SPDX-License-Identifier: GPL-2.0
//
// geepafs: GPU Energy-Efficient and Performance-Assured Frequency Scaling
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Regression engine (§4.5): OLS line fit, constrained fold-line fit, and
//! model selection between a flat single line and every valid knee
//! position.

/// Result of an ordinary-least-squares fit: `y = slope*x + intercept`, plus
/// the residual sum of squares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
    pub sse: f64,
}

/// Classical OLS (dvfs.c `linearRegression`). `x` and `y` must be the same
/// length and non-degenerate (not all-equal `x`).
pub fn ols(x: &[f64], y: &[f64]) -> LineFit {
    let n = x.len() as f64;
    let sum_x: f64 = x.iter().sum();
    let sum_y: f64 = y.iter().sum();
    let sum_xx: f64 = x.iter().map(|v| v * v).sum();
    let sum_xy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
    let sum_yy: f64 = y.iter().map(|v| v * v).sum();

    let div = n * sum_xx - sum_x * sum_x;
    let slope = (n * sum_xy - sum_x * sum_y) / div;
    let intercept = (sum_y * sum_xx - sum_x * sum_xy) / div;
    let sse = sum_yy + slope * slope * sum_xx + n * intercept * intercept
        - 2.0 * slope * sum_xy
        - 2.0 * intercept * sum_y
        + 2.0 * slope * intercept * sum_x;
    LineFit { slope, intercept, sse }
}

/// A two-segment fold-line fit: `(a1, b1)` on the low-frequency segment,
/// `(a2, b2)` on the high-frequency segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FoldFit {
    pub a1: f64,
    pub b1: f64,
    pub a2: f64,
    pub b2: f64,
    pub sse: f64,
}

/// Sentinel SSE used when a constrained fold-line's 3x3 system is singular
/// (dvfs.c `foldlineRegression`, `H == 0` branch) — large enough that the
/// candidate is never selected by the minimum-SSE search.
const SINGULAR_SSE: f64 = 1e12;

/// Constrained fold-line fit with the knee forced to `x = xc` (dvfs.c
/// `foldlineRegression`). Solves the 3x3 system in `(a1, a2, b1)` via
/// Cramer's rule with `b2 = xc*(a1-a2)+b1`; returns the singular sentinel
/// if the system's determinant is 0.
pub fn fold_constrained(xc: f64, x1: &[f64], y1: &[f64], x2: &[f64], y2: &[f64]) -> FoldFit {
    let n2 = x2.len() as f64;
    let n = (x1.len() + x2.len()) as f64;

    let sum1_x: f64 = x1.iter().sum();
    let sum1_y: f64 = y1.iter().sum();
    let sum1_xx: f64 = x1.iter().map(|v| v * v).sum();
    let sum1_xy: f64 = x1.iter().zip(y1).map(|(a, b)| a * b).sum();
    let sum2_x: f64 = x2.iter().sum();
    let sum2_y: f64 = y2.iter().sum();
    let sum2_xx: f64 = x2.iter().map(|v| v * v).sum();
    let sum2_xy: f64 = x2.iter().zip(y2).map(|(a, b)| a * b).sum();

    let c11 = sum1_xx + n2 * xc * xc;
    let c12 = xc * sum2_x - n2 * xc * xc;
    let c13 = sum1_x + xc * n2;
    let c14 = -sum1_xy - sum2_y * xc;
    let c21 = xc * sum2_x - n2 * xc * xc;
    let c22 = sum2_xx - 2.0 * xc * sum2_x + n2 * xc * xc;
    let c23 = sum2_x - n2 * xc;
    let c24 = -sum2_xy + xc * sum2_y;
    let c31 = sum1_x + n2 * xc;
    let c32 = sum2_x - n2 * xc;
    let c33 = n;
    let c34 = -sum1_y - sum2_y;

    let det = c11 * c22 * c33 + c12 * c23 * c31 + c21 * c32 * c13
        - c13 * c22 * c31
        - c12 * c21 * c33
        - c11 * c23 * c32;

    if det == 0.0 {
        return FoldFit {
            a1: -1.0,
            b1: -2.0,
            a2: -3.0,
            b2: -4.0,
            sse: SINGULAR_SSE,
        };
    }

    let a1 = -(c14 * c22 * c33 + c12 * c23 * c34 + c13 * c24 * c32
        - c13 * c22 * c34
        - c12 * c24 * c33
        - c23 * c32 * c14)
        / det;
    let a2 = -(c11 * c24 * c33 + c21 * c34 * c13 + c14 * c23 * c31
        - c13 * c31 * c24
        - c11 * c23 * c34
        - c33 * c14 * c21)
        / det;
    let b1 = -(c11 * c22 * c34 + c21 * c32 * c14 + c12 * c24 * c31
        - c22 * c14 * c31
        - c12 * c21 * c34
        - c11 * c32 * c24)
        / det;
    let b2 = xc * (a1 - a2) + b1;

    let sse: f64 = x1
        .iter()
        .zip(y1)
        .map(|(&x, &y)| (a1 * x + b1 - y).powi(2))
        .sum::<f64>()
        + x2
            .iter()
            .zip(y2)
            .map(|(&x, &y)| (a2 * x + b2 - y).powi(2))
            .sum::<f64>();

    FoldFit { a1, b1, a2, b2, sse }
}

/// A candidate model for the mem-bandwidth-vs-frequency response.
#[derive(Debug, Clone, PartialEq)]
pub enum Model {
    /// A single line fits the whole probe range best (`turn_opt = 0`).
    Single(LineFit),
    /// A fold-line with its knee at probe index `turn`.
    Fold { turn: usize, fit: FoldFit },
}

impl Model {
    pub fn sse(&self) -> f64 {
        match self {
            Model::Single(f) => f.sse,
            Model::Fold { fit, .. } => fit.sse,
        }
    }
}

/// Model selection (§4.5): enumerate every valid knee `turn in [2, k-2]`,
/// discard candidates with `a1 <= a2` (a memory-bound plateau must not
/// slope up faster than the compute region), and pick the minimum-SSE
/// model among the survivors plus the single-line fit.
///
/// `probe` is the ascending probe-frequency list (`P`, length `k`);
/// `by_probe_index[j]` holds every `(x, y)` sample recorded at probe index
/// `j` across all repetitions, in burst order.
pub fn select_model(probe: &[f64], by_probe_index: &[Vec<f64>]) -> Model {
    let k = probe.len();
    let x: Vec<f64> = by_probe_index
        .iter()
        .enumerate()
        .flat_map(|(j, ys)| ys.iter().map(move |_| probe[j]))
        .collect();
    let y: Vec<f64> = by_probe_index.iter().flat_map(|ys| ys.iter().copied()).collect();

    let single = ols(&x, &y);
    let mut best = Model::Single(single);

    if k >= 4 {
        for turn in 2..=(k - 2) {
            let mut x1 = Vec::new();
            let mut y1 = Vec::new();
            let mut x2 = Vec::new();
            let mut y2 = Vec::new();
            for j in 0..k {
                for &val in &by_probe_index[j] {
                    if j < turn {
                        x1.push(probe[j]);
                        y1.push(val);
                    } else {
                        x2.push(probe[j]);
                        y2.push(val);
                    }
                }
            }
            let fit1 = ols(&x1, &y1);
            let fit2 = ols(&x2, &y2);

            let fold = if fit1.slope != fit2.slope {
                let f_cross = (fit1.intercept - fit2.intercept) / (fit2.slope - fit1.slope);
                if f_cross >= probe[turn - 1] && f_cross <= probe[turn] {
                    FoldFit {
                        a1: fit1.slope,
                        b1: fit1.intercept,
                        a2: fit2.slope,
                        b2: fit2.intercept,
                        sse: fit1.sse + fit2.sse,
                    }
                } else {
                    fold_constrained(probe[turn - 1], &x1, &y1, &x2, &y2)
                }
            } else {
                fold_constrained(probe[turn - 1], &x1, &y1, &x2, &y2)
            };

            if fold.a1 <= fold.a2 {
                continue; // theoretically impossible partition, abandon it.
            }
            if fold.sse < best.sse() {
                best = Model::Fold { turn, fit: fold };
            }
        }
    }

    best
}

/// Discard condition (§4.5): if the selected model's SSE exceeds
/// `reg_err_threshold * k * r`, it is not trustworthy.
pub fn should_skip(model: &Model, reg_err_threshold: f64, num_samples: usize) -> bool {
    model.sse() > reg_err_threshold * num_samples as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ols_recovers_exact_line() {
        let x: Vec<f64> = vec![952.0, 1147.0, 1335.0, 1530.0];
        let y: Vec<f64> = x.iter().map(|&v| 2.0 * v + 3.0).collect();
        let fit = ols(&x, &y);
        assert!((fit.slope - 2.0).abs() < 1e-9);
        assert!((fit.intercept - 3.0).abs() < 1e-9);
        assert!(fit.sse.abs() < 1e-6);
    }

    #[test]
    fn fold_line_recovers_knee() {
        // memory-bound rising segment to probe[1], then flat: classic
        // roofline shape with knee at probe index 2.
        let probe = vec![952.0, 1147.0, 1335.0, 1530.0];
        let by_probe_index = vec![
            vec![10.0, 10.0],
            vec![60.0, 60.0],
            vec![80.0, 80.0],
            vec![80.0, 80.0],
        ];
        let model = select_model(&probe, &by_probe_index);
        match model {
            Model::Fold { turn, fit } => {
                assert_eq!(turn, 2);
                assert!(fit.a1 > fit.a2);
                assert!(fit.sse < 1e-6);
            }
            Model::Single(_) => panic!("expected a fold-line model"),
        }
    }

    #[test]
    fn flat_response_prefers_single_line() {
        let probe = vec![952.0, 1147.0, 1335.0, 1530.0];
        let by_probe_index = vec![
            vec![50.0, 50.0],
            vec![50.0, 50.0],
            vec![50.0, 50.0],
            vec![50.0, 50.0],
        ];
        let model = select_model(&probe, &by_probe_index);
        assert!(matches!(model, Model::Single(_)));
        assert!(model.sse() < 1e-6);
    }

    #[test]
    fn noisy_response_triggers_skip_model() {
        let probe = vec![952.0, 1147.0, 1335.0, 1530.0];
        let by_probe_index = vec![
            vec![10.0, 90.0],
            vec![80.0, 5.0],
            vec![15.0, 85.0],
            vec![90.0, 10.0],
        ];
        let model = select_model(&probe, &by_probe_index);
        assert!(should_skip(&model, 100.0, 8));
    }
}
