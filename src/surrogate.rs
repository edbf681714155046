// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Local linear surrogate models
//!
//! Provides:
//! - Cosine distance of perturbation vectors to the all-active baseline
//! - Exponential proximity kernel
//! - Weighted least squares with intercept
//! - Coefficient ranking

use crate::error::{LimeError, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Kernel width used for proximity weighting of perturbations
pub const DEFAULT_KERNEL_WIDTH: f64 = 0.25;

/// Cosine distance `1 - x.y / (|x| |y|)`; a zero vector is at distance 1
/// from everything.
pub fn cosine_distance(x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
    let norm_x = x.dot(&x).sqrt();
    let norm_y = y.dot(&y).sqrt();
    if norm_x == 0.0 || norm_y == 0.0 {
        return 1.0;
    }
    let similarity = x.dot(&y) / (norm_x * norm_y);
    (1.0 - similarity).max(0.0)
}

/// Distance of every row of `perturbations` to the all-active perturbation
pub fn distances_to_baseline(perturbations: ArrayView2<f64>) -> Array1<f64> {
    let baseline = Array1::ones(perturbations.ncols());
    perturbations
        .axis_iter(Axis(0))
        .map(|row| cosine_distance(row, baseline.view()))
        .collect()
}

/// `sqrt(exp(-d^2 / width^2))` for each distance
pub fn kernel_weights(distances: ArrayView1<f64>, kernel_width: f64) -> Array1<f64> {
    let width_sq = kernel_width * kernel_width;
    distances.mapv(|d| (-(d * d) / width_sq).exp().sqrt())
}

/// Indices of the `k` largest coefficients, ordered by ascending coefficient.
///
/// Ties keep their original index order.
pub fn top_features(coefficients: ArrayView1<f64>, k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..coefficients.len()).collect();
    order.sort_by(|&a, &b| {
        coefficients[a]
            .partial_cmp(&coefficients[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let k = k.min(order.len());
    order.split_off(order.len() - k)
}

/// Ordinary least squares with intercept and per-sample weights
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeightedLinearRegression {
    coefficients: Array1<f64>,
    intercept: f64,
    is_fitted: bool,
}

impl WeightedLinearRegression {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fit the model to weighted samples
    pub fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>, weights: ArrayView1<f64>) -> Result<&mut Self> {
        let n_samples = x.nrows();
        let n_features = x.ncols();

        if n_samples == 0 {
            return Err(LimeError::InvalidInput("cannot fit a surrogate on zero samples".to_string()));
        }
        if y.len() != n_samples {
            return Err(LimeError::shape_mismatch(&[n_samples], &[y.len()]));
        }
        if weights.len() != n_samples {
            return Err(LimeError::shape_mismatch(&[n_samples], &[weights.len()]));
        }
        if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(LimeError::InvalidInput("sample weights must be finite and non-negative".to_string()));
        }

        let weight_sum = weights.sum();
        let (x_mean, y_mean) = if weight_sum > 0.0 {
            let x_mean = x.t().dot(&weights) / weight_sum;
            let y_mean = y.dot(&weights) / weight_sum;
            (x_mean, y_mean)
        } else {
            (Array1::zeros(n_features), 0.0)
        };

        // Rows scaled by sqrt(w) after weighted centring
        let sqrt_w = weights.mapv(f64::sqrt).insert_axis(Axis(1));
        let x_centered = (&x - &x_mean.view().insert_axis(Axis(0))) * &sqrt_w;
        let y_centered = (&y - y_mean) * &sqrt_w.index_axis(Axis(1), 0);

        let xtx = x_centered.t().dot(&x_centered);
        let xty = x_centered.t().dot(&y_centered);

        let coefficients = solve_normal_equations(&xtx, &xty);

        self.intercept = y_mean - coefficients.dot(&x_mean);
        self.coefficients = coefficients;
        self.is_fitted = true;

        Ok(self)
    }

    pub fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.coefficients.view()
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    /// Make predictions
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>> {
        if !self.is_fitted {
            return Err(LimeError::InvalidInput("surrogate model is not fitted".to_string()));
        }
        if x.ncols() != self.coefficients.len() {
            return Err(LimeError::shape_mismatch(&[self.coefficients.len()], &[x.ncols()]));
        }
        Ok(x.dot(&self.coefficients) + self.intercept)
    }

    /// Weighted coefficient of determination (R^2)
    pub fn score(&self, x: ArrayView2<f64>, y: ArrayView1<f64>, weights: ArrayView1<f64>) -> Result<f64> {
        let predictions = self.predict(x)?;
        let weight_sum = weights.sum();
        if weight_sum <= 0.0 {
            return Ok(0.0);
        }
        let y_mean = y.dot(&weights) / weight_sum;

        let mut ss_res = 0.0;
        let mut ss_tot = 0.0;
        for ((&yi, &pi), &wi) in y.iter().zip(predictions.iter()).zip(weights.iter()) {
            ss_res += wi * (yi - pi).powi(2);
            ss_tot += wi * (yi - y_mean).powi(2);
        }

        if ss_tot == 0.0 {
            return Ok(if ss_res < 1e-12 { 1.0 } else { 0.0 });
        }
        Ok(1.0 - ss_res / ss_tot)
    }
}

/// Solve `A x = b` for symmetric positive semi-definite `A`.
///
/// Rank-deficient systems get a vanishing ridge term, which converges to the
/// minimum-norm least-squares solution. An all-zero system yields zeros.
fn solve_normal_equations(a: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = a.nrows();
    if let Some(x) = cholesky_solve(a, b) {
        return x;
    }

    let mean_diag = a.diag().iter().map(|v| v.abs()).sum::<f64>() / n.max(1) as f64;
    if mean_diag == 0.0 {
        return Array1::zeros(n);
    }

    let mut ridge = 1e-8 * mean_diag;
    for _ in 0..6 {
        let mut a_reg = a.clone();
        for k in 0..n {
            a_reg[[k, k]] += ridge;
        }
        if let Some(x) = cholesky_solve(&a_reg, b) {
            return x;
        }
        ridge *= 100.0;
    }

    tracing::warn!("Surrogate normal equations could not be solved; using zero coefficients");
    Array1::zeros(n)
}

/// Cholesky decomposition `A = L L^T` followed by two triangular solves.
///
/// Returns `None` when a pivot is not clearly positive.
fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return None;
    }
    let max_diag = a.diag().iter().fold(0.0f64, |m, v| m.max(v.abs()));
    let tolerance = 1e-12 * max_diag.max(f64::MIN_POSITIVE);

    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for k in 0..j {
                sum += l[[i, k]] * l[[j, k]];
            }

            if i == j {
                let diag = a[[i, i]] - sum;
                if diag <= tolerance {
                    return None;
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }

    // Forward substitution: L * y = b
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = 0.0;
        for j in 0..i {
            sum += l[[i, j]] * y[j];
        }
        y[i] = (b[i] - sum) / l[[i, i]];
    }

    // Backward substitution: L^T * x = y
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = 0.0;
        for j in (i + 1)..n {
            sum += l[[j, i]] * x[j];
        }
        x[i] = (y[i] - sum) / l[[i, i]];
    }

    Some(x)
}
