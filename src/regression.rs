//! Ordinary least squares over a dense feature matrix.

use crate::error::{ForecastError, Result};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Relative ridge added to the normal equations. Keeps constant columns (a single calendar year,
/// a month that never changes in a short history) from making the system singular.
const RIDGE: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub feature_names: Vec<String>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl LinearModel {
    /// Fits `targets ≈ rows · coefficients + intercept`. Every row must have one value per name.
    pub fn fit(feature_names: Vec<String>, rows: &[Vec<f64>], targets: &[f64]) -> Result<Self> {
        let n_features = feature_names.len();
        if rows.is_empty() || rows.len() != targets.len() {
            return Err(ForecastError::validation(
                "linear model",
                format!("{} rows for {} targets", rows.len(), targets.len()),
            ));
        }

        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        let x = Array2::from_shape_vec((rows.len(), n_features), flat)
            .map_err(|e| ForecastError::validation("linear model", e.to_string()))?;
        let y = Array1::from(targets.to_vec());

        let x_mean = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(n_features));
        let y_mean = y.mean().unwrap_or(0.0);

        let xc = &x - &x_mean;
        let yc = &y - y_mean;

        let mut gram = xc.t().dot(&xc);
        let trace: f64 = gram.diag().sum();
        let ridge = RIDGE * (trace / n_features.max(1) as f64).max(1.0);
        for i in 0..n_features {
            gram[[i, i]] += ridge;
        }
        let moment = xc.t().dot(&yc);

        let coefficients = solve(gram, moment)?;
        let intercept = y_mean - coefficients.dot(&x_mean);

        Ok(Self {
            feature_names,
            coefficients: coefficients.to_vec(),
            intercept,
        })
    }

    pub fn predict(&self, features: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(features)
                .map(|(c, x)| c * x)
                .sum::<f64>()
    }
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Result<Array1<f64>> {
    let n = b.len();

    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))
            .unwrap_or(col);

        if a[[pivot, col]].abs() < f64::MIN_POSITIVE {
            return Err(ForecastError::validation(
                "linear model",
                "normal equations are singular",
            ));
        }

        if pivot != col {
            for k in 0..n {
                a.swap([col, k], [pivot, k]);
            }
            b.swap(col, pivot);
        }

        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = Array1::zeros(n);
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[[row, k]] * x[k]).sum();
        x[row] = (b[row] - tail) / a[[row, row]];
    }
    Ok(x)
}
