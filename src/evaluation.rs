//! Hold-out evaluation of the forecaster against a constant-median baseline.

use crate::config::ForecastConfig;
use crate::error::{ForecastError, Result};
use crate::forecaster::AutoregressiveForecaster;
use crate::frame::{DailyFrame, DailySeries};
use crate::utils::median;
use chrono::NaiveDate;
use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub rmse: f64,
    /// Absolute difference between the predicted and the actual total.
    pub sum_score: f64,
}

impl Score {
    fn of(actual: &DailySeries, predicted: impl Fn(&NaiveDate) -> f64) -> Self {
        let n = actual.len().max(1) as f64;
        let mut squared = 0.0;
        let mut actual_sum = 0.0;
        let mut predicted_sum = 0.0;

        for (date, value) in actual {
            let guess = predicted(date);
            squared += (guess - value).powi(2);
            actual_sum += value;
            predicted_sum += guess;
        }

        Self {
            rmse: (squared / n).sqrt(),
            sum_score: (actual_sum - predicted_sum).abs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub train_days: usize,
    pub test_days: usize,
    pub model: Score,
    pub baseline: Score,
}

impl BacktestReport {
    pub fn beats_baseline(&self) -> bool {
        self.model.rmse < self.baseline.rmse
    }
}

/// Fits on the rows of `frame` before `cutoff` and scores the prediction of the target column
/// over `[cutoff, end]`.
pub fn backtest(
    frame: &DailyFrame,
    config: &ForecastConfig,
    cutoff: NaiveDate,
    end: NaiveDate,
) -> Result<BacktestReport> {
    let (train, test) = frame.split_at_date(cutoff);
    let target = &config.target_column;

    let actual: DailySeries = test
        .series(target)
        .unwrap_or_default()
        .into_iter()
        .filter(|(date, _)| *date <= end)
        .collect();
    if actual.is_empty() {
        return Err(ForecastError::validation(
            "backtest",
            format!("no rows between {} and {}", cutoff, end),
        ));
    }

    let model = AutoregressiveForecaster::new(config.clone()).fit(&train)?;
    let predicted = model.predict(&train, end)?;

    let train_values = train.column(target).unwrap_or_default();
    let baseline_value = median(&train_values).unwrap_or(0.0);

    let report = BacktestReport {
        train_days: train.len(),
        test_days: actual.len(),
        model: Score::of(&actual, |d| predicted.get(d).copied().unwrap_or(0.0)),
        baseline: Score::of(&actual, |_| baseline_value),
    };
    debug!(
        "Backtest at {}: model rmse {:.2}, baseline rmse {:.2}",
        cutoff, report.model.rmse, report.baseline.rmse
    );
    Ok(report)
}
