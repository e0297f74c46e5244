//! Calendar, lag and rolling-mean features over a [`DailyFrame`].
//!
//! Every feature of day `t` reads rows strictly before `t`, so the same builder serves training
//! (rows already in the frame) and prediction (the day about to be appended).

use crate::config::FeatureRule;
use crate::error::{ForecastError, Result};
use crate::frame::DailyFrame;
use chrono::{Datelike, NaiveDate};

pub const CALENDAR_FEATURES: [&str; 4] = ["year", "month", "day", "dayofweek"];

#[derive(Debug, Clone)]
struct ResolvedRule {
    column: String,
    column_index: usize,
    lags: Vec<usize>,
    rolling_windows: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    rules: Vec<ResolvedRule>,
    required_history: usize,
}

impl FeatureBuilder {
    /// Binds `rules` to the columns of a frame. Unknown columns and zero offsets are rejected.
    pub fn new(columns: &[String], rules: &[FeatureRule]) -> Result<Self> {
        let mut resolved = Vec::with_capacity(rules.len());

        for rule in rules {
            let column_index = columns
                .iter()
                .position(|c| *c == rule.column)
                .ok_or_else(|| {
                    ForecastError::validation(
                        "feature rules",
                        format!("column '{}' is not tracked", rule.column),
                    )
                })?;

            if rule.lags.contains(&0) || rule.rolling_windows.contains(&0) {
                return Err(ForecastError::validation(
                    "feature rules",
                    format!("lags and windows of '{}' must be at least 1", rule.column),
                ));
            }

            resolved.push(ResolvedRule {
                column: rule.column.clone(),
                column_index,
                lags: rule.lags.clone(),
                rolling_windows: rule.rolling_windows.clone(),
            });
        }

        Ok(Self {
            rules: resolved,
            required_history: rules
                .iter()
                .map(FeatureRule::required_history)
                .max()
                .unwrap_or(0),
        })
    }

    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = CALENDAR_FEATURES.iter().map(|n| n.to_string()).collect();
        for rule in &self.rules {
            for lag in &rule.lags {
                names.push(format!("{}:lag:{}", rule.column, lag));
            }
            for window in &rule.rolling_windows {
                names.push(format!("{}:rm:{}", rule.column, window));
            }
        }
        names
    }

    /// Rows a day needs before it in the frame for all of its features to be defined.
    pub fn required_history(&self) -> usize {
        self.required_history
    }

    /// Features of the day at row `index` dated `date`, reading only rows `< index`.
    /// `index` may equal `frame.len()` for a day not yet appended. `None` when any lag or
    /// window reaches before the first row.
    pub fn features_at(&self, frame: &DailyFrame, index: usize, date: NaiveDate) -> Option<Vec<f64>> {
        if index > frame.len() || index < self.required_history() {
            return None;
        }

        let mut features = vec![
            date.year() as f64,
            date.month() as f64,
            date.day() as f64,
            date.weekday().num_days_from_monday() as f64,
        ];

        for rule in &self.rules {
            for &lag in &rule.lags {
                features.push(frame.value(index - lag, rule.column_index));
            }
            for &window in &rule.rolling_windows {
                let sum: f64 = (index - window..index)
                    .map(|row| frame.value(row, rule.column_index))
                    .sum();
                features.push(sum / window as f64);
            }
        }

        Some(features)
    }

    /// Complete feature rows of `frame` paired with the value of `target` on the same day.
    pub fn training_set(&self, frame: &DailyFrame, target: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
        let mut rows = Vec::new();
        let mut targets = Vec::new();

        for (index, date) in frame.dates().iter().enumerate() {
            if let Some(features) = self.features_at(frame, index, *date) {
                rows.push(features);
                targets.push(frame.value(index, target));
            }
        }

        (rows, targets)
    }
}
