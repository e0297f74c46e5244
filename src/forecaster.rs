use crate::config::{FeatureRule, ForecastConfig};
use crate::error::{ForecastError, Result};
use crate::features::FeatureBuilder;
use crate::frame::{DailyFrame, DailySeries};
use crate::regression::LinearModel;
use crate::utils::next_day;
use chrono::NaiveDate;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

/// Fitted model of one tracked column together with the feature rules it was trained on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnModel {
    pub column: String,
    pub rules: Vec<FeatureRule>,
    pub model: LinearModel,
}

/// One independent linear model per tracked column of the cleaned daily frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastModel {
    pub target_column: String,
    pub tracked_columns: Vec<String>,
    pub models: Vec<ColumnModel>,
    pub clip_target: bool,
}

pub struct AutoregressiveForecaster {
    config: ForecastConfig,
}

impl AutoregressiveForecaster {
    pub fn new(config: ForecastConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    /// Fits every column of `history`. Fails with `InsufficientData` when a column has no
    /// complete feature row.
    pub fn fit(&self, history: &DailyFrame) -> Result<ForecastModel> {
        self.config.validate()?;

        let tracked_columns = history.columns().to_vec();
        if !tracked_columns.contains(&self.config.target_column) {
            return Err(ForecastError::validation(
                "forecaster",
                format!(
                    "target column '{}' is not in the history",
                    self.config.target_column
                ),
            ));
        }

        let mut models = Vec::with_capacity(tracked_columns.len());
        for (index, column) in tracked_columns.iter().enumerate() {
            let rules = self.config.rules_for(column);
            let builder = FeatureBuilder::new(&tracked_columns, &rules)?;
            let (rows, targets) = builder.training_set(history, index);

            if rows.is_empty() {
                return Err(ForecastError::InsufficientData {
                    column: column.clone(),
                    required: builder.required_history() + 1,
                    available: history.len(),
                });
            }

            debug!(
                "Fitting '{}' on {} of {} days ({} features)",
                column,
                rows.len(),
                history.len(),
                builder.feature_names().len()
            );
            let model = LinearModel::fit(builder.feature_names(), &rows, &targets)?;
            models.push(ColumnModel {
                column: column.clone(),
                rules,
                model,
            });
        }

        Ok(ForecastModel {
            target_column: self.config.target_column.clone(),
            tracked_columns,
            models,
            clip_target: self.config.clip_target,
        })
    }
}

impl ForecastModel {
    /// Predicts every tracked column for each day after the last row of `history` through `end`.
    ///
    /// Days are predicted in order. Each day's features read the history plus the days already
    /// predicted, and the new row is appended before the next day is built. The target column is
    /// clamped to `<= 0` only once the whole horizon exists, so clamping never feeds back.
    pub fn predict_full(&self, history: &DailyFrame, end: NaiveDate) -> Result<DailyFrame> {
        if history.columns() != self.tracked_columns.as_slice() {
            return Err(ForecastError::validation(
                "forecast history",
                format!(
                    "columns {:?} do not match the model's {:?}",
                    history.columns(),
                    self.tracked_columns
                ),
            ));
        }

        let last = match history.last_date() {
            Some(last) => last,
            None => {
                return Err(ForecastError::InsufficientData {
                    column: self.target_column.clone(),
                    required: 1,
                    available: 0,
                })
            }
        };

        let builders = self
            .models
            .iter()
            .map(|m| FeatureBuilder::new(&self.tracked_columns, &m.rules))
            .collect::<Result<Vec<_>>>()?;

        let mut buffer = history.clone();
        let start = buffer.len();
        let mut date = next_day(last);

        while let Some(day) = date.filter(|d| *d <= end) {
            let index = buffer.len();
            let mut values = Vec::with_capacity(self.models.len());

            for (column, builder) in self.models.iter().zip(&builders) {
                let features = builder.features_at(&buffer, index, day).ok_or_else(|| {
                    ForecastError::InsufficientData {
                        column: column.column.clone(),
                        required: builder.required_history(),
                        available: index,
                    }
                })?;
                values.push(column.model.predict(&features));
            }

            trace!("{}: {:?}", day, values);
            buffer.push_row(day, values)?;
            date = next_day(day);
        }

        let target = buffer.column_index(&self.target_column);
        let dates = buffer.dates()[start..].to_vec();
        let rows = (start..buffer.len())
            .map(|i| {
                let mut row = buffer.row(i).to_vec();
                if let (true, Some(target)) = (self.clip_target, target) {
                    row[target] = row[target].min(0.0);
                }
                row
            })
            .collect();

        debug!("Predicted {} days after {}", dates.len(), last);
        Ok(DailyFrame::from_parts(self.tracked_columns.clone(), dates, rows))
    }

    /// The target column of [`predict_full`](Self::predict_full).
    pub fn predict(&self, history: &DailyFrame, end: NaiveDate) -> Result<DailySeries> {
        let frame = self.predict_full(history, end)?;
        Ok(frame.series(&self.target_column).unwrap_or_default())
    }

    pub fn to_blob(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(blob)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TARGET_COLUMN;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn weekly_pattern(days: i64) -> DailyFrame {
        let start = ymd(2024, 1, 1);
        let series: DailySeries = (0..days)
            .map(|i| {
                let date = start + chrono::Duration::days(i);
                let amount = if i % 7 == 5 { -120.0 } else { -10.0 - (i % 3) as f64 };
                (date, amount)
            })
            .collect();
        DailyFrame::from_series(DEFAULT_TARGET_COLUMN, &series)
    }

    #[test]
    fn test_predict_zero_days_is_empty() {
        let history = weekly_pattern(60);
        let model = AutoregressiveForecaster::new(ForecastConfig::default())
            .fit(&history)
            .unwrap();

        let last = history.last_date().unwrap();
        assert!(model.predict(&history, last).unwrap().is_empty());
        assert!(model.predict(&history, ymd(2023, 12, 1)).unwrap().is_empty());
    }

    #[test]
    fn test_predict_single_day_is_clamped() {
        let history = weekly_pattern(60);
        let model = AutoregressiveForecaster::new(ForecastConfig::default())
            .fit(&history)
            .unwrap();

        let next = next_day(history.last_date().unwrap()).unwrap();
        let forecast = model.predict(&history, next).unwrap();

        assert_eq!(forecast.len(), 1);
        assert!(forecast[&next] <= 0.0, "got {}", forecast[&next]);
    }

    #[test]
    fn test_clamp_applies_only_to_output() {
        // income-like history: unclamped predictions are positive
        let series: DailySeries = (1..=30).map(|d| (ymd(2024, 4, d), 50.0 + d as f64)).collect();
        let history = DailyFrame::from_series(DEFAULT_TARGET_COLUMN, &series);

        let clamped = AutoregressiveForecaster::new(ForecastConfig::default())
            .fit(&history)
            .unwrap();
        let mut raw = clamped.clone();
        raw.clip_target = false;

        let end = ymd(2024, 5, 10);
        let clamped = clamped.predict(&history, end).unwrap();
        let raw = raw.predict(&history, end).unwrap();

        assert_eq!(clamped.len(), 10);
        assert!(clamped.values().all(|v| *v == 0.0));
        assert!(raw.values().all(|v| *v > 0.0));
    }

    #[test]
    fn test_insufficient_history() {
        let history = weekly_pattern(4);
        let result = AutoregressiveForecaster::new(ForecastConfig::default()).fit(&history);

        match result {
            Err(ForecastError::InsufficientData {
                required,
                available,
                ..
            }) => {
                assert_eq!(required, 5);
                assert_eq!(available, 4);
            }
            other => panic!("expected InsufficientData, got {:?}", other),
        }
    }

    #[test]
    fn test_predictions_feed_forward() {
        let history = weekly_pattern(60);
        let model = AutoregressiveForecaster::new(ForecastConfig::default())
            .fit(&history)
            .unwrap();

        let end = ymd(2024, 3, 20);
        let long = model.predict_full(&history, end).unwrap();
        let short = model.predict_full(&history, ymd(2024, 3, 5)).unwrap();

        // the first days do not depend on how far the horizon reaches
        assert_eq!(short.len(), 5);
        for i in 0..short.len() {
            assert_eq!(short.row(i), long.row(i));
        }
        assert_eq!(long.last_date(), Some(end));
    }

    #[test]
    fn test_blob_round_trip() {
        let history = weekly_pattern(30);
        let model = AutoregressiveForecaster::new(ForecastConfig::default())
            .fit(&history)
            .unwrap();

        let restored = ForecastModel::from_blob(&model.to_blob().unwrap()).unwrap();
        assert_eq!(restored, model);

        // bit-exact coefficients give bit-exact forecasts
        let end = ymd(2024, 3, 1);
        let before = model.predict(&history, end).unwrap();
        let after = restored.predict(&history, end).unwrap();
        assert!(before
            .values()
            .zip(after.values())
            .all(|(a, b)| a.to_bits() == b.to_bits()));
    }

    #[test]
    fn test_history_columns_must_match() {
        let history = weekly_pattern(30);
        let model = AutoregressiveForecaster::new(ForecastConfig::default())
            .fit(&history)
            .unwrap();

        let other = DailyFrame::from_series("balance", &history.series("amount").unwrap());
        assert!(model.predict(&other, ymd(2024, 3, 1)).is_err());
    }
}
