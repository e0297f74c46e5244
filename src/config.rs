use crate::error::{ForecastError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_TARGET_COLUMN: &str = "amount";

/// Lag and rolling-mean features derived from one column of the daily frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct FeatureRule {
    #[schemars(description = "Column of the daily frame the features are read from.")]
    pub column: String,

    #[schemars(description = "Day offsets; each produces the column value that many days earlier. Must be >= 1.")]
    #[serde(default)]
    pub lags: Vec<usize>,

    #[schemars(description = "Window sizes; each produces the mean of the window ending the day before. Must be >= 1.")]
    #[serde(default)]
    pub rolling_windows: Vec<usize>,
}

impl FeatureRule {
    pub fn new(column: impl Into<String>, lags: Vec<usize>, rolling_windows: Vec<usize>) -> Self {
        Self {
            column: column.into(),
            lags,
            rolling_windows,
        }
    }

    /// Default shape applied to a tracked column that has no explicit rule.
    pub fn default_for(column: &str) -> Self {
        Self::new(column, vec![2, 4], vec![2, 1, 4, 3])
    }

    /// Days of history a row needs before all of its features are defined.
    pub fn required_history(&self) -> usize {
        self.lags
            .iter()
            .chain(self.rolling_windows.iter())
            .copied()
            .max()
            .unwrap_or(0)
    }
}

/// Relative-frequency columns added for `category` and `description`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyEncoding {
    #[default]
    None,
    /// Rank by total spent (most spent first)
    Sum,
    /// Rank by number of transactions (most frequent first)
    Count,
    CountSum,
}

impl FrequencyEncoding {
    pub fn uses_sum(&self) -> bool {
        matches!(self, Self::Sum | Self::CountSum)
    }

    pub fn uses_count(&self) -> bool {
        matches!(self, Self::Count | Self::CountSum)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PriceWeighting {
    /// Linear weight ramp, newest sample heaviest
    #[default]
    Triangular,
    Uniform,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ForecastConfig {
    #[serde(default = "default_target_column")]
    pub target_column: String,

    #[serde(default)]
    pub frequency_encoding: FrequencyEncoding,

    #[schemars(description = "Feature rules keyed by the tracked column they predict.")]
    #[serde(default = "default_feature_rules")]
    pub feature_rules: BTreeMap<String, Vec<FeatureRule>>,

    #[schemars(description = "Clamp positive predictions of the target column to zero.")]
    #[serde(default = "default_true")]
    pub clip_target: bool,

    #[schemars(description = "Number of latest matched payments used to adjust a rule's amount.")]
    #[serde(default = "default_price_window")]
    pub price_window: usize,

    #[serde(default)]
    pub price_weighting: PriceWeighting,

    #[schemars(description = "Spending rows at or below this quantile of the amount are dropped before training.")]
    #[serde(default = "default_outlier_quantile")]
    pub outlier_quantile: f64,
}

fn default_target_column() -> String {
    DEFAULT_TARGET_COLUMN.to_string()
}

fn default_feature_rules() -> BTreeMap<String, Vec<FeatureRule>> {
    BTreeMap::from([(
        DEFAULT_TARGET_COLUMN.to_string(),
        vec![FeatureRule::default_for(DEFAULT_TARGET_COLUMN)],
    )])
}

fn default_true() -> bool {
    true
}

fn default_price_window() -> usize {
    3
}

fn default_outlier_quantile() -> f64 {
    0.16
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            target_column: default_target_column(),
            frequency_encoding: FrequencyEncoding::None,
            feature_rules: default_feature_rules(),
            clip_target: true,
            price_window: default_price_window(),
            price_weighting: PriceWeighting::Triangular,
            outlier_quantile: default_outlier_quantile(),
        }
    }
}

impl ForecastConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target_column.is_empty() {
            return Err(ForecastError::validation(
                "forecast config",
                "target column must not be empty",
            ));
        }

        if !(0.0..=1.0).contains(&self.outlier_quantile) {
            return Err(ForecastError::validation(
                "forecast config",
                format!(
                    "outlier quantile {} must be between 0.0 and 1.0",
                    self.outlier_quantile
                ),
            ));
        }

        if self.price_window == 0 {
            return Err(ForecastError::validation(
                "forecast config",
                "price window must be at least 1",
            ));
        }

        for (column, rules) in &self.feature_rules {
            for rule in rules {
                if rule.lags.contains(&0) || rule.rolling_windows.contains(&0) {
                    return Err(ForecastError::validation(
                        format!("feature rules of '{}'", column),
                        format!(
                            "lags and rolling windows of '{}' must be at least 1",
                            rule.column
                        ),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Feature rules for a tracked column, falling back to the default shape.
    pub fn rules_for(&self, column: &str) -> Vec<FeatureRule> {
        self.feature_rules
            .get(column)
            .cloned()
            .unwrap_or_else(|| vec![FeatureRule::default_for(column)])
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(ForecastConfig)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ForecastConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.target_column, "amount");
        assert_eq!(config.rules_for("amount")[0].required_history(), 4);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: ForecastConfig = serde_json::from_str(r#"{"price_window": 5}"#).unwrap();
        assert_eq!(config.price_window, 5);
        assert!(config.clip_target);
        assert!((config.outlier_quantile - 0.16).abs() < 1e-12);
        assert!(config.feature_rules.contains_key("amount"));
    }

    #[test]
    fn test_zero_lag_rejected() {
        let mut config = ForecastConfig::default();
        config.feature_rules.insert(
            "amount".to_string(),
            vec![FeatureRule::new("amount", vec![0, 1], vec![])],
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_quantile_bounds() {
        let config = ForecastConfig {
            outlier_quantile: 1.5,
            ..ForecastConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_schema_generation() {
        let schema_json = ForecastConfig::schema_as_json().unwrap();
        assert!(schema_json.contains("feature_rules"));
        assert!(schema_json.contains("outlier_quantile"));
    }
}
