use crate::schema::RecurringRule;
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("Validation failed for {subject}: {details}")]
    ValidationError { subject: String, details: String },

    #[error("Unknown search strategy: {0}")]
    UnknownStrategy(String),

    #[error("Iteration limit exceeded while {phase} for rule {} ({})", rule.id, rule.description)]
    IterationLimitExceeded {
        rule: Box<RecurringRule>,
        phase: &'static str,
    },

    #[error("Insufficient data for column '{column}': {required} days of history required, {available} available")]
    InsufficientData {
        column: String,
        required: usize,
        available: usize,
    },

    #[error("Balance reconciliation conflict on {date}: expected {expected}, rebuilt {actual}")]
    BalanceReconciliationConflict {
        date: NaiveDate,
        expected: f64,
        actual: f64,
    },

    #[error("Balance timeline broken on {date}: {details}")]
    BalanceInvariantViolation { date: NaiveDate, details: String },

    #[error("No known balance to anchor the projection")]
    MissingAnchorBalance,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl ForecastError {
    pub fn validation(subject: impl Into<String>, details: impl Into<String>) -> Self {
        Self::ValidationError {
            subject: subject.into(),
            details: details.into(),
        }
    }

    /// Validation-class failures are reported per rule and never stop the other rules.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ForecastError::ValidationError { .. } | ForecastError::UnknownStrategy(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ForecastError>;
