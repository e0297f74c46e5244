use crate::error::{ForecastError, Result};
use chrono::{Days, Months, NaiveDate};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionOrigin {
    /// Already persisted for the user before the current import
    #[default]
    Stored,
    /// Arrived with the current import and not yet persisted
    Imported,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct Transaction {
    pub date: NaiveDate,

    #[schemars(description = "Signed amount: negative for spending, positive for income.")]
    pub amount: f64,

    #[serde(default)]
    pub category: Option<String>,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    #[schemars(description = "Account balance after this transaction, when known.")]
    pub balance: Option<f64>,

    #[serde(default)]
    pub origin: TransactionOrigin,
}

impl Transaction {
    pub fn new(date: NaiveDate, amount: f64, description: impl Into<String>) -> Self {
        Self {
            date,
            amount,
            category: None,
            description: description.into(),
            balance: None,
            origin: TransactionOrigin::Stored,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_balance(mut self, balance: f64) -> Self {
        self.balance = Some(balance);
        self
    }

    pub fn is_new(&self) -> bool {
        self.origin == TransactionOrigin::Imported
    }
}

/// Calendar distance between two occurrences of a recurring rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Period {
    pub years: i32,
    pub months: i32,
    pub days: i32,
}

impl Period {
    pub fn new(years: i32, months: i32, days: i32) -> Self {
        Self {
            years,
            months,
            days,
        }
    }

    pub fn days(days: i32) -> Self {
        Self::new(0, 0, days)
    }

    pub fn months(months: i32) -> Self {
        Self::new(0, months, 0)
    }

    pub fn is_zero(&self) -> bool {
        self.years == 0 && self.months == 0 && self.days == 0
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.years < 0 || self.months < 0 || self.days < 0 {
            return Err(format!("period {} has a negative component", self));
        }
        if self.is_zero() {
            return Err("period has zero length".to_string());
        }
        Ok(())
    }

    /// `base + steps * self`, months first (clamped to month end) then days.
    /// Always computed from `base` so month-end clamping never accumulates.
    pub fn advance(&self, base: NaiveDate, steps: u32) -> Option<NaiveDate> {
        let months = (self.years.checked_mul(12)?.checked_add(self.months)?) as i64 * steps as i64;
        let days = self.days as i64 * steps as i64;

        let shifted = base.checked_add_months(Months::new(u32::try_from(months).ok()?))?;
        shifted.checked_add_days(Days::new(u64::try_from(days).ok()?))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.years, self.months, self.days)
    }
}

/// How historical transactions are recognised as payments of a recurring rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Description equals the given text
    ByDescription { description: String },
    /// Description equals the given text and amount equals the rule amount
    ByDescriptionAmount { description: String },
    /// Description equals the given text and amount is strictly below the threshold
    ByDescriptionAmountThreshold { threshold: f64, description: String },
    /// Category equals the given text and amount equals the rule amount
    ByCategoryAmount { category: String },
    /// Category equals the given text and amount is strictly below the threshold
    ByCategoryAmountThreshold { threshold: f64, category: String },
    /// Never matches anything
    #[default]
    None,
}

impl SearchStrategy {
    /// Builds a strategy from the stored `(name, argument)` pair used by the rule editor.
    pub fn from_parts(name: &str, arg: Option<&str>) -> Result<Self> {
        let text = |name: &str| -> Result<String> {
            arg.map(|a| a.to_string()).ok_or_else(|| {
                ForecastError::validation(
                    format!("search strategy '{}'", name),
                    "argument is required",
                )
            })
        };

        match name {
            "description" => Ok(Self::ByDescription {
                description: text(name)?,
            }),
            "amount_description" => Ok(Self::ByDescriptionAmount {
                description: text(name)?,
            }),
            "amount<_description" => {
                let (threshold, description) = parse_threshold_arg(name, &text(name)?)?;
                Ok(Self::ByDescriptionAmountThreshold {
                    threshold,
                    description,
                })
            }
            "amount_category" => Ok(Self::ByCategoryAmount {
                category: text(name)?,
            }),
            "amount<_category" => {
                let (threshold, category) = parse_threshold_arg(name, &text(name)?)?;
                Ok(Self::ByCategoryAmountThreshold {
                    threshold,
                    category,
                })
            }
            "dont_search" => Ok(Self::None),
            other => Err(ForecastError::UnknownStrategy(other.to_string())),
        }
    }

    /// The stored name this strategy round-trips to.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ByDescription { .. } => "description",
            Self::ByDescriptionAmount { .. } => "amount_description",
            Self::ByDescriptionAmountThreshold { .. } => "amount<_description",
            Self::ByCategoryAmount { .. } => "amount_category",
            Self::ByCategoryAmountThreshold { .. } => "amount<_category",
            Self::None => "dont_search",
        }
    }
}

fn parse_threshold_arg(name: &str, arg: &str) -> Result<(f64, String)> {
    let (threshold, label) = arg.split_once(',').ok_or_else(|| {
        ForecastError::validation(
            format!("search strategy '{}'", name),
            format!("argument '{}' is not in 'threshold,label' form", arg),
        )
    })?;

    let threshold: f64 = threshold.trim().parse().map_err(|_| {
        ForecastError::validation(
            format!("search strategy '{}'", name),
            format!("threshold '{}' is not a number", threshold),
        )
    })?;

    if !threshold.is_finite() {
        return Err(ForecastError::validation(
            format!("search strategy '{}'", name),
            "threshold must be finite",
        ));
    }

    Ok((threshold, label.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct RecurringRule {
    pub id: i64,
    pub description: String,
    pub amount: f64,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    pub period: Period,
    #[serde(default)]
    pub search_strategy: SearchStrategy,

    #[serde(default)]
    #[schemars(description = "Replace the amount with a weighted average of the latest matched payments.")]
    pub adjust_price: bool,

    #[serde(default)]
    #[schemars(description = "Restart the schedule one period after the latest matched payment.")]
    pub adjust_date: bool,

    #[serde(default)]
    #[schemars(description = "Report expected payments that never showed up in the history as overdue.")]
    pub follow_overdue: bool,
}

impl RecurringRule {
    pub fn new(
        id: i64,
        description: impl Into<String>,
        amount: f64,
        start_date: NaiveDate,
        period: Period,
    ) -> Self {
        Self {
            id,
            description: description.into(),
            amount,
            start_date,
            end_date: None,
            period,
            search_strategy: SearchStrategy::None,
            adjust_price: false,
            adjust_date: false,
            follow_overdue: false,
        }
    }

    /// Rejects rules that cannot be expanded. Must run before any cursor iteration.
    pub fn validate(&self) -> Result<()> {
        self.period
            .validate()
            .map_err(|details| ForecastError::validation(self.subject(), details))?;

        if !self.amount.is_finite() {
            return Err(ForecastError::validation(
                self.subject(),
                "amount must be finite",
            ));
        }

        match &self.search_strategy {
            SearchStrategy::ByDescriptionAmountThreshold { threshold, .. }
            | SearchStrategy::ByCategoryAmountThreshold { threshold, .. }
                if !threshold.is_finite() =>
            {
                Err(ForecastError::validation(
                    self.subject(),
                    "search threshold must be finite",
                ))
            }
            _ => Ok(()),
        }
    }

    fn subject(&self) -> String {
        format!("rule {} ({})", self.id, self.description)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct OnetimeEntry {
    pub id: i64,
    pub date: NaiveDate,
    pub amount: f64,
    #[serde(default)]
    pub description: String,
}

impl OnetimeEntry {
    pub fn to_occurrence(&self) -> Occurrence {
        Occurrence {
            date: self.date,
            amount: self.amount,
            kind: OccurrenceKind::Onetime { entry_id: self.id },
            description: self.description.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OccurrenceKind {
    Regular { rule_id: i64 },
    Overdue { rule_id: i64, index: usize },
    Onetime { entry_id: i64 },
}

/// A single dated payment generated from a rule or a one-off entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Occurrence {
    pub date: NaiveDate,
    pub amount: f64,
    pub kind: OccurrenceKind,
    pub description: String,
}

impl Occurrence {
    pub fn label(&self) -> String {
        match self.kind {
            OccurrenceKind::Regular { rule_id } => format!("regular[{}]", rule_id),
            OccurrenceKind::Overdue { rule_id, index } => format!("overdue[{}-{}]", rule_id, index),
            OccurrenceKind::Onetime { entry_id } => format!("onetime[{}]", entry_id),
        }
    }

    pub fn is_overdue(&self) -> bool {
        matches!(self.kind, OccurrenceKind::Overdue { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_advance_clamps_month_end_without_drift() {
        let base = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let monthly = Period::months(1);

        assert_eq!(
            monthly.advance(base, 1),
            NaiveDate::from_ymd_opt(2024, 2, 29)
        );
        assert_eq!(
            monthly.advance(base, 2),
            NaiveDate::from_ymd_opt(2024, 3, 31)
        );
        assert_eq!(monthly.advance(base, 0), Some(base));
    }

    #[test]
    fn test_period_advance_mixed_components() {
        let base = NaiveDate::from_ymd_opt(2023, 5, 10).unwrap();
        let period = Period::new(1, 1, 3);
        assert_eq!(
            period.advance(base, 2),
            NaiveDate::from_ymd_opt(2025, 7, 16)
        );
    }

    #[test]
    fn test_period_validation() {
        assert!(Period::new(0, 0, 0).validate().is_err());
        assert!(Period::new(0, -1, 0).validate().is_err());
        assert!(Period::days(7).validate().is_ok());
    }

    #[test]
    fn test_strategy_from_parts() {
        let strategy = SearchStrategy::from_parts("amount<_category", Some("-500,Groceries")).unwrap();
        assert_eq!(
            strategy,
            SearchStrategy::ByCategoryAmountThreshold {
                threshold: -500.0,
                category: "Groceries".to_string()
            }
        );
        assert_eq!(strategy.name(), "amount<_category");

        assert_eq!(
            SearchStrategy::from_parts("dont_search", None).unwrap(),
            SearchStrategy::None
        );
    }

    #[test]
    fn test_unknown_strategy_is_named() {
        let err = SearchStrategy::from_parts("by_moon_phase", Some("full")).unwrap_err();
        match err {
            ForecastError::UnknownStrategy(name) => assert_eq!(name, "by_moon_phase"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_threshold_argument() {
        let err = SearchStrategy::from_parts("amount<_description", Some("Rent")).unwrap_err();
        assert!(err.is_validation());

        let err = SearchStrategy::from_parts("amount<_description", Some("abc,Rent")).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_occurrence_labels() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let overdue = Occurrence {
            date,
            amount: -10.0,
            kind: OccurrenceKind::Overdue {
                rule_id: 4,
                index: 2,
            },
            description: "Phone".to_string(),
        };
        assert_eq!(overdue.label(), "overdue[4-2]");
        assert!(overdue.is_overdue());

        let entry = OnetimeEntry {
            id: 9,
            date,
            amount: -652.5,
            description: "Pay back a friend".to_string(),
        };
        let occurrence = entry.to_occurrence();
        assert_eq!(occurrence.label(), "onetime[9]");
        assert!(!occurrence.is_overdue());
    }

    #[test]
    fn test_rule_serialization() {
        let mut rule = RecurringRule::new(
            1,
            "Rent",
            -1200.0,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            Period::months(1),
        );
        rule.search_strategy = SearchStrategy::ByDescription {
            description: "LANDLORD".to_string(),
        };

        let json = serde_json::to_string(&rule).unwrap();
        assert!(json.contains("by_description"));

        let back: RecurringRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn test_missing_search_strategy_never_matches() {
        let rule = RecurringRule::new(
            2,
            "Gym",
            -45.0,
            NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            Period::months(1),
        );
        let mut value = serde_json::to_value(&rule).unwrap();
        value.as_object_mut().unwrap().remove("search_strategy");

        let back: RecurringRule = serde_json::from_value(value).unwrap();
        assert_eq!(back.search_strategy, SearchStrategy::None);
        assert_eq!(SearchStrategy::default(), SearchStrategy::None);
    }
}
