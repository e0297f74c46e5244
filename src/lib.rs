//! # Balance Forecast
//!
//! Projects an account balance forward from a transaction history by combining recurring-payment
//! rules, one-off entries and a learned forecast of irregular spending.
//!
//! ## Core Concepts
//!
//! - **Recurring rules**: periodic payments that can follow their real price and date and flag
//!   payments that are overdue
//! - **Irregular spending**: whatever the rules do not explain, cleaned into a gapless daily table
//! - **Autoregressive forecast**: one linear model per daily column, predicted day by day with
//!   each prediction feeding the next day's features
//! - **Balance timeline**: every day of the window with its amount and running balance
//!
//! ## Example
//!
//! ```rust,ignore
//! use balance_forecast::*;
//! use chrono::NaiveDate;
//!
//! let projector = BalanceProjector::new(ForecastConfig::default())?;
//! let model = projector.fit(&history, &rules)?;
//!
//! let projection = projector.project(
//!     &ProjectionInput {
//!         history: &history,
//!         rules: &rules,
//!         onetime: &onetime,
//!         start: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
//!         end: NaiveDate::from_ymd_opt(2024, 8, 31).unwrap(),
//!     },
//!     Some(&model),
//! )?;
//! ```

pub mod cleaner;
pub mod compositor;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod forecaster;
pub mod frame;
pub mod history;
pub mod matcher;
pub mod recurring;
pub mod regression;
pub mod schema;
pub mod session;
pub mod utils;

pub use cleaner::{CleanedHistory, TransactionCleaner};
pub use compositor::{
    average_daily_amount, running_balance, schedule_with_balance, verify_timeline, BalanceMode,
    BalancePoint, BalanceTimeline, Compositor, ScheduledEvent,
};
pub use config::{FeatureRule, ForecastConfig, FrequencyEncoding, PriceWeighting};
pub use error::{ForecastError, Result};
pub use evaluation::{backtest, BacktestReport, Score};
pub use features::FeatureBuilder;
pub use forecaster::{AutoregressiveForecaster, ColumnModel, ForecastModel};
pub use frame::{DailyFrame, DailySeries};
pub use history::{merge_histories, MergeOutcome};
pub use matcher::RuleMatcher;
pub use recurring::{Expansion, RecurringEventExpander, RuleFailure};
pub use regression::LinearModel;
pub use schema::*;
pub use session::{
    FitReport, HistoricalTransactionProvider, InMemoryRepository, ModelStore,
    OnetimeEntryProvider, RecurringRuleProvider, Repository, SessionRegistry, UserId,
};

use chrono::NaiveDate;
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Largest drift between a day's balance change and its amount a timeline may carry.
pub const TIMELINE_TOLERANCE: f64 = 1e-6;

/// Inputs of one projection over `[start, end]`.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionInput<'a> {
    pub history: &'a [Transaction],
    pub rules: &'a [RecurringRule],
    pub onetime: &'a [OnetimeEntry],
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Scheduled payments of a window, each with the balance after it.
#[derive(Debug)]
pub struct EventSchedule {
    pub events: Vec<ScheduledEvent>,
    pub failures: Vec<RuleFailure>,
}

#[derive(Debug)]
pub struct Projection {
    pub timeline: BalanceTimeline,
    pub events: Vec<ScheduledEvent>,
    pub failures: Vec<RuleFailure>,
    /// Balance before the first day of the window.
    pub opening_balance: f64,
    /// Forecast irregular spending inside the window; empty when no model was used.
    pub forecast: DailySeries,
    pub average_daily_forecast: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceProjector {
    config: ForecastConfig,
}

impl BalanceProjector {
    pub fn new(config: ForecastConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    /// Balance after the latest transaction that carries one.
    pub fn anchor_balance(history: &[Transaction]) -> Result<f64> {
        Self::anchor_point(history).map(|(_, balance)| balance)
    }

    /// Date and balance of the latest transaction that carries a balance.
    pub fn anchor_point(history: &[Transaction]) -> Result<(NaiveDate, f64)> {
        history
            .iter()
            .filter_map(|t| t.balance.map(|b| (t.date, b)))
            .max_by_key(|(date, _)| *date)
            .ok_or(ForecastError::MissingAnchorBalance)
    }

    pub fn clean(&self, history: &[Transaction], rules: &[RecurringRule]) -> CleanedHistory {
        TransactionCleaner::from_config(rules, &self.config).clean(history)
    }

    pub fn fit_cleaned(&self, cleaned: &CleanedHistory) -> Result<ForecastModel> {
        AutoregressiveForecaster::new(self.config.clone()).fit(&cleaned.daily)
    }

    pub fn fit(&self, history: &[Transaction], rules: &[RecurringRule]) -> Result<ForecastModel> {
        self.fit_cleaned(&self.clean(history, rules))
    }

    /// Rule occurrences and one-off entries dated inside `[start, end]`, with the forward balance
    /// from the latest known balance.
    pub fn predict_events(&self, input: &ProjectionInput) -> Result<EventSchedule> {
        let anchor = Self::anchor_balance(input.history)?;
        let (expansion, onetime) = self.expand(input)?;

        let occurrences: Vec<Occurrence> = expansion
            .occurrences
            .into_iter()
            .chain(onetime.iter().map(|e| e.to_occurrence()))
            .collect();

        Ok(EventSchedule {
            events: schedule_with_balance(&occurrences, anchor),
            failures: expansion.failures,
        })
    }

    /// Full daily balance timeline over `[start, end]`. Without a model only scheduled payments
    /// move the balance.
    ///
    /// Forecast spending between the anchor day and `start` is carried into the opening balance,
    /// so a window that begins after the history ends still pays for the days in between.
    pub fn project(&self, input: &ProjectionInput, model: Option<&ForecastModel>) -> Result<Projection> {
        let (anchor_date, anchor) = Self::anchor_point(input.history)?;
        let compositor = Compositor::new(input.start, input.end)?;
        let (expansion, onetime) = self.expand(input)?;

        let predicted: DailySeries = match model {
            Some(model) => {
                let cleaned = self.clean(input.history, input.rules);
                if cleaned.daily.is_empty() {
                    debug!("No irregular spending to forecast from");
                    DailySeries::new()
                } else {
                    model.predict(&cleaned.daily, input.end)?
                }
            }
            None => DailySeries::new(),
        };

        let carried: f64 = predicted
            .iter()
            .filter(|(d, _)| **d > anchor_date && **d < input.start)
            .map(|(_, a)| *a)
            .sum();
        let opening = anchor + carried;
        if carried != 0.0 {
            debug!(
                "Carried {:.2} of forecast spending from {} to {}",
                carried, anchor_date, input.start
            );
        }

        let forecast: DailySeries = predicted
            .range(input.start..=input.end)
            .map(|(d, a)| (*d, *a))
            .collect();

        let timeline = compositor.compose(
            &expansion.occurrences,
            &onetime,
            &forecast,
            opening,
            BalanceMode::Forward,
        );
        verify_timeline(&timeline, TIMELINE_TOLERANCE)?;

        let occurrences: Vec<Occurrence> = expansion
            .occurrences
            .into_iter()
            .chain(onetime.iter().map(|e| e.to_occurrence()))
            .collect();

        info!(
            "Projected {} days from {} to {} ({} scheduled payments)",
            timeline.len(),
            input.start,
            input.end,
            occurrences.len()
        );

        Ok(Projection {
            events: schedule_with_balance(&occurrences, opening),
            failures: expansion.failures,
            opening_balance: opening,
            average_daily_forecast: average_daily_amount(&forecast),
            forecast,
            timeline,
        })
    }

    /// Rules expanded over the whole of `[start, end]`, and the one-off entries inside it.
    fn expand(&self, input: &ProjectionInput) -> Result<(Expansion, Vec<OnetimeEntry>)> {
        if input.end < input.start {
            return Err(ForecastError::validation(
                "projection window",
                format!("end {} is before start {}", input.end, input.start),
            ));
        }

        let query_end = utils::next_day(input.end).unwrap_or(input.end);
        let expansion = RecurringEventExpander::from_config(input.history, &self.config).expand(
            input.rules,
            input.start,
            query_end,
        );

        let onetime = input
            .onetime
            .iter()
            .filter(|e| e.date >= input.start && e.date <= input.end)
            .cloned()
            .collect();

        Ok((expansion, onetime))
    }
}
