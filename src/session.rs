//! Per-user sessions over pluggable storage.
//!
//! Storage is reached only through the provider traits. A session is loaded the first time a user
//! is touched and dropped again by [`SessionRegistry::evict_idle`]. Nothing here is shared between
//! users and nothing is synchronised; callers serialise access per registry.

use crate::error::{ForecastError, Result};
use crate::forecaster::ForecastModel;
use crate::history::{merge_histories, MergeOutcome};
use crate::schema::{OnetimeEntry, RecurringRule, Transaction};
use crate::{BalanceProjector, EventSchedule, ForecastConfig, Projection, ProjectionInput};
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub type UserId = i64;

pub trait HistoricalTransactionProvider {
    /// Non-deleted transactions of the user, sorted by date.
    fn load_transactions(&self, user: UserId) -> Result<Vec<Transaction>>;
    fn save_transactions(&self, user: UserId, transactions: &[Transaction]) -> Result<()>;
}

pub trait RecurringRuleProvider {
    /// Active rules of the user.
    fn load_rules(&self, user: UserId) -> Result<Vec<RecurringRule>>;
}

pub trait OnetimeEntryProvider {
    fn load_onetime(&self, user: UserId) -> Result<Vec<OnetimeEntry>>;
}

/// Opaque serialized [`ForecastModel`] per user.
pub trait ModelStore {
    fn load_model(&self, user: UserId) -> Result<Option<Vec<u8>>>;
    fn save_model(&self, user: UserId, blob: &[u8]) -> Result<()>;
}

pub trait Repository:
    HistoricalTransactionProvider + RecurringRuleProvider + OnetimeEntryProvider + ModelStore
{
}

impl<T> Repository for T where
    T: HistoricalTransactionProvider + RecurringRuleProvider + OnetimeEntryProvider + ModelStore
{
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub elapsed: Duration,
    /// Transactions in the stored history
    pub event_count: usize,
    /// Transactions left for training after cleaning
    pub ml_event_count: usize,
}

struct UserSession {
    transactions: Vec<Transaction>,
    rules: Vec<RecurringRule>,
    onetime: Vec<OnetimeEntry>,
    model: Option<ForecastModel>,
    last_used: NaiveDateTime,
}

pub struct SessionRegistry<R: Repository> {
    repository: R,
    projector: BalanceProjector,
    idle_timeout: TimeDelta,
    sessions: HashMap<UserId, UserSession>,
}

impl<R: Repository> SessionRegistry<R> {
    pub fn new(repository: R, config: ForecastConfig) -> Result<Self> {
        Ok(Self {
            repository,
            projector: BalanceProjector::new(config)?,
            idle_timeout: TimeDelta::minutes(30),
            sessions: HashMap::new(),
        })
    }

    pub fn with_idle_timeout(mut self, idle_timeout: TimeDelta) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn is_loaded(&self, user: UserId) -> bool {
        self.sessions.contains_key(&user)
    }

    /// Forgets the cached session so the next call reloads it, e.g. after rules were edited.
    pub fn invalidate(&mut self, user: UserId) {
        self.sessions.remove(&user);
    }

    /// Drops every session unused for longer than the idle timeout. Returns how many went.
    pub fn evict_idle(&mut self, now: NaiveDateTime) -> usize {
        let before = self.sessions.len();
        let timeout = self.idle_timeout;
        self.sessions
            .retain(|_, session| now.signed_duration_since(session.last_used) <= timeout);

        let evicted = before - self.sessions.len();
        if evicted > 0 {
            info!("Evicted {} idle sessions", evicted);
        }
        evicted
    }

    /// Scheduled payments from `now` through `end`.
    pub fn predict_events(
        &mut self,
        user: UserId,
        now: NaiveDateTime,
        end: NaiveDate,
    ) -> Result<EventSchedule> {
        let session = load_session(&mut self.sessions, &self.repository, user, now)?;
        self.projector
            .predict_events(&input(session, now.date(), end))
    }

    /// Daily balance timeline from `now` through `end`. A user without a stored model gets one
    /// fitted and saved first; when the history is too short for that, only scheduled payments
    /// are projected.
    pub fn project(&mut self, user: UserId, now: NaiveDateTime, end: NaiveDate) -> Result<Projection> {
        let session = load_session(&mut self.sessions, &self.repository, user, now)?;

        if session.model.is_none() {
            match fit_and_save(&self.projector, &self.repository, user, session) {
                Ok(report) => debug!("Fitted a first model for user {}: {:?}", user, report),
                Err(ForecastError::InsufficientData {
                    column,
                    required,
                    available,
                }) => warn!(
                    "Projecting without a forecast for user {}: '{}' has {} of {} days",
                    user, column, available, required
                ),
                Err(e) => return Err(e),
            }
        }

        self.projector
            .project(&input(session, now.date(), end), session.model.as_ref())
    }

    /// Refits the user's model on the current history and saves it.
    pub fn fit_model(&mut self, user: UserId, now: NaiveDateTime) -> Result<FitReport> {
        let session = load_session(&mut self.sessions, &self.repository, user, now)?;
        fit_and_save(&self.projector, &self.repository, user, session)
    }

    /// Merges a statement into the stored history and persists the result.
    pub fn import_transactions(
        &mut self,
        user: UserId,
        now: NaiveDateTime,
        incoming: &[Transaction],
        closing_balance: f64,
    ) -> Result<MergeOutcome> {
        let session = load_session(&mut self.sessions, &self.repository, user, now)?;
        let outcome = merge_histories(&session.transactions, incoming, closing_balance)?;

        self.repository
            .save_transactions(user, &outcome.transactions)?;
        session.transactions = outcome.transactions.clone();

        info!(
            "Imported {} new transactions for user {}{}",
            outcome.added,
            user,
            outcome
                .rebuilt_from
                .map(|d| format!(", balances rebuilt from {}", d))
                .unwrap_or_default()
        );
        Ok(outcome)
    }
}

fn input(session: &UserSession, start: NaiveDate, end: NaiveDate) -> ProjectionInput<'_> {
    ProjectionInput {
        history: &session.transactions,
        rules: &session.rules,
        onetime: &session.onetime,
        start,
        end,
    }
}

fn load_session<'s, R: Repository>(
    sessions: &'s mut HashMap<UserId, UserSession>,
    repository: &R,
    user: UserId,
    now: NaiveDateTime,
) -> Result<&'s mut UserSession> {
    if !sessions.contains_key(&user) {
        let model = repository
            .load_model(user)?
            .map(|blob| ForecastModel::from_blob(&blob))
            .transpose()?;

        let session = UserSession {
            transactions: repository.load_transactions(user)?,
            rules: repository.load_rules(user)?,
            onetime: repository.load_onetime(user)?,
            model,
            last_used: now,
        };
        debug!(
            "Loaded user {}: {} transactions, {} rules, {} one-off entries",
            user,
            session.transactions.len(),
            session.rules.len(),
            session.onetime.len()
        );
        sessions.insert(user, session);
    }

    let session = sessions
        .get_mut(&user)
        .ok_or_else(|| ForecastError::Storage(format!("session of user {} vanished", user)))?;
    session.last_used = now;
    Ok(session)
}

fn fit_and_save<R: Repository>(
    projector: &BalanceProjector,
    repository: &R,
    user: UserId,
    session: &mut UserSession,
) -> Result<FitReport> {
    let started = Instant::now();

    let cleaned = projector.clean(&session.transactions, &session.rules);
    let model = projector.fit_cleaned(&cleaned)?;
    repository.save_model(user, &model.to_blob()?)?;
    session.model = Some(model);

    let report = FitReport {
        elapsed: started.elapsed(),
        event_count: session.transactions.len(),
        ml_event_count: cleaned.transactions.len(),
    };
    info!(
        "Fitted model for user {} on {} of {} transactions in {:?}",
        user, report.ml_event_count, report.event_count, report.elapsed
    );
    Ok(report)
}

/// Keeps everything in memory. Serves tests and demos.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    transactions: RefCell<HashMap<UserId, Vec<Transaction>>>,
    rules: RefCell<HashMap<UserId, Vec<RecurringRule>>>,
    onetime: RefCell<HashMap<UserId, Vec<OnetimeEntry>>>,
    models: RefCell<HashMap<UserId, Vec<u8>>>,
    loads: Cell<usize>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_transactions(&self, user: UserId, transactions: Vec<Transaction>) {
        self.transactions.borrow_mut().insert(user, transactions);
    }

    pub fn insert_rules(&self, user: UserId, rules: Vec<RecurringRule>) {
        self.rules.borrow_mut().insert(user, rules);
    }

    pub fn insert_onetime(&self, user: UserId, entries: Vec<OnetimeEntry>) {
        self.onetime.borrow_mut().insert(user, entries);
    }

    pub fn model_blob(&self, user: UserId) -> Option<Vec<u8>> {
        self.models.borrow().get(&user).cloned()
    }

    /// How many times a user's history was read.
    pub fn load_count(&self) -> usize {
        self.loads.get()
    }
}

impl HistoricalTransactionProvider for InMemoryRepository {
    fn load_transactions(&self, user: UserId) -> Result<Vec<Transaction>> {
        self.loads.set(self.loads.get() + 1);
        let mut rows = self
            .transactions
            .borrow()
            .get(&user)
            .cloned()
            .unwrap_or_default();
        rows.sort_by_key(|t| t.date);
        Ok(rows)
    }

    fn save_transactions(&self, user: UserId, transactions: &[Transaction]) -> Result<()> {
        self.transactions
            .borrow_mut()
            .insert(user, transactions.to_vec());
        Ok(())
    }
}

impl RecurringRuleProvider for InMemoryRepository {
    fn load_rules(&self, user: UserId) -> Result<Vec<RecurringRule>> {
        Ok(self.rules.borrow().get(&user).cloned().unwrap_or_default())
    }
}

impl OnetimeEntryProvider for InMemoryRepository {
    fn load_onetime(&self, user: UserId) -> Result<Vec<OnetimeEntry>> {
        Ok(self.onetime.borrow().get(&user).cloned().unwrap_or_default())
    }
}

impl ModelStore for InMemoryRepository {
    fn load_model(&self, user: UserId) -> Result<Option<Vec<u8>>> {
        Ok(self.models.borrow().get(&user).cloned())
    }

    fn save_model(&self, user: UserId, blob: &[u8]) -> Result<()> {
        self.models.borrow_mut().insert(user, blob.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Period, SearchStrategy};

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(date: NaiveDate, hour: u32) -> NaiveDateTime {
        date.and_hms_opt(hour, 0, 0).unwrap()
    }

    fn repository(days: usize) -> InMemoryRepository {
        let repository = InMemoryRepository::new();
        let mut balance = 5000.0;
        let rows = ymd(2024, 1, 1)
            .iter_days()
            .take(days)
            .enumerate()
            .map(|(i, day)| {
                let amount = -20.0 - (i % 4) as f64 * 5.0;
                balance += amount;
                Transaction::new(day, amount, "MARKET").with_balance(balance)
            })
            .collect();
        repository.insert_transactions(1, rows);

        let mut rule = RecurringRule::new(3, "gym", -45.0, ymd(2024, 1, 10), Period::months(1));
        rule.search_strategy = SearchStrategy::ByDescription {
            description: "GYM".to_string(),
        };
        repository.insert_rules(1, vec![rule]);
        repository
    }

    #[test]
    fn test_sessions_load_once_and_evict_when_idle() {
        let mut registry = SessionRegistry::new(repository(60), ForecastConfig::default())
            .unwrap()
            .with_idle_timeout(TimeDelta::hours(1));
        let today = ymd(2024, 3, 1);

        registry.predict_events(1, at(today, 9), ymd(2024, 4, 30)).unwrap();
        registry.predict_events(1, at(today, 10), ymd(2024, 4, 30)).unwrap();
        assert_eq!(registry.repository().load_count(), 1);

        assert_eq!(registry.evict_idle(at(today, 10)), 0);
        assert_eq!(registry.evict_idle(at(today, 12)), 1);
        assert!(!registry.is_loaded(1));

        registry.predict_events(1, at(today, 13), ymd(2024, 4, 30)).unwrap();
        assert_eq!(registry.repository().load_count(), 2);
    }

    #[test]
    fn test_first_projection_fits_and_saves_model() {
        let mut registry = SessionRegistry::new(repository(60), ForecastConfig::default()).unwrap();
        assert!(registry.repository().model_blob(1).is_none());

        let projection = registry
            .project(1, at(ymd(2024, 3, 1), 9), ymd(2024, 3, 31))
            .unwrap();

        assert_eq!(projection.timeline.len(), 31);
        assert!(!projection.forecast.is_empty());
        let blob = registry.repository().model_blob(1).unwrap();
        assert!(ForecastModel::from_blob(&blob).is_ok());
    }

    #[test]
    fn test_short_history_projects_schedule_only() {
        let mut registry = SessionRegistry::new(repository(3), ForecastConfig::default()).unwrap();

        let projection = registry
            .project(1, at(ymd(2024, 1, 4), 9), ymd(2024, 2, 15))
            .unwrap();

        assert!(projection.forecast.is_empty());
        assert_eq!(projection.events.len(), 2);
        assert!(registry.repository().model_blob(1).is_none());
    }

    #[test]
    fn test_fit_model_report() {
        let mut registry = SessionRegistry::new(repository(60), ForecastConfig::default()).unwrap();

        let report = registry.fit_model(1, at(ymd(2024, 3, 1), 9)).unwrap();

        assert_eq!(report.event_count, 60);
        assert!(report.ml_event_count > 0 && report.ml_event_count < 60);
    }

    #[test]
    fn test_import_persists_merged_history() {
        let mut registry = SessionRegistry::new(repository(10), ForecastConfig::default()).unwrap();
        let now = at(ymd(2024, 1, 12), 9);

        let incoming = vec![
            Transaction::new(ymd(2024, 1, 10), -25.0, "MARKET"),
            Transaction::new(ymd(2024, 1, 11), -60.0, "GYM"),
        ];
        let stored_last = registry
            .repository()
            .load_transactions(1)
            .unwrap()
            .last()
            .and_then(|t| t.balance)
            .unwrap();

        let outcome = registry
            .import_transactions(1, now, &incoming, stored_last - 60.0)
            .unwrap();

        assert_eq!(outcome.added, 1);
        assert_eq!(registry.repository().load_transactions(1).unwrap().len(), 11);
    }
}
