use crate::config::{ForecastConfig, PriceWeighting};
use crate::error::{ForecastError, Result};
use crate::matcher::RuleMatcher;
use crate::schema::{Occurrence, OccurrenceKind, RecurringRule, Transaction};
use crate::utils::next_day;
use chrono::NaiveDate;
use log::{debug, trace, warn};

/// Upper bound on cursor steps per phase of a single rule's expansion.
pub const MAX_EXPANSION_STEPS: u32 = 1000;

#[derive(Debug)]
pub struct RuleFailure {
    pub rule_id: i64,
    pub error: ForecastError,
}

/// Occurrences of every rule that expanded cleanly, plus the rules that did not.
#[derive(Debug, Default)]
pub struct Expansion {
    pub occurrences: Vec<Occurrence>,
    pub failures: Vec<RuleFailure>,
}

impl Expansion {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn overdue(&self) -> impl Iterator<Item = &Occurrence> {
        self.occurrences.iter().filter(|o| o.is_overdue())
    }
}

pub struct RecurringEventExpander<'a> {
    history: Vec<&'a Transaction>,
    price_window: usize,
    price_weighting: PriceWeighting,
}

impl<'a> RecurringEventExpander<'a> {
    pub fn new(history: &'a [Transaction]) -> Self {
        let mut sorted: Vec<&Transaction> = history.iter().collect();
        sorted.sort_by_key(|t| t.date);

        Self {
            history: sorted,
            price_window: 3,
            price_weighting: PriceWeighting::Triangular,
        }
    }

    pub fn from_config(history: &'a [Transaction], config: &ForecastConfig) -> Self {
        Self::new(history).with_price_adjustment(config.price_window, config.price_weighting)
    }

    pub fn with_price_adjustment(mut self, window: usize, weighting: PriceWeighting) -> Self {
        self.price_window = window.max(1);
        self.price_weighting = weighting;
        self
    }

    /// Expands every rule over `[query_start, query_end)`. A rule that fails is reported in
    /// `failures` and does not affect the others. Occurrences come back sorted by date.
    pub fn expand(
        &self,
        rules: &[RecurringRule],
        query_start: NaiveDate,
        query_end: NaiveDate,
    ) -> Expansion {
        let mut expansion = Expansion::default();

        for rule in rules {
            match self.expand_rule(rule, query_start, query_end) {
                Ok(mut occurrences) => expansion.occurrences.append(&mut occurrences),
                Err(error) => {
                    warn!("Recurring rule {} was not expanded: {}", rule.id, error);
                    expansion.failures.push(RuleFailure {
                        rule_id: rule.id,
                        error,
                    });
                }
            }
        }

        expansion.occurrences.sort_by_key(|o| o.date);
        debug!(
            "Expanded {} rules into {} occurrences ({} failed)",
            rules.len(),
            expansion.occurrences.len(),
            expansion.failures.len()
        );
        expansion
    }

    pub fn expand_rule(
        &self,
        rule: &RecurringRule,
        query_start: NaiveDate,
        query_end: NaiveDate,
    ) -> Result<Vec<Occurrence>> {
        rule.validate()?;

        let effective_end = rule.end_date.map_or(query_end, |end| end.min(query_end));
        let matcher = RuleMatcher::new(rule);
        let matched: Vec<&Transaction> = self
            .history
            .iter()
            .copied()
            .filter(|t| matcher.matches(t))
            .collect();

        let amount = if rule.adjust_price {
            match self.adjusted_amount(&matched) {
                Some(amount) => amount,
                None => {
                    trace!("Rule {}: no matched payments, amount kept", rule.id);
                    rule.amount
                }
            }
        } else {
            rule.amount
        };

        let start = match (rule.adjust_date, matched.last()) {
            (true, Some(latest)) => step(rule, latest.date, 1)?,
            (true, None) => {
                trace!("Rule {}: no matched payments, start date kept", rule.id);
                rule.start_date
            }
            (false, _) => rule.start_date,
        };

        // Walk to the first occurrence inside the window.
        let mut steps = 0;
        let mut cursor = start;
        while cursor < query_start && cursor < effective_end {
            steps += 1;
            if steps >= MAX_EXPANSION_STEPS {
                return Err(ForecastError::IterationLimitExceeded {
                    rule: Box::new(rule.clone()),
                    phase: "searching for the first occurrence",
                });
            }
            cursor = step(rule, start, steps)?;
        }

        let mut occurrences = Vec::new();
        let mut index = steps;
        let skipped = steps.saturating_sub(1);

        if rule.follow_overdue && skipped > 0 {
            let overdue_count = if rule.adjust_date {
                skipped as i64
            } else {
                let occurred = matched.iter().filter(|t| t.date >= start).count() as i64;
                let excess = skipped as i64 - occurred;
                if excess < 0 {
                    // paid ahead of schedule
                    index += (-excess) as u32;
                }
                excess
            };

            if overdue_count > 0 {
                let overdue_date = next_day(query_start).ok_or_else(|| {
                    ForecastError::validation(
                        format!("rule {}", rule.id),
                        "overdue date is out of range",
                    )
                })?;
                debug!("Rule {}: {} overdue payments", rule.id, overdue_count);

                for i in 0..overdue_count as usize {
                    occurrences.push(Occurrence {
                        date: overdue_date,
                        amount,
                        kind: OccurrenceKind::Overdue {
                            rule_id: rule.id,
                            index: i,
                        },
                        description: rule.description.clone(),
                    });
                }
            }
        }

        let mut emitted = 0;
        loop {
            let date = step(rule, start, index + emitted)?;
            if date >= effective_end {
                break;
            }
            if emitted >= MAX_EXPANSION_STEPS {
                return Err(ForecastError::IterationLimitExceeded {
                    rule: Box::new(rule.clone()),
                    phase: "emitting occurrences",
                });
            }
            occurrences.push(Occurrence {
                date,
                amount,
                kind: OccurrenceKind::Regular { rule_id: rule.id },
                description: rule.description.clone(),
            });
            emitted += 1;
        }

        Ok(occurrences)
    }

    /// Weighted average of the latest matched amounts, `None` when nothing matched.
    fn adjusted_amount(&self, matched: &[&Transaction]) -> Option<f64> {
        if matched.is_empty() {
            return None;
        }

        let window = self.price_window.min(matched.len());
        let recent: Vec<f64> = matched[matched.len() - window..]
            .iter()
            .map(|t| t.amount)
            .collect();

        let amount = match self.price_weighting {
            PriceWeighting::Uniform => recent.iter().sum::<f64>() / window as f64,
            PriceWeighting::Triangular => {
                let w = window as f64;
                recent
                    .iter()
                    .enumerate()
                    .map(|(rank, value)| value * 2.0 * (rank as f64 + 1.0) / (w * (w + 1.0)))
                    .sum()
            }
        };
        Some(amount)
    }
}

fn step(rule: &RecurringRule, base: NaiveDate, steps: u32) -> Result<NaiveDate> {
    rule.period.advance(base, steps).ok_or_else(|| {
        ForecastError::validation(
            format!("rule {} ({})", rule.id, rule.description),
            format!("date {} + {} x {} is out of range", base, steps, rule.period),
        )
    })
}
