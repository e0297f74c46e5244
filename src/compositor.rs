use crate::error::{ForecastError, Result};
use crate::frame::DailySeries;
use crate::schema::{OnetimeEntry, Occurrence};
use crate::utils::{days_inclusive, mean, next_day};
use chrono::NaiveDate;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the anchor balance relates to the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceMode {
    /// The anchor is the balance before the first day.
    Forward,
    /// The anchor is the balance at the end of the last day.
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalancePoint {
    pub amount: f64,
    pub balance: f64,
}

pub type BalanceTimeline = BTreeMap<NaiveDate, BalancePoint>;

/// A scheduled occurrence with the balance right after it is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub occurrence: Occurrence,
    pub balance: f64,
}

/// Merges scheduled payments and forecast spending over `[start, end]`.
pub struct Compositor {
    start: NaiveDate,
    end: NaiveDate,
}

impl Compositor {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end < start {
            return Err(ForecastError::validation(
                "compositor window",
                format!("end {} is before start {}", end, start),
            ));
        }
        Ok(Self { start, end })
    }

    /// One row for every day of the window. Amounts landing on the same day are summed and days
    /// without any amount carry zero.
    pub fn compose(
        &self,
        occurrences: &[Occurrence],
        onetime: &[OnetimeEntry],
        forecast: &DailySeries,
        anchor: f64,
        mode: BalanceMode,
    ) -> BalanceTimeline {
        let mut amounts: DailySeries = days_inclusive(self.start, self.end)
            .into_iter()
            .map(|d| (d, 0.0))
            .collect();

        let scheduled = occurrences
            .iter()
            .map(|o| (o.date, o.amount))
            .chain(onetime.iter().map(|e| (e.date, e.amount)))
            .chain(forecast.iter().map(|(d, a)| (*d, *a)));

        for (date, amount) in scheduled {
            if let Some(slot) = amounts.get_mut(&date) {
                *slot += amount;
            }
        }

        debug!(
            "Composed {} days from {} occurrences, {} one-off entries and {} forecast days",
            amounts.len(),
            occurrences.len(),
            onetime.len(),
            forecast.len()
        );
        running_balance(&amounts, anchor, mode)
    }
}

/// Balance of every day of a gapless amount series.
pub fn running_balance(amounts: &DailySeries, anchor: f64, mode: BalanceMode) -> BalanceTimeline {
    let start = match mode {
        BalanceMode::Forward => anchor,
        BalanceMode::Backward => anchor - amounts.values().sum::<f64>(),
    };

    let mut balance = start;
    amounts
        .iter()
        .map(|(date, amount)| {
            balance += amount;
            (
                *date,
                BalancePoint {
                    amount: *amount,
                    balance,
                },
            )
        })
        .collect()
}

/// Checks that no day is missing and that every balance moves by exactly that day's amount.
pub fn verify_timeline(timeline: &BalanceTimeline, tolerance: f64) -> Result<()> {
    let mut previous: Option<(NaiveDate, f64)> = None;

    for (date, point) in timeline {
        if let Some((prev_date, prev_balance)) = previous {
            if next_day(prev_date) != Some(*date) {
                return Err(ForecastError::BalanceInvariantViolation {
                    date: *date,
                    details: format!("no row for the day after {}", prev_date),
                });
            }

            let difference = (point.balance - prev_balance - point.amount).abs();
            if difference > tolerance {
                return Err(ForecastError::BalanceInvariantViolation {
                    date: *date,
                    details: format!(
                        "balance moved by {} but the amount is {}",
                        point.balance - prev_balance,
                        point.amount
                    ),
                });
            }
        }
        previous = Some((*date, point.balance));
    }

    Ok(())
}

/// Occurrences in date order, each with the forward balance after it.
pub fn schedule_with_balance(occurrences: &[Occurrence], anchor: f64) -> Vec<ScheduledEvent> {
    let mut sorted = occurrences.to_vec();
    sorted.sort_by_key(|o| o.date);

    let mut balance = anchor;
    sorted
        .into_iter()
        .map(|occurrence| {
            balance += occurrence.amount;
            ScheduledEvent {
                occurrence,
                balance,
            }
        })
        .collect()
}

pub fn average_daily_amount(series: &DailySeries) -> Option<f64> {
    let values: Vec<f64> = series.values().copied().collect();
    mean(&values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::OccurrenceKind;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn occurrence(date: NaiveDate, amount: f64) -> Occurrence {
        Occurrence {
            date,
            amount,
            kind: OccurrenceKind::Regular { rule_id: 1 },
            description: "rent".to_string(),
        }
    }

    #[test]
    fn test_compose_is_gapless_and_consistent() {
        let compositor = Compositor::new(ymd(2024, 2, 25), ymd(2024, 3, 5)).unwrap();
        let occurrences = vec![
            occurrence(ymd(2024, 2, 28), -1200.0),
            occurrence(ymd(2024, 3, 10), -50.0),
        ];
        let onetime = vec![OnetimeEntry {
            id: 4,
            date: ymd(2024, 2, 28),
            amount: 300.0,
            description: "gift".to_string(),
        }];
        let forecast: DailySeries = days_inclusive(ymd(2024, 2, 20), ymd(2024, 3, 2))
            .into_iter()
            .map(|d| (d, -10.0))
            .collect();

        let timeline = compositor.compose(&occurrences, &onetime, &forecast, 1000.0, BalanceMode::Forward);

        assert_eq!(timeline.len(), 10);
        assert!(verify_timeline(&timeline, 1e-9).is_ok());
        assert_eq!(timeline[&ymd(2024, 2, 25)].balance, 990.0);
        assert_eq!(timeline[&ymd(2024, 2, 28)].amount, -910.0);
        assert_eq!(timeline[&ymd(2024, 3, 5)].amount, 0.0);
        // occurrence on 03-10 and forecast before 02-25 fall outside the window
        let total: f64 = timeline.values().map(|p| p.amount).sum();
        assert!((timeline[&ymd(2024, 3, 5)].balance - (1000.0 + total)).abs() < 1e-9);
    }

    #[test]
    fn test_backward_mode_ends_at_anchor() {
        let amounts: DailySeries = BTreeMap::from([
            (ymd(2024, 1, 1), -20.0),
            (ymd(2024, 1, 2), 0.0),
            (ymd(2024, 1, 3), 500.0),
        ]);

        let timeline = running_balance(&amounts, 800.0, BalanceMode::Backward);

        assert_eq!(timeline[&ymd(2024, 1, 3)].balance, 800.0);
        assert_eq!(timeline[&ymd(2024, 1, 1)].balance, 300.0);
        assert!(verify_timeline(&timeline, 1e-9).is_ok());
    }

    #[test]
    fn test_verify_detects_gap_and_drift() {
        let mut timeline = running_balance(
            &BTreeMap::from([(ymd(2024, 1, 1), -5.0), (ymd(2024, 1, 2), -5.0)]),
            0.0,
            BalanceMode::Forward,
        );
        timeline.insert(
            ymd(2024, 1, 4),
            BalancePoint {
                amount: 0.0,
                balance: -10.0,
            },
        );
        assert!(matches!(
            verify_timeline(&timeline, 1e-9),
            Err(ForecastError::BalanceInvariantViolation { .. })
        ));

        timeline.remove(&ymd(2024, 1, 4));
        timeline.get_mut(&ymd(2024, 1, 2)).unwrap().balance = -11.0;
        assert!(verify_timeline(&timeline, 1e-9).is_err());
    }

    #[test]
    fn test_schedule_with_balance() {
        let events = schedule_with_balance(
            &[occurrence(ymd(2024, 3, 1), -100.0), occurrence(ymd(2024, 2, 1), 40.0)],
            60.0,
        );

        assert_eq!(events[0].occurrence.date, ymd(2024, 2, 1));
        assert_eq!(events[0].balance, 100.0);
        assert_eq!(events[1].balance, 0.0);
    }

    #[test]
    fn test_average_daily_amount() {
        let series: DailySeries = BTreeMap::from([(ymd(2024, 1, 1), -10.0), (ymd(2024, 1, 2), -30.0)]);
        assert_eq!(average_daily_amount(&series), Some(-20.0));
        assert_eq!(average_daily_amount(&DailySeries::new()), None);
    }

    #[test]
    fn test_window_must_be_ordered() {
        assert!(Compositor::new(ymd(2024, 2, 1), ymd(2024, 1, 1)).is_err());
    }
}
