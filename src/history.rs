//! Merging an imported statement into the stored transaction history.

use crate::error::{ForecastError, Result};
use crate::schema::{Transaction, TransactionOrigin};
use chrono::NaiveDate;
use log::{debug, info};
use std::collections::HashSet;

/// Largest rebuilt-versus-statement balance difference still treated as equal.
pub const BALANCE_TOLERANCE: f64 = 0.005;

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Stored and new rows in date order; new rows have `TransactionOrigin::Imported`.
    pub transactions: Vec<Transaction>,
    pub added: usize,
    /// Set when an imported row predates stored rows and balances were regenerated from this
    /// date on. Forecasts derived from the old balances are stale.
    pub rebuilt_from: Option<NaiveDate>,
}

/// Balance after each row given the balance after the last one.
pub fn balances_ending_at(amounts: &[f64], closing_balance: f64) -> Vec<f64> {
    let total: f64 = amounts.iter().sum();
    let mut balance = closing_balance - total;
    amounts
        .iter()
        .map(|amount| {
            balance += amount;
            balance
        })
        .collect()
}

fn dedup_key(transaction: &Transaction) -> (NaiveDate, u64) {
    // + 0.0 folds -0.0 into 0.0
    (transaction.date, (transaction.amount + 0.0).to_bits())
}

/// Adds `incoming` (one statement ending at `closing_balance`) to `stored`.
///
/// Rows whose (date, amount) already exists are dropped, stored rows first. A statement that
/// reaches before the last stored row regenerates every balance from the last stored balance
/// before it, and the result must agree with the statement. On disagreement nothing is merged
/// and `BalanceReconciliationConflict` is returned.
pub fn merge_histories(
    stored: &[Transaction],
    incoming: &[Transaction],
    closing_balance: f64,
) -> Result<MergeOutcome> {
    let mut statement = incoming.to_vec();
    statement.sort_by_key(|t| t.date);
    let amounts: Vec<f64> = statement.iter().map(|t| t.amount).collect();
    for (row, balance) in statement
        .iter_mut()
        .zip(balances_ending_at(&amounts, closing_balance))
    {
        row.balance = Some(balance);
        row.origin = TransactionOrigin::Imported;
    }

    let mut seen: HashSet<(NaiveDate, u64)> = stored.iter().map(dedup_key).collect();
    let fresh: Vec<Transaction> = statement
        .into_iter()
        .filter(|t| seen.insert(dedup_key(t)))
        .collect();
    debug!(
        "{} of {} imported rows are new",
        fresh.len(),
        incoming.len()
    );

    let mut transactions = stored.to_vec();
    transactions.sort_by_key(|t| t.date);

    let earliest_new = match fresh.first() {
        Some(first) => first.date,
        None => {
            return Ok(MergeOutcome {
                transactions,
                added: 0,
                rebuilt_from: None,
            })
        }
    };
    let added = fresh.len();
    let last_stored = transactions.last().map(|t| t.date);

    if last_stored.map_or(true, |last| earliest_new >= last) {
        transactions.extend(fresh);
        return Ok(MergeOutcome {
            transactions,
            added,
            rebuilt_from: None,
        });
    }

    info!(
        "Imported rows reach back to {}, rebuilding balances",
        earliest_new
    );
    transactions.extend(fresh);
    // stable: stored rows stay ahead of new rows of the same day
    transactions.sort_by_key(|t| t.date);

    let (last_new, expected) = transactions
        .iter()
        .enumerate()
        .filter(|(_, t)| t.is_new())
        .last()
        .map(|(i, t)| (i, t.balance.unwrap_or(closing_balance)))
        .unwrap_or((transactions.len() - 1, closing_balance));

    let anchor = transactions
        .iter()
        .enumerate()
        .take_while(|(_, t)| t.date < earliest_new)
        .filter_map(|(i, t)| t.balance.map(|b| (i, b)))
        .last();

    match anchor {
        Some((index, balance)) => fill_forward(&mut transactions, index + 1, balance),
        None => {
            let before: f64 = transactions[..=last_new].iter().map(|t| t.amount).sum();
            fill_forward(&mut transactions, 0, expected - before);
        }
    }

    let actual = transactions[last_new].balance.unwrap_or(f64::NAN);
    let reconciled = (actual - expected).abs() <= BALANCE_TOLERANCE;
    if !reconciled {
        return Err(ForecastError::BalanceReconciliationConflict {
            date: transactions[last_new].date,
            expected,
            actual,
        });
    }

    Ok(MergeOutcome {
        transactions,
        added,
        rebuilt_from: Some(earliest_new),
    })
}

fn fill_forward(rows: &mut [Transaction], from: usize, opening: f64) {
    let mut balance = opening;
    for row in rows.iter_mut().skip(from) {
        balance += row.amount;
        row.balance = Some(balance);
    }
}
