//! Recognises historical transactions that belong to a recurring rule.

use crate::schema::{RecurringRule, SearchStrategy, Transaction};

const AMOUNT_EPSILON: f64 = 1e-9;

pub struct RuleMatcher<'a> {
    rule: &'a RecurringRule,
}

impl<'a> RuleMatcher<'a> {
    pub fn new(rule: &'a RecurringRule) -> Self {
        Self { rule }
    }

    pub fn matches(&self, transaction: &Transaction) -> bool {
        let amount = transaction.amount;
        let category = transaction.category.as_deref();

        match &self.rule.search_strategy {
            SearchStrategy::ByDescription { description } => transaction.description == *description,
            SearchStrategy::ByDescriptionAmount { description } => {
                transaction.description == *description && same_amount(amount, self.rule.amount)
            }
            SearchStrategy::ByDescriptionAmountThreshold {
                threshold,
                description,
            } => transaction.description == *description && amount < *threshold,
            SearchStrategy::ByCategoryAmount { category: wanted } => {
                category == Some(wanted.as_str()) && same_amount(amount, self.rule.amount)
            }
            SearchStrategy::ByCategoryAmountThreshold {
                threshold,
                category: wanted,
            } => category == Some(wanted.as_str()) && amount < *threshold,
            SearchStrategy::None => false,
        }
    }

    /// One flag per row of `transactions`.
    pub fn mask(&self, transactions: &[Transaction]) -> Vec<bool> {
        transactions.iter().map(|t| self.matches(t)).collect()
    }

    /// Matched rows in input order.
    pub fn matched<'t>(&self, transactions: &'t [Transaction]) -> Vec<&'t Transaction> {
        transactions.iter().filter(|t| self.matches(t)).collect()
    }
}

fn same_amount(a: f64, b: f64) -> bool {
    (a - b).abs() < AMOUNT_EPSILON
}

/// Rows matched by at least one of `rules`.
pub fn union_mask(transactions: &[Transaction], rules: &[RecurringRule]) -> Vec<bool> {
    let mut mask = vec![false; transactions.len()];
    for rule in rules {
        let matcher = RuleMatcher::new(rule);
        for (flag, transaction) in mask.iter_mut().zip(transactions) {
            if !*flag && matcher.matches(transaction) {
                *flag = true;
            }
        }
    }
    mask
}
