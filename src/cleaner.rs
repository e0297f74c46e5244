use crate::config::{ForecastConfig, FrequencyEncoding, DEFAULT_TARGET_COLUMN};
use crate::frame::DailyFrame;
use crate::matcher::union_mask;
use crate::schema::{RecurringRule, Transaction};
use crate::utils::{days_inclusive, quantile};
use chrono::NaiveDate;
use log::debug;
use std::collections::{BTreeMap, HashMap};

pub const CATEGORY_SUM_COLUMN: &str = "category_n_sum";
pub const DESCRIPTION_SUM_COLUMN: &str = "description_n_sum";
pub const CATEGORY_COUNT_COLUMN: &str = "category_n_count";
pub const DESCRIPTION_COUNT_COLUMN: &str = "description_n_count";

const ENCODER_TOP_SIZE: usize = 20;

/// Irregular spending left after cleaning, both as rows and as a daily table.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedHistory {
    pub transactions: Vec<Transaction>,
    pub daily: DailyFrame,
    /// Rows with an amount at or below this value were dropped.
    pub outlier_floor: Option<f64>,
}

pub struct TransactionCleaner<'a> {
    rules: &'a [RecurringRule],
    outlier_quantile: f64,
    encoding: FrequencyEncoding,
}

impl<'a> TransactionCleaner<'a> {
    pub fn new(rules: &'a [RecurringRule]) -> Self {
        Self {
            rules,
            outlier_quantile: 0.16,
            encoding: FrequencyEncoding::None,
        }
    }

    pub fn from_config(rules: &'a [RecurringRule], config: &ForecastConfig) -> Self {
        Self::new(rules)
            .with_outlier_quantile(config.outlier_quantile)
            .with_frequency_encoding(config.frequency_encoding)
    }

    pub fn with_outlier_quantile(mut self, quantile: f64) -> Self {
        self.outlier_quantile = quantile;
        self
    }

    pub fn with_frequency_encoding(mut self, encoding: FrequencyEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Columns the cleaned daily table carries for the configured encoding.
    pub fn columns(&self) -> Vec<String> {
        let mut columns = vec![DEFAULT_TARGET_COLUMN.to_string()];
        if self.encoding.uses_sum() {
            columns.push(CATEGORY_SUM_COLUMN.to_string());
            columns.push(DESCRIPTION_SUM_COLUMN.to_string());
        }
        if self.encoding.uses_count() {
            columns.push(CATEGORY_COUNT_COLUMN.to_string());
            columns.push(DESCRIPTION_COUNT_COLUMN.to_string());
        }
        columns
    }

    pub fn clean(&self, history: &[Transaction]) -> CleanedHistory {
        let candidates = self.irregular_spending(history);
        let amounts: Vec<f64> = candidates.iter().map(|t| t.amount).collect();
        let floor = quantile(&amounts, self.outlier_quantile);
        self.finish(candidates, floor)
    }

    /// Same as [`clean`](Self::clean) with a floor fixed in advance instead of derived from the
    /// quantile. Re-cleaning an output with its own floor leaves it unchanged.
    pub fn clean_with_floor(&self, history: &[Transaction], floor: Option<f64>) -> CleanedHistory {
        let candidates = self.irregular_spending(history);
        self.finish(candidates, floor)
    }

    fn irregular_spending(&self, history: &[Transaction]) -> Vec<Transaction> {
        let mut rows = history.to_vec();
        rows.sort_by_key(|t| t.date);

        let total = rows.len();
        let rows = drop_cancelling_pairs(rows);
        debug!("Dropped {} cancelling rows", total - rows.len());

        let mask = union_mask(&rows, self.rules);
        let rows: Vec<Transaction> = rows
            .into_iter()
            .zip(mask)
            .filter(|(t, matched)| t.amount < 0.0 && !matched)
            .map(|(t, _)| t)
            .collect();
        debug!("{} spending rows not explained by recurring rules", rows.len());
        rows
    }

    fn finish(&self, candidates: Vec<Transaction>, floor: Option<f64>) -> CleanedHistory {
        let transactions: Vec<Transaction> = match floor {
            Some(floor) => candidates.into_iter().filter(|t| t.amount > floor).collect(),
            None => candidates,
        };

        let daily = self.resample(&transactions);
        CleanedHistory {
            transactions,
            daily,
            outlier_floor: floor,
        }
    }

    fn resample(&self, transactions: &[Transaction]) -> DailyFrame {
        let columns = self.columns();
        let (first, last) = match (transactions.first(), transactions.last()) {
            (Some(first), Some(last)) => (first.date, last.date),
            _ => return DailyFrame::new(columns),
        };

        let encoders = Encoders::fit(transactions, self.encoding);
        let mut sums: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
        for transaction in transactions {
            let row = sums
                .entry(transaction.date)
                .or_insert_with(|| vec![0.0; columns.len()]);
            row[0] += transaction.amount;
            for (slot, value) in row[1..].iter_mut().zip(encoders.encode(transaction)) {
                *slot += value;
            }
        }

        let dates = days_inclusive(first, last);
        let rows: Vec<Vec<f64>> = dates
            .iter()
            .map(|date| {
                sums.remove(date)
                    .unwrap_or_else(|| vec![0.0; columns.len()])
            })
            .collect();
        DailyFrame::from_parts(columns, dates, rows)
    }
}

/// Drops refund/charge pairs. Within each group of equal absolute amount, ordered ascending, a
/// row survives when the running sign balance from the front is positive or the running sign
/// balance from the back is negative, leaving only the unmatched majority.
pub fn drop_cancelling_pairs(rows: Vec<Transaction>) -> Vec<Transaction> {
    let mut groups: HashMap<u64, Vec<usize>> = HashMap::new();
    for (index, row) in rows.iter().enumerate() {
        groups.entry(row.amount.abs().to_bits()).or_default().push(index);
    }

    let mut keep = vec![false; rows.len()];
    for indices in groups.values_mut() {
        indices.sort_by(|a, b| rows[*a].amount.total_cmp(&rows[*b].amount).then(a.cmp(b)));

        let mut running = 0i64;
        for &index in indices.iter() {
            running += sign(rows[index].amount);
            if running > 0 {
                keep[index] = true;
            }
        }

        running = 0;
        for &index in indices.iter().rev() {
            running += sign(rows[index].amount);
            if running < 0 {
                keep[index] = true;
            }
        }
    }

    rows.into_iter()
        .zip(keep)
        .filter(|(_, kept)| *kept)
        .map(|(row, _)| row)
        .collect()
}

fn sign(amount: f64) -> i64 {
    if amount > 0.0 {
        1
    } else if amount < 0.0 {
        -1
    } else {
        0
    }
}

/// Maps each value to `(top + 1 - rank) / (top + 1)` by its rank among the top values;
/// unseen values map to `1 / (top + 1)`.
#[derive(Debug, Clone, Default)]
struct RankEncoder {
    ranks: HashMap<String, f64>,
}

impl RankEncoder {
    fn from_ordered(names: Vec<String>) -> Self {
        let denominator = (ENCODER_TOP_SIZE + 1) as f64;
        let ranks = names
            .into_iter()
            .take(ENCODER_TOP_SIZE)
            .enumerate()
            .map(|(rank, name)| (name, (ENCODER_TOP_SIZE + 1 - rank) as f64 / denominator))
            .collect();
        Self { ranks }
    }

    /// Largest total spend first (totals are negative).
    fn by_sum<'t>(values: impl Iterator<Item = (Option<&'t str>, f64)>) -> Self {
        let mut totals: HashMap<&str, f64> = HashMap::new();
        for (name, amount) in values {
            if let Some(name) = name {
                *totals.entry(name).or_default() += amount;
            }
        }
        let mut ordered: Vec<(&str, f64)> = totals.into_iter().collect();
        ordered.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(b.0)));
        Self::from_ordered(ordered.into_iter().map(|(n, _)| n.to_string()).collect())
    }

    /// Most frequent first.
    fn by_count<'t>(values: impl Iterator<Item = Option<&'t str>>) -> Self {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for name in values.flatten() {
            *counts.entry(name).or_default() += 1;
        }
        let mut ordered: Vec<(&str, usize)> = counts.into_iter().collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        Self::from_ordered(ordered.into_iter().map(|(n, _)| n.to_string()).collect())
    }

    fn encode(&self, name: Option<&str>) -> f64 {
        name.and_then(|n| self.ranks.get(n))
            .copied()
            .unwrap_or(1.0 / (ENCODER_TOP_SIZE + 1) as f64)
    }
}

struct Encoders {
    encoding: FrequencyEncoding,
    category_sum: RankEncoder,
    description_sum: RankEncoder,
    category_count: RankEncoder,
    description_count: RankEncoder,
}

impl Encoders {
    fn fit(transactions: &[Transaction], encoding: FrequencyEncoding) -> Self {
        let mut encoders = Self {
            encoding,
            category_sum: RankEncoder::default(),
            description_sum: RankEncoder::default(),
            category_count: RankEncoder::default(),
            description_count: RankEncoder::default(),
        };

        if encoding.uses_sum() {
            encoders.category_sum =
                RankEncoder::by_sum(transactions.iter().map(|t| (category_of(t), t.amount)));
            encoders.description_sum =
                RankEncoder::by_sum(transactions.iter().map(|t| (description_of(t), t.amount)));
        }
        if encoding.uses_count() {
            encoders.category_count = RankEncoder::by_count(transactions.iter().map(category_of));
            encoders.description_count =
                RankEncoder::by_count(transactions.iter().map(description_of));
        }
        encoders
    }

    /// Encoded values in the column order of [`TransactionCleaner::columns`].
    fn encode(&self, transaction: &Transaction) -> Vec<f64> {
        let category = category_of(transaction);
        let description = description_of(transaction);

        let mut values = Vec::new();
        if self.encoding.uses_sum() {
            values.push(self.category_sum.encode(category));
            values.push(self.description_sum.encode(description));
        }
        if self.encoding.uses_count() {
            values.push(self.category_count.encode(category));
            values.push(self.description_count.encode(description));
        }
        values
    }
}

fn category_of(transaction: &Transaction) -> Option<&str> {
    transaction.category.as_deref()
}

fn description_of(transaction: &Transaction) -> Option<&str> {
    Some(transaction.description.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Period, SearchStrategy};

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn amounts(rows: &[Transaction]) -> Vec<f64> {
        rows.iter().map(|t| t.amount).collect()
    }

    #[test]
    fn test_refund_pair_is_dropped() {
        let rows = vec![
            Transaction::new(ymd(2024, 1, 1), -100.0, "SHOP"),
            Transaction::new(ymd(2024, 1, 3), 100.0, "SHOP REFUND"),
            Transaction::new(ymd(2024, 1, 4), -40.0, "CAFE"),
        ];
        assert_eq!(amounts(&drop_cancelling_pairs(rows)), vec![-40.0]);
    }

    #[test]
    fn test_unmatched_majority_survives() {
        let rows = vec![
            Transaction::new(ymd(2024, 1, 1), -100.0, "A"),
            Transaction::new(ymd(2024, 1, 2), -100.0, "B"),
            Transaction::new(ymd(2024, 1, 3), 100.0, "REFUND"),
            Transaction::new(ymd(2024, 1, 4), 250.0, "SALARY"),
        ];
        let kept = drop_cancelling_pairs(rows);
        assert_eq!(amounts(&kept), vec![-100.0, 250.0]);
    }

    #[test]
    fn test_clean_removes_income_rules_and_outliers() {
        let mut rule = RecurringRule::new(1, "Rent", -1000.0, ymd(2024, 1, 1), Period::months(1));
        rule.search_strategy = SearchStrategy::ByDescription {
            description: "LANDLORD".to_string(),
        };
        let rules = vec![rule];

        let history = vec![
            Transaction::new(ymd(2024, 1, 1), -1000.0, "LANDLORD"),
            Transaction::new(ymd(2024, 1, 2), 2500.0, "SALARY"),
            Transaction::new(ymd(2024, 1, 2), -10.0, "CAFE"),
            Transaction::new(ymd(2024, 1, 4), -20.0, "SHOP"),
            Transaction::new(ymd(2024, 1, 4), -30.0, "SHOP"),
            Transaction::new(ymd(2024, 1, 6), -400.0, "TV"),
        ];

        let cleaned = TransactionCleaner::new(&rules).clean(&history);

        // candidates -10, -20, -30, -400: floor at q=0.16 sits between -400 and -30
        assert!(cleaned.outlier_floor.unwrap() < -30.0);
        assert_eq!(amounts(&cleaned.transactions), vec![-10.0, -20.0, -30.0]);

        assert_eq!(cleaned.daily.first_date(), Some(ymd(2024, 1, 2)));
        assert_eq!(
            cleaned.daily.column("amount").unwrap(),
            vec![-10.0, 0.0, -50.0]
        );
    }

    #[test]
    fn test_empty_history_gives_empty_frame() {
        let cleaned = TransactionCleaner::new(&[]).clean(&[]);
        assert!(cleaned.daily.is_empty());
        assert_eq!(cleaned.outlier_floor, None);
    }

    #[test]
    fn test_clean_is_idempotent() {
        let history: Vec<Transaction> = (1..=28)
            .map(|d| {
                let amount = -(((d * 37) % 90) as f64) - 5.0;
                Transaction::new(ymd(2024, 2, d), amount, format!("SHOP{}", d % 4))
                    .with_category(if d % 2 == 0 { "Food" } else { "Fun" })
            })
            .chain(std::iter::once(Transaction::new(ymd(2024, 2, 10), 2000.0, "SALARY")))
            .collect();

        let cleaner = TransactionCleaner::new(&[]).with_frequency_encoding(FrequencyEncoding::CountSum);
        let first = cleaner.clean(&history);
        let second = cleaner.clean_with_floor(&first.transactions, first.outlier_floor);

        assert_eq!(first, second);
    }

    #[test]
    fn test_frequency_encoding_columns() {
        let history = vec![
            Transaction::new(ymd(2024, 1, 1), -50.0, "BIG").with_category("Food"),
            Transaction::new(ymd(2024, 1, 1), -5.0, "SMALL").with_category("Fun"),
            Transaction::new(ymd(2024, 1, 2), -6.0, "SMALL"),
        ];

        let cleaned = TransactionCleaner::new(&[])
            .with_outlier_quantile(0.0)
            .with_frequency_encoding(FrequencyEncoding::Sum)
            .clean(&history);

        // the -50 row sits exactly on the 0.0 quantile floor and is dropped
        assert_eq!(amounts(&cleaned.transactions), vec![-5.0, -6.0]);

        let frame = &cleaned.daily;
        assert_eq!(
            frame.columns(),
            &["amount", CATEGORY_SUM_COLUMN, DESCRIPTION_SUM_COLUMN]
        );
        // "Fun" is the only category: rank 0 → 21/21; the uncategorised row → 1/21
        let category = frame.column(CATEGORY_SUM_COLUMN).unwrap();
        assert!((category[0] - 1.0).abs() < 1e-12);
        assert!((category[1] - 1.0 / 21.0).abs() < 1e-12);

        let description = frame.column(DESCRIPTION_SUM_COLUMN).unwrap();
        assert!((description[1] - 1.0).abs() < 1e-12);
    }
}
