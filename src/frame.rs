//! Gapless daily tables shared by the cleaner, the forecaster and the compositor.

use crate::error::{ForecastError, Result};
use crate::utils::next_day;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One value per calendar day.
pub type DailySeries = BTreeMap<NaiveDate, f64>;

/// Append-only, multi-column table with exactly one row per consecutive calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyFrame {
    columns: Vec<String>,
    dates: Vec<NaiveDate>,
    rows: Vec<Vec<f64>>,
}

impl DailyFrame {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            dates: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Caller guarantees `dates` are consecutive days and every row matches `columns`.
    pub(crate) fn from_parts(columns: Vec<String>, dates: Vec<NaiveDate>, rows: Vec<Vec<f64>>) -> Self {
        debug_assert_eq!(dates.len(), rows.len());
        Self {
            columns,
            dates,
            rows,
        }
    }

    /// Builds a single-column frame, filling days missing from `series` with zero.
    pub fn from_series(column: &str, series: &DailySeries) -> Self {
        let mut frame = Self::new(vec![column.to_string()]);
        if let (Some((&first, _)), Some((&last, _))) = (series.first_key_value(), series.last_key_value()) {
            for date in first.iter_days().take_while(|d| *d <= last) {
                let value = series.get(&date).copied().unwrap_or(0.0);
                frame.dates.push(date);
                frame.rows.push(vec![value]);
            }
        }
        frame
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    pub fn row(&self, index: usize) -> &[f64] {
        &self.rows[index]
    }

    pub fn value(&self, row: usize, column: usize) -> f64 {
        self.rows[row][column]
    }

    /// Appends the next day. Rows are never modified once pushed.
    pub fn push_row(&mut self, date: NaiveDate, values: Vec<f64>) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(ForecastError::validation(
                "daily frame",
                format!(
                    "row for {} has {} values, frame has {} columns",
                    date,
                    values.len(),
                    self.columns.len()
                ),
            ));
        }

        if let Some(last) = self.last_date() {
            if next_day(last) != Some(date) {
                return Err(ForecastError::validation(
                    "daily frame",
                    format!("row for {} does not follow {}", date, last),
                ));
            }
        }

        self.dates.push(date);
        self.rows.push(values);
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let index = self.column_index(name)?;
        Some(self.rows.iter().map(|row| row[index]).collect())
    }

    pub fn series(&self, name: &str) -> Option<DailySeries> {
        let index = self.column_index(name)?;
        Some(
            self.dates
                .iter()
                .zip(&self.rows)
                .map(|(date, row)| (*date, row[index]))
                .collect(),
        )
    }

    /// Rows dated before `cutoff`, and the rest.
    pub fn split_at_date(&self, cutoff: NaiveDate) -> (DailyFrame, DailyFrame) {
        let split = self.dates.partition_point(|d| *d < cutoff);
        let head = DailyFrame {
            columns: self.columns.clone(),
            dates: self.dates[..split].to_vec(),
            rows: self.rows[..split].to_vec(),
        };
        let tail = DailyFrame {
            columns: self.columns.clone(),
            dates: self.dates[split..].to_vec(),
            rows: self.rows[split..].to_vec(),
        };
        (head, tail)
    }
}
