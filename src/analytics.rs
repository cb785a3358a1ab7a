/*!
 * Aggregation and summary statistics for prescribing result sets
 *
 * Everything here is a pure function of its inputs: group rows by month,
 * sum a measure, compare the months either side of a legislation change,
 * and compute per-month percentiles across regions.
 */

use std::collections::BTreeMap;

use chrono::{Months, NaiveDate};
use tracing::debug;

use crate::data_types::{first_of_month, numeric_cell, EqFilter, ResultSet, TimeSeries, Value};
use crate::{ReclassError, Result};

/// Ratio of breaching quantity to total quantity
///
/// `None` when the denominator is zero, negative or not finite, matching a
/// safe divide that yields null instead of failing.
pub fn breach_ratio(breach_quantity: f64, total_quantity: f64) -> Option<f64> {
    if total_quantity > 0.0 && total_quantity.is_finite() && breach_quantity.is_finite() {
        Some(breach_quantity / total_quantity)
    } else {
        None
    }
}

/// Read the month cell of a row, failing on nulls and non-dates
fn month_cell(value: &Value, field: &str, row: usize) -> Result<NaiveDate> {
    match value {
        Value::Date(d) => Ok(first_of_month(*d)),
        Value::Null => Err(ReclassError::unexpected_null(field, row)),
        other => Err(ReclassError::DataValidation {
            message: format!(
                "Column '{}' holds '{}' at row {}; coerce it to months first",
                field, other, row
            ),
            field: Some(field.to_string()),
            value: Some(other.to_string()),
            context: Default::default(),
        }),
    }
}

/// Sum a measure by month, optionally after an equality filter
///
/// The output is strictly increasing by month and its total equals the
/// measure's sum over the (filtered) input. Null measures contribute nothing.
pub fn monthly_totals(
    rs: &ResultSet,
    time_column: &str,
    measure_column: &str,
    filter: Option<&EqFilter>,
) -> Result<TimeSeries> {
    let time_idx = rs.column_index(time_column)?;
    let measure_idx = rs.column_index(measure_column)?;
    let filter_idx = filter.map(|f| rs.column_index(&f.column)).transpose()?;

    let mut buckets: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for (row_idx, row) in rs.rows().iter().enumerate() {
        if let (Some(f), Some(idx)) = (filter, filter_idx) {
            if !row[idx].matches_str(&f.value) {
                continue;
            }
        }
        let month = month_cell(&row[time_idx], time_column, row_idx)?;
        let value = numeric_cell(&row[measure_idx], measure_column, row_idx)?;
        *buckets.entry(month).or_insert(0.0) += value.unwrap_or(0.0);
    }

    debug!(
        measure = measure_column,
        filter = ?filter.map(|f| f.to_string()),
        months = buckets.len(),
        "aggregated by month"
    );
    Ok(TimeSeries::new(buckets.into_iter().collect()))
}

/// One monthly series per distinct value of `key_column`
pub fn monthly_totals_by(
    rs: &ResultSet,
    time_column: &str,
    key_column: &str,
    measure_column: &str,
) -> Result<BTreeMap<String, TimeSeries>> {
    let mut series = BTreeMap::new();
    for key in rs.distinct_values(key_column)? {
        let filter = EqFilter::new(key_column, key.clone());
        series.insert(key, monthly_totals(rs, time_column, measure_column, Some(&filter))?);
    }
    Ok(series)
}

/// Before/after comparison around a change date
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSummary {
    pub change_month: NaiveDate,
    pub window_months: u32,
    pub months_before: usize,
    pub months_after: usize,
    pub mean_before: Option<f64>,
    pub mean_after: Option<f64>,
    /// Percentage change from the before mean to the after mean
    pub percent_change: Option<f64>,
}

impl ChangeSummary {
    /// Print formatted summary
    pub fn print_summary(&self, label: &str) {
        let fmt = |v: Option<f64>| v.map(|x| format!("{:.1}", x)).unwrap_or_else(|| "n/a".to_string());
        println!("=== {} ===", label);
        println!("Change month: {}", self.change_month.format("%Y-%m"));
        println!(
            "Mean of {} months before: {} ({} months present)",
            self.window_months,
            fmt(self.mean_before),
            self.months_before
        );
        println!(
            "Mean of {} months from change: {} ({} months present)",
            self.window_months,
            fmt(self.mean_after),
            self.months_after
        );
        match self.percent_change {
            Some(p) => println!("Change: {:+.1}%", p),
            None => println!("Change: n/a"),
        }
    }
}

/// Compare the `window_months` before the change month with the same span from it
pub fn change_summary(series: &TimeSeries, change_date: NaiveDate, window_months: u32) -> ChangeSummary {
    let change_month = first_of_month(change_date);
    let before_start = change_month
        .checked_sub_months(Months::new(window_months))
        .unwrap_or(NaiveDate::MIN);
    let after_end = change_month
        .checked_add_months(Months::new(window_months))
        .unwrap_or(NaiveDate::MAX);

    let before: Vec<f64> = series
        .points
        .iter()
        .filter(|(d, _)| *d >= before_start && *d < change_month)
        .map(|(_, v)| *v)
        .collect();
    let after: Vec<f64> = series
        .points
        .iter()
        .filter(|(d, _)| *d >= change_month && *d < after_end)
        .map(|(_, v)| *v)
        .collect();

    let mean = |xs: &[f64]| {
        if xs.is_empty() {
            None
        } else {
            Some(xs.iter().sum::<f64>() / xs.len() as f64)
        }
    };
    let mean_before = mean(&before);
    let mean_after = mean(&after);
    let percent_change = match (mean_before, mean_after) {
        (Some(b), Some(a)) if b != 0.0 => Some((a - b) / b * 100.0),
        _ => None,
    };

    ChangeSummary {
        change_month,
        window_months,
        months_before: before.len(),
        months_after: after.len(),
        mean_before,
        mean_after,
        percent_change,
    }
}

/// Deciles 10..=90
pub const DECILES: [u32; 9] = [10, 20, 30, 40, 50, 60, 70, 80, 90];

/// Outer percentiles 1..=9 and 91..=99
pub fn outer_percentiles() -> Vec<u32> {
    (1..10).chain(91..100).collect()
}

/// Linearly interpolated percentile of sorted values
pub fn percentile(sorted: &[f64], rank: u32) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = rank.min(100) as f64 / 100.0;
    let pos = rank * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Per-month percentiles of a measure across rows; one series per rank
///
/// Null values are skipped. Months with no non-null values are omitted.
pub fn percentiles_by_month(
    rs: &ResultSet,
    time_column: &str,
    value_column: &str,
    ranks: &[u32],
) -> Result<BTreeMap<u32, TimeSeries>> {
    let time_idx = rs.column_index(time_column)?;
    let value_idx = rs.column_index(value_column)?;

    let mut by_month: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
    for (row_idx, row) in rs.rows().iter().enumerate() {
        let month = month_cell(&row[time_idx], time_column, row_idx)?;
        if let Some(v) = numeric_cell(&row[value_idx], value_column, row_idx)? {
            by_month.entry(month).or_default().push(v);
        }
    }

    let mut result: BTreeMap<u32, TimeSeries> =
        ranks.iter().map(|r| (*r, TimeSeries::default())).collect();
    for (month, mut values) in by_month {
        values.sort_by(|a, b| a.total_cmp(b));
        for rank in ranks {
            if let (Some(p), Some(series)) = (percentile(&values, *rank), result.get_mut(rank)) {
                series.points.push((month, p));
            }
        }
    }
    Ok(result)
}
