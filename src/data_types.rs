/*!
 * Data type definitions for prescribing result sets
 *
 * A result set is a small typed table: one row per (month, grouping keys)
 * combination returned by the query engine, with numeric measures such as
 * item counts, cost, dose quantity or a breach ratio.
 */

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{ReclassError, Result};

/// Format used for month cells in cache files and chart labels
pub const MONTH_FORMAT: &str = "%Y-%m-%d";

/// A single cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the cell; `None` for nulls, text and dates
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Infer a typed value from a raw text cell
    ///
    /// Empty text is null, and so is a non-finite number (`NaN`, `inf`),
    /// which is how an IEEE division by zero reaches a cache file. Digits
    /// with a leading zero, such as BNF code `040702040`, stay text.
    pub fn infer(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Value::Null;
        }
        if !has_leading_zero(raw) {
            if let Ok(i) = raw.parse::<i64>() {
                return Value::Int(i);
            }
            if let Ok(f) = raw.parse::<f64>() {
                return if f.is_finite() { Value::Float(f) } else { Value::Null };
            }
        }
        if let Ok(d) = NaiveDate::parse_from_str(raw, MONTH_FORMAT) {
            return Value::Date(d);
        }
        Value::Text(raw.to_string())
    }

    /// Whether the cell's textual form equals `expected`
    ///
    /// Codes such as "123" may be inferred as integers on read, so filters
    /// compare on text rather than on the typed value.
    pub fn matches_str(&self, expected: &str) -> bool {
        match self {
            Value::Null => false,
            Value::Text(s) => s == expected,
            other => other.to_string() == expected,
        }
    }
}

/// `0` followed by another digit, after an optional sign
fn has_leading_zero(raw: &str) -> bool {
    let digits = raw.strip_prefix(['-', '+']).unwrap_or(raw).as_bytes();
    digits.len() > 1 && digits[0] == b'0' && digits[1].is_ascii_digit()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d.format(MONTH_FORMAT)),
        }
    }
}

/// Declared type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Date,
}

impl ColumnType {
    /// Narrowest type that covers every non-null value in `values`
    pub fn infer<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut inferred: Option<ColumnType> = None;
        for value in values {
            let this = match value {
                Value::Null => continue,
                Value::Int(_) => ColumnType::Integer,
                Value::Float(_) => ColumnType::Float,
                Value::Date(_) => ColumnType::Date,
                Value::Text(_) => ColumnType::Text,
            };
            inferred = Some(match (inferred, this) {
                (None, t) => t,
                (Some(a), b) if a == b => a,
                (Some(ColumnType::Integer), ColumnType::Float)
                | (Some(ColumnType::Float), ColumnType::Integer) => ColumnType::Float,
                _ => ColumnType::Text,
            });
        }
        inferred.unwrap_or(ColumnType::Text)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }
}

/// A named, typed column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self { name: name.into(), column_type }
    }
}

/// Equality filter on a categorical column, e.g. `chemical=Zopiclone`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EqFilter {
    pub column: String,
    pub value: String,
}

impl EqFilter {
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self { column: column.into(), value: value.into() }
    }
}

impl FromStr for EqFilter {
    type Err = ReclassError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((column, value)) if !column.trim().is_empty() => {
                Ok(EqFilter::new(column.trim(), value.trim()))
            }
            _ => Err(ReclassError::Configuration {
                message: format!("Invalid filter '{}'", s),
                suggestion: Some("Use COLUMN=VALUE, e.g. chemical=Zopiclone".to_string()),
            }),
        }
    }
}

impl fmt::Display for EqFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.column, self.value)
    }
}

/// Tabular result of one query
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultSet {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// Build a result set, checking every row has one value per column
    pub fn new(columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Result<Self> {
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(ReclassError::DataValidation {
                    message: format!(
                        "Row {} has {} values but the result set has {} columns",
                        idx,
                        row.len(),
                        columns.len()
                    ),
                    field: None,
                    value: None,
                    context: Default::default(),
                });
            }
        }
        Ok(Self { columns, rows })
    }

    /// Build a result set from column names and raw rows, inferring column types
    ///
    /// Cells of a column that infers as text are stored as text, so a code
    /// column mixing `15N` and `123` holds `Text("123")`.
    pub fn from_inferred(names: Vec<String>, mut rows: Vec<Vec<Value>>) -> Result<Self> {
        let columns: Vec<Column> = names
            .into_iter()
            .enumerate()
            .map(|(idx, name)| {
                let column_type = ColumnType::infer(rows.iter().filter_map(|r| r.get(idx)));
                Column::new(name, column_type)
            })
            .collect();

        for (idx, column) in columns.iter().enumerate() {
            if column.column_type != ColumnType::Text {
                continue;
            }
            for cell in rows.iter_mut().filter_map(|r| r.get_mut(idx)) {
                if !matches!(cell, Value::Null | Value::Text(_)) {
                    *cell = Value::Text(cell.to_string());
                }
            }
        }
        Self::new(columns, rows)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Position of a column, or `MissingColumn`
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| ReclassError::missing_column(name, &self.column_names()))
    }

    pub fn column(&self, name: &str) -> Result<&Column> {
        let idx = self.column_index(name)?;
        Ok(&self.columns[idx])
    }

    /// Iterate one column's values
    pub fn values<'a>(&'a self, name: &str) -> Result<impl Iterator<Item = &'a Value> + 'a> {
        let idx = self.column_index(name)?;
        Ok(self.rows.iter().map(move |r| &r[idx]))
    }

    /// Rename a column in place
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let idx = self.column_index(from)?;
        self.columns[idx].name = to.to_string();
        Ok(())
    }

    /// Coerce a column to dates normalised to the first of the month
    ///
    /// Must run before any grouping or plotting on that column. A null cell
    /// is a data-shape error.
    pub fn coerce_month(&mut self, name: &str) -> Result<()> {
        let idx = self.column_index(name)?;
        for (row_idx, row) in self.rows.iter_mut().enumerate() {
            let month = match &row[idx] {
                Value::Null => return Err(ReclassError::unexpected_null(name, row_idx)),
                Value::Date(d) => first_of_month(*d),
                other => parse_month(&other.to_string())?,
            };
            row[idx] = Value::Date(month);
        }
        self.columns[idx].column_type = ColumnType::Date;
        Ok(())
    }

    /// Rows whose `filter.column` equals `filter.value`
    pub fn filter_eq(&self, filter: &EqFilter) -> Result<ResultSet> {
        let idx = self.column_index(&filter.column)?;
        let rows = self
            .rows
            .iter()
            .filter(|r| r[idx].matches_str(&filter.value))
            .cloned()
            .collect();
        Ok(ResultSet { columns: self.columns.clone(), rows })
    }

    /// Rows falling in a single month
    pub fn filter_month(&self, name: &str, month: NaiveDate) -> Result<ResultSet> {
        let idx = self.column_index(name)?;
        let month = first_of_month(month);
        let rows = self
            .rows
            .iter()
            .filter(|r| r[idx].as_date().map(first_of_month) == Some(month))
            .cloned()
            .collect();
        Ok(ResultSet { columns: self.columns.clone(), rows })
    }

    /// First `n` rows
    pub fn head(&self, n: usize) -> ResultSet {
        ResultSet {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Sorted distinct textual values of a column, nulls excluded
    pub fn distinct_values(&self, name: &str) -> Result<Vec<String>> {
        let set: BTreeSet<String> = self
            .values(name)?
            .filter(|v| !v.is_null())
            .map(|v| v.to_string())
            .collect();
        Ok(set.into_iter().collect())
    }

    /// Sum of a numeric column, nulls skipped
    pub fn column_sum(&self, name: &str) -> Result<f64> {
        let mut total = 0.0;
        for (row_idx, value) in self.values(name)?.enumerate() {
            total += numeric_cell(value, name, row_idx)?.unwrap_or(0.0);
        }
        Ok(total)
    }

    /// Append a ratio column `num / den`, null where the denominator is zero or null
    pub fn derive_ratio(&mut self, numerator: &str, denominator: &str, output: &str) -> Result<()> {
        let num_idx = self.column_index(numerator)?;
        let den_idx = self.column_index(denominator)?;
        if self.has_column(output) {
            return Err(ReclassError::DataValidation {
                message: format!("Column '{}' already exists", output),
                field: Some(output.to_string()),
                value: None,
                context: Default::default(),
            });
        }

        for (row_idx, row) in self.rows.iter_mut().enumerate() {
            let num = numeric_cell(&row[num_idx], numerator, row_idx)?;
            let den = numeric_cell(&row[den_idx], denominator, row_idx)?;
            let ratio = match (num, den) {
                (Some(n), Some(d)) => crate::analytics::breach_ratio(n, d),
                _ => None,
            };
            row.push(ratio.map(Value::Float).unwrap_or(Value::Null));
        }
        self.columns.push(Column::new(output, ColumnType::Float));
        Ok(())
    }
}

/// Read a measure cell as a number; text is an error, null is `None`
pub(crate) fn numeric_cell(value: &Value, field: &str, row: usize) -> Result<Option<f64>> {
    match value {
        Value::Null => Ok(None),
        Value::Int(_) | Value::Float(_) => Ok(value.as_f64()),
        other => Err(ReclassError::not_numeric(field, &other.to_string(), row)),
    }
}

/// Normalise a date to the first day of its month
pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Parse a month cell in any of the forms the query engine or a cache file produces
///
/// Accepts `YYYY-MM-DD`, `YYYY-MM`, and date-times such as
/// `2014-05-01 00:00:00+00:00` or `2014-05-01T00:00:00Z`. The result is
/// always the first of the month.
pub fn parse_month(raw: &str) -> Result<NaiveDate> {
    let raw = raw.trim();

    if let Ok(d) = NaiveDate::parse_from_str(raw, MONTH_FORMAT) {
        return Ok(first_of_month(d));
    }
    if let Ok(d) = NaiveDate::parse_from_str(&format!("{}-01", raw), MONTH_FORMAT) {
        return Ok(first_of_month(d));
    }
    if raw.len() > 10 && raw.is_char_boundary(10) {
        let (date_part, rest) = raw.split_at(10);
        if rest.starts_with(' ') || rest.starts_with('T') {
            if let Ok(d) = NaiveDate::parse_from_str(date_part, MONTH_FORMAT) {
                return Ok(first_of_month(d));
            }
        }
    }

    Err(ReclassError::date_parse_with_format(raw, "YYYY-MM-DD, YYYY-MM, or YYYY-MM-DD HH:MM:SS"))
}

/// Ordered (month, value) pairs produced by aggregation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeSeries {
    pub points: Vec<(NaiveDate, f64)>,
}

impl TimeSeries {
    pub fn new(points: Vec<(NaiveDate, f64)>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.points.iter().map(|(_, v)| v).sum()
    }

    pub fn max_value(&self) -> Option<f64> {
        self.points.iter().map(|(_, v)| *v).reduce(f64::max)
    }

    pub fn first_month(&self) -> Option<NaiveDate> {
        self.points.first().map(|(d, _)| *d)
    }

    pub fn last_month(&self) -> Option<NaiveDate> {
        self.points.last().map(|(d, _)| *d)
    }

    pub fn value_at(&self, month: NaiveDate) -> Option<f64> {
        let month = first_of_month(month);
        self.points.iter().find(|(d, _)| *d == month).map(|(_, v)| *v)
    }

    /// Print the series as a two-column table
    pub fn print_table(&self, measure: &str) {
        println!("{:<12} {:>18}", "month", measure);
        for (month, value) in &self.points {
            println!("{:<12} {:>18.2}", month.format(MONTH_FORMAT), value);
        }
        println!("{:<12} {:>18.2}", "total", self.total());
    }
}
