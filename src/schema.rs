/*!
 * Schema definitions for query result sets
 *
 * Each analysis step expects certain columns in the result set it is given.
 * A `ResultSchema` lists those expectations so that a mismatch is reported
 * once, up front, with the full list of missing or mistyped columns.
 */

use crate::data_types::{ColumnType, ResultSet};
use crate::{ReclassError, Result};

/// What kind of values an expected column must hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    /// Calendar month (date, or text that coerces to one)
    Month,
    /// Summable measure
    Measure,
    /// Grouping key compared by text
    Key,
}

impl ColumnRole {
    fn accepts(&self, column_type: ColumnType) -> bool {
        match self {
            ColumnRole::Month => matches!(column_type, ColumnType::Date | ColumnType::Text),
            ColumnRole::Measure => column_type.is_numeric(),
            ColumnRole::Key => true,
        }
    }
}

/// One expected column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedColumn {
    pub name: String,
    pub role: ColumnRole,
}

/// Expected shape of a result set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSchema {
    pub columns: Vec<ExpectedColumn>,
}

impl ResultSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn month(mut self, name: &str) -> Self {
        self.push(name, ColumnRole::Month);
        self
    }

    pub fn measure(mut self, name: &str) -> Self {
        self.push(name, ColumnRole::Measure);
        self
    }

    pub fn key(mut self, name: &str) -> Self {
        self.push(name, ColumnRole::Key);
        self
    }

    fn push(&mut self, name: &str, role: ColumnRole) {
        if !self.columns.iter().any(|c| c.name == name) {
            self.columns.push(ExpectedColumn { name: name.to_string(), role });
        }
    }

    /// Column names in declaration order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Check a result set against the schema
    ///
    /// An empty result set only has its column names checked, since types
    /// cannot be inferred from zero rows.
    pub fn validate(&self, rs: &ResultSet) -> Result<()> {
        let mut missing = Vec::new();
        let mut mistyped = Vec::new();

        for expected in &self.columns {
            match rs.column(&expected.name) {
                Ok(column) => {
                    if !rs.is_empty() && !expected.role.accepts(column.column_type) {
                        mistyped.push(format!("{} ({:?})", expected.name, column.column_type));
                    }
                }
                Err(_) => missing.push(expected.name.clone()),
            }
        }

        if let Some(first) = missing.first() {
            if missing.len() == 1 {
                return Err(ReclassError::missing_column(first, &rs.column_names()));
            }
            return Err(ReclassError::DataValidation {
                message: format!("Missing columns: {}", missing.join(", ")),
                field: None,
                value: None,
                context: Default::default(),
            });
        }

        if !mistyped.is_empty() {
            return Err(ReclassError::DataValidation {
                message: format!("Columns have unexpected types: {}", mistyped.join(", ")),
                field: None,
                value: None,
                context: Default::default(),
            });
        }

        Ok(())
    }
}

/// Map a BigQuery schema field type to a column type
///
/// Returns `None` for types this crate does not read (RECORD, BYTES, GEOGRAPHY...).
pub fn bigquery_column_type(field_type: &str) -> Option<ColumnType> {
    match field_type.to_ascii_uppercase().as_str() {
        "STRING" | "BOOLEAN" | "BOOL" => Some(ColumnType::Text),
        "INTEGER" | "INT64" => Some(ColumnType::Integer),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => Some(ColumnType::Float),
        "DATE" | "TIMESTAMP" | "DATETIME" => Some(ColumnType::Date),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::Value;

    fn rs() -> ResultSet {
        ResultSet::from_inferred(
            vec!["month".into(), "pct".into(), "total_gaba".into()],
            vec![vec![Value::infer("2019-01-01"), Value::infer("00C"), Value::infer("12.5")]],
        )
        .unwrap()
    }

    #[test]
    fn test_schema_accepts_matching_result() {
        let schema = ResultSchema::new().month("month").key("pct").measure("total_gaba");
        assert!(schema.validate(&rs()).is_ok());
        assert_eq!(schema.column_names(), vec!["month", "pct", "total_gaba"]);
    }

    #[test]
    fn test_schema_reports_missing() {
        let schema = ResultSchema::new().month("month").measure("total_items");
        assert!(matches!(schema.validate(&rs()), Err(ReclassError::MissingColumn { .. })));

        let schema = ResultSchema::new().measure("a").measure("b");
        let err = schema.validate(&rs()).unwrap_err();
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn test_schema_reports_mistyped_measure() {
        let schema = ResultSchema::new().measure("pct");
        assert!(matches!(schema.validate(&rs()), Err(ReclassError::DataValidation { .. })));
    }

    #[test]
    fn test_bigquery_types() {
        assert_eq!(bigquery_column_type("INT64"), Some(ColumnType::Integer));
        assert_eq!(bigquery_column_type("numeric"), Some(ColumnType::Float));
        assert_eq!(bigquery_column_type("TIMESTAMP"), Some(ColumnType::Date));
        assert_eq!(bigquery_column_type("RECORD"), None);
    }
}
