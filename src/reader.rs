/*!
 * CSV reader and writer for result sets
 *
 * Cache entries are plain CSV files with a header row of column names.
 * Column types are inferred on read, so a result set written and read back
 * compares equal to any other read of the same file.
 */

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Instant;

use csv::{ReaderBuilder, WriterBuilder};
use tracing::debug;

use crate::data_types::{ResultSet, Value};
use crate::{ErrorContext, ReclassError, Result};

/// Reads result sets from CSV
#[derive(Debug, Clone)]
pub struct ResultSetReader {
    delimiter: u8,
}

impl Default for ResultSetReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultSetReader {
    pub fn new() -> Self {
        Self { delimiter: b',' }
    }

    /// Set the field delimiter
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Load a result set from a CSV file
    pub fn read_path<P: AsRef<Path>>(&self, path: P) -> Result<ResultSet> {
        let path = path.as_ref();
        let start_time = Instant::now();
        let file = File::open(path).map_err(|e| ReclassError::Io {
            message: format!("Cannot open '{}': {}", path.display(), e),
            source: e,
            context: ErrorContext {
                file_path: Some(path.to_path_buf()),
                ..Default::default()
            },
        })?;

        let rs = self.read_from(file, Some(path))?;

        debug!(
            path = %path.display(),
            rows = rs.len(),
            columns = rs.columns().len(),
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "read result set"
        );
        Ok(rs)
    }

    /// Load a result set from any reader; `origin` is used for error context only
    pub fn read_from<R: Read>(&self, input: R, origin: Option<&Path>) -> Result<ResultSet> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .delimiter(self.delimiter)
            .from_reader(input);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| csv_error(e, origin))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        validate_headers(&headers, origin)?;

        let mut rows = Vec::new();
        for (idx, result) in reader.records().enumerate() {
            let record = result.map_err(|e| ReclassError::CsvParse {
                message: e.to_string(),
                line: Some(idx + 2), // +2 for header and 0-based index
                context: ErrorContext {
                    file_path: origin.map(Path::to_path_buf),
                    line_number: Some(idx + 2),
                    ..Default::default()
                },
            })?;
            rows.push(record.iter().map(Value::infer).collect());
        }

        ResultSet::from_inferred(headers, rows)
    }
}

fn csv_error(err: csv::Error, origin: Option<&Path>) -> ReclassError {
    let mut error = ReclassError::from(err);
    if let ReclassError::CsvParse { context, .. } = &mut error {
        context.file_path = origin.map(Path::to_path_buf);
    }
    error
}

/// Reject empty, blank or duplicated header names
fn validate_headers(headers: &[String], origin: Option<&Path>) -> Result<()> {
    let context = || ErrorContext {
        file_path: origin.map(Path::to_path_buf),
        line_number: Some(1),
        ..Default::default()
    };

    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        return Err(ReclassError::CsvParse {
            message: "Missing header row".to_string(),
            line: Some(1),
            context: context(),
        });
    }

    let mut seen = HashSet::new();
    for header in headers {
        if header.is_empty() {
            return Err(ReclassError::CsvParse {
                message: "Blank column name in header".to_string(),
                line: Some(1),
                context: context(),
            });
        }
        if !seen.insert(header.as_str()) {
            return Err(ReclassError::CsvParse {
                message: format!("Duplicate column name '{}'", header),
                line: Some(1),
                context: context(),
            });
        }
    }
    Ok(())
}

/// Write a result set as CSV with a header row
pub fn write_csv<W: Write>(rs: &ResultSet, output: W) -> Result<()> {
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(output);
    writer.write_record(rs.columns().iter().map(|c| c.name.as_str()))?;
    for row in rs.rows() {
        writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Write a result set to a CSV file, replacing any existing file
pub fn write_csv_path<P: AsRef<Path>>(rs: &ResultSet, path: P) -> Result<()> {
    let file = File::create(path.as_ref())?;
    write_csv(rs, file)
}
