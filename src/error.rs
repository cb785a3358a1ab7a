/*!
 * Error handling for prescribing analysis operations
 *
 * Provides detailed error types with context, suggestions, and recovery guidance.
 * Nothing here is retried automatically: every error halts the step that raised it.
 */

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use serde::{Serialize, Deserialize};

/// Library result type
pub type Result<T> = std::result::Result<T, ReclassError>;

/// Error types with context and suggestions
#[derive(Error, Debug)]
pub enum ReclassError {
    /// File I/O errors with context
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
        context: ErrorContext,
    },

    /// CSV parsing errors with location information
    #[error("CSV parsing error at line {line:?}: {message}")]
    CsvParse {
        message: String,
        line: Option<usize>,
        context: ErrorContext,
    },

    /// Remote query failures (network, HTTP status, malformed query or response)
    #[error("Query error: {message}")]
    Query {
        message: String,
        status: Option<u16>,
        suggestion: Option<String>,
    },

    /// Cache entry could not be read back
    #[error("Cache entry '{path}' is unreadable: {message}")]
    Cache {
        path: PathBuf,
        message: String,
    },

    /// A column the caller asked for is not in the result set
    #[error("Missing column '{column}'")]
    MissingColumn {
        column: String,
        available: Vec<String>,
    },

    /// Data-shape errors: nulls in required fields, non-numeric measures
    #[error("Data validation error: {message}")]
    DataValidation {
        message: String,
        field: Option<String>,
        value: Option<String>,
        context: ErrorContext,
    },

    /// Date parsing errors with format hints
    #[error("Date parsing error: {message}")]
    DateParse {
        message: String,
        value: String,
        expected_format: String,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        suggestion: Option<String>,
    },

    /// Chart or map rendering errors
    #[error("Render error: {message}")]
    Render {
        message: String,
        format: RenderFormat,
    },

    /// Feature not enabled error
    #[error("Feature '{feature}' is not enabled")]
    FeatureNotEnabled {
        feature: String,
        enable_instruction: String,
    },

    /// Generic errors with custom message
    #[error("{message}")]
    Custom {
        message: String,
        suggestion: Option<String>,
    },
}

/// Error context providing additional information
#[derive(Debug, Default, Clone)]
pub struct ErrorContext {
    pub file_path: Option<PathBuf>,
    pub line_number: Option<usize>,
    pub column_name: Option<String>,
    pub scenario: Option<String>,
}

/// Artifact kind a render error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RenderFormat {
    #[default]
    TimeSeries,
    Deciles,
    Choropleth,
}

impl fmt::Display for RenderFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderFormat::TimeSeries => write!(f, "time series"),
            RenderFormat::Deciles => write!(f, "decile chart"),
            RenderFormat::Choropleth => write!(f, "choropleth"),
        }
    }
}

impl ReclassError {
    /// Create a missing column error listing the columns that do exist
    pub fn missing_column(column: &str, available: &[String]) -> Self {
        Self::MissingColumn {
            column: column.to_string(),
            available: available.to_vec(),
        }
    }

    /// Create an error for a null found where a value is required
    pub fn unexpected_null(field: &str, row: usize) -> Self {
        Self::DataValidation {
            message: format!("Unexpected null in required field '{}' at row {}", field, row),
            field: Some(field.to_string()),
            value: None,
            context: ErrorContext {
                line_number: Some(row),
                column_name: Some(field.to_string()),
                ..Default::default()
            },
        }
    }

    /// Create an error for a measure cell that is not numeric
    pub fn not_numeric(field: &str, value: &str, row: usize) -> Self {
        Self::DataValidation {
            message: format!("Value '{}' in column '{}' at row {} is not numeric", value, field, row),
            field: Some(field.to_string()),
            value: Some(value.to_string()),
            context: ErrorContext {
                line_number: Some(row),
                column_name: Some(field.to_string()),
                ..Default::default()
            },
        }
    }

    /// Create a date parsing error with format information
    pub fn date_parse_with_format(value: &str, expected_format: &str) -> Self {
        Self::DateParse {
            message: format!("Cannot parse '{}' as a month", value),
            value: value.to_string(),
            expected_format: expected_format.to_string(),
        }
    }

    /// Create a cache error for a file that exists but cannot be parsed
    pub fn corrupt_cache(path: PathBuf, message: impl Into<String>) -> Self {
        Self::Cache {
            path,
            message: message.into(),
        }
    }

    /// Create a query error from an HTTP status and the API's message
    pub fn query_status(status: u16, message: &str) -> Self {
        let suggestion = match status {
            400 => "Check the query text for syntax errors and unknown tables or columns",
            401 | 403 => "Check the access token and that it can run jobs in the configured project",
            404 => "Check the project id and dataset location",
            _ => "Check your network connection and the query service status",
        };

        Self::Query {
            message: format!("HTTP {}: {}", status, message),
            status: Some(status),
            suggestion: Some(suggestion.to_string()),
        }
    }

    /// Create a feature not enabled error
    pub fn feature_required(feature: &str) -> Self {
        let enable_instruction = match feature {
            "remote" => "Add 'cdreclass = { version = \"0.0.1\", features = [\"remote\"] }' to your Cargo.toml, or build the CLI with --features remote",
            _ => "Enable the required feature in your Cargo.toml",
        };

        Self::FeatureNotEnabled {
            feature: feature.to_string(),
            enable_instruction: enable_instruction.to_string(),
        }
    }

    /// Attach the scenario id to errors that carry a context
    pub fn in_scenario(mut self, id: &str) -> Self {
        match &mut self {
            Self::Io { context, .. }
            | Self::CsvParse { context, .. }
            | Self::DataValidation { context, .. } => {
                context.scenario = Some(id.to_string());
            }
            _ => {}
        }
        self
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            Self::Query { suggestion: Some(sug), .. } => {
                format!("{}\n\nSuggestion: {}", self, sug)
            }
            Self::Cache { path, .. } => {
                format!(
                    "{}\n\nSuggestion: delete '{}' to re-query, or set corrupt_cache_policy = \"refetch\"",
                    self,
                    path.display()
                )
            }
            Self::MissingColumn { available, .. } => {
                format!("{}\n\nAvailable columns: {}", self, available.join(", "))
            }
            Self::DateParse { expected_format, .. } => {
                format!("{}\n\nExpected format: {}", self, expected_format)
            }
            Self::Configuration { suggestion: Some(sug), .. } => {
                format!("{}\n\nSuggestion: {}", self, sug)
            }
            Self::FeatureNotEnabled { enable_instruction, .. } => {
                format!("{}\n\nTo enable: {}", self, enable_instruction)
            }
            Self::Custom { suggestion: Some(sug), .. } => {
                format!("{}\n\nSuggestion: {}", self, sug)
            }
            _ => self.to_string(),
        }
    }
}

// Convenience conversions
impl From<std::io::Error> for ReclassError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
            context: ErrorContext::default(),
        }
    }
}

impl From<csv::Error> for ReclassError {
    fn from(err: csv::Error) -> Self {
        let line = err.position().map(|pos| pos.line() as usize);

        Self::CsvParse {
            message: err.to_string(),
            line,
            context: ErrorContext::default(),
        }
    }
}

impl From<serde_json::Error> for ReclassError {
    fn from(err: serde_json::Error) -> Self {
        Self::Query {
            message: format!("Malformed response: {}", err),
            status: None,
            suggestion: None,
        }
    }
}

impl From<toml::de::Error> for ReclassError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration {
            message: format!("Failed to parse TOML: {}", err),
            suggestion: Some("Check that the file is valid TOML format".to_string()),
        }
    }
}
