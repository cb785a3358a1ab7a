/*!
 * Remote query execution
 *
 * The analysis only needs one thing from the query engine: run a SQL text
 * and hand back a table. `QueryBackend` is that seam. `BigQueryClient`
 * implements it against the BigQuery REST API (behind the `remote`
 * feature); `CacheOnlyBackend` refuses every query, for offline runs where
 * all cache files are already present.
 */

use chrono::{DateTime, NaiveDate};
use serde::Deserialize;

use crate::data_types::{Column, ColumnType, ResultSet, Value, MONTH_FORMAT};
use crate::schema::bigquery_column_type;
use crate::{ReclassError, Result};

#[cfg(feature = "remote")]
use std::time::{Duration, Instant};
#[cfg(feature = "remote")]
use tracing::{debug, info};

#[cfg(all(feature = "remote", feature = "progress"))]
use indicatif::{ProgressBar, ProgressStyle};

/// Something that can execute a query text and return a result set
pub trait QueryBackend {
    /// Run the query; failures are surfaced, never retried
    fn run(&self, sql: &str) -> Result<ResultSet>;

    /// Short name used in log lines
    fn name(&self) -> &str;
}

impl<T: QueryBackend + ?Sized> QueryBackend for &T {
    fn run(&self, sql: &str) -> Result<ResultSet> {
        (**self).run(sql)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<T: QueryBackend + ?Sized> QueryBackend for Box<T> {
    fn run(&self, sql: &str) -> Result<ResultSet> {
        (**self).run(sql)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Backend for offline use: every query is an error
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheOnlyBackend;

impl QueryBackend for CacheOnlyBackend {
    fn run(&self, _sql: &str) -> Result<ResultSet> {
        Err(ReclassError::Query {
            message: "No remote backend available and the cache file does not exist".to_string(),
            status: None,
            suggestion: Some(
                "Build with --features remote and configure project_id and access_token, or supply the cache file"
                    .to_string(),
            ),
        })
    }

    fn name(&self) -> &str {
        "cache-only"
    }
}

/// Connection settings for the BigQuery REST API
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Project that runs (and is billed for) the query jobs
    pub project_id: Option<String>,
    /// Dataset location, e.g. "EU"
    pub location: Option<String>,
    /// OAuth bearer token
    pub access_token: Option<String>,
    /// API root, overridable for testing
    pub api_endpoint: String,
    /// Overall time budget for one query, including paging
    pub timeout_seconds: u64,
    /// Rows requested per page
    pub page_size: u32,
    /// Custom user agent string
    pub user_agent: Option<String>,
    /// Whether to show a spinner while waiting
    pub show_progress: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            location: None,
            access_token: None,
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
            timeout_seconds: 600,
            page_size: 50_000,
            user_agent: Some(format!("cdreclass/{}", env!("CARGO_PKG_VERSION"))),
            show_progress: true,
        }
    }
}

/// BigQuery v2 REST root
pub const DEFAULT_API_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";

// --- Wire types ---

/// Body of a `jobs.query` or `jobs.getQueryResults` response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub schema: Option<TableSchema>,
    pub job_reference: Option<JobReference>,
    pub page_token: Option<String>,
    #[serde(default)]
    pub rows: Vec<TableRow>,
    #[serde(default)]
    pub job_complete: bool,
    pub total_rows: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReference {
    pub project_id: String,
    pub job_id: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableRow {
    #[serde(default)]
    pub f: Vec<TableCell>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableCell {
    pub v: serde_json::Value,
}

/// Error envelope returned with non-2xx statuses
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ApiError,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
}

/// Collects the pages of one query into a result set
#[derive(Debug, Default)]
pub struct PageAccumulator {
    fields: Vec<(String, String, ColumnType)>,
    rows: Vec<Vec<Value>>,
}

impl PageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one response page; the first page carrying a schema fixes the columns
    pub fn push_page(&mut self, page: &QueryResponse) -> Result<()> {
        if self.fields.is_empty() {
            if let Some(schema) = &page.schema {
                for field in &schema.fields {
                    let column_type = bigquery_column_type(&field.field_type).ok_or_else(|| {
                        ReclassError::Query {
                            message: format!(
                                "Column '{}' has unsupported type {}",
                                field.name, field.field_type
                            ),
                            status: None,
                            suggestion: Some("Select scalar columns only".to_string()),
                        }
                    })?;
                    self.fields.push((field.name.clone(), field.field_type.to_ascii_uppercase(), column_type));
                }
            }
        }

        for (row_idx, row) in page.rows.iter().enumerate() {
            if row.f.len() != self.fields.len() {
                return Err(ReclassError::Query {
                    message: format!(
                        "Row {} has {} cells but the schema has {} fields",
                        self.rows.len() + row_idx,
                        row.f.len(),
                        self.fields.len()
                    ),
                    status: None,
                    suggestion: None,
                });
            }
            let values = row
                .f
                .iter()
                .zip(&self.fields)
                .map(|(cell, (name, raw_type, column_type))| {
                    cell_value(&cell.v, raw_type, *column_type).map_err(|e| ReclassError::Query {
                        message: format!("Column '{}': {}", name, e),
                        status: None,
                        suggestion: None,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            self.rows.push(values);
        }
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn finish(self) -> Result<ResultSet> {
        let columns = self
            .fields
            .into_iter()
            .map(|(name, _, column_type)| Column::new(name, column_type))
            .collect();
        ResultSet::new(columns, self.rows)
    }
}

/// Convert one wire cell to a typed value
///
/// BigQuery sends every scalar as a JSON string; TIMESTAMP arrives as
/// floating-point epoch seconds.
fn cell_value(raw: &serde_json::Value, raw_type: &str, column_type: ColumnType) -> Result<Value> {
    let text = match raw {
        serde_json::Value::Null => return Ok(Value::Null),
        serde_json::Value::String(s) => s.as_str(),
        other => {
            return Err(ReclassError::Custom {
                message: format!("unexpected non-scalar cell {}", other),
                suggestion: None,
            })
        }
    };

    let bad = |what: &str| ReclassError::Custom {
        message: format!("cannot read '{}' as {}", text, what),
        suggestion: None,
    };

    Ok(match column_type {
        ColumnType::Integer => Value::Int(text.parse().map_err(|_| bad("an integer"))?),
        // IEEE_DIVIDE by zero yields NaN or Infinity
        ColumnType::Float => match text.parse::<f64>().map_err(|_| bad("a number"))? {
            f if f.is_finite() => Value::Float(f),
            _ => Value::Null,
        },
        ColumnType::Text => Value::Text(text.to_string()),
        ColumnType::Date if raw_type == "TIMESTAMP" => {
            let secs: f64 = text.parse().map_err(|_| bad("epoch seconds"))?;
            let dt = DateTime::from_timestamp(secs.floor() as i64, 0).ok_or_else(|| bad("a timestamp"))?;
            Value::Date(dt.date_naive())
        }
        ColumnType::Date => {
            let date_part = text.get(..10).unwrap_or(text);
            Value::Date(NaiveDate::parse_from_str(date_part, MONTH_FORMAT).map_err(|_| bad("a date"))?)
        }
    })
}

/// Parse an error body into a query error
pub fn api_error(status: u16, body: &str) -> ReclassError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => ReclassError::query_status(
            if envelope.error.code != 0 { envelope.error.code } else { status },
            &envelope.error.message,
        ),
        Err(_) => ReclassError::query_status(status, body.trim()),
    }
}

/// BigQuery REST client
#[cfg(feature = "remote")]
pub struct BigQueryClient {
    config: RemoteConfig,
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

#[cfg(feature = "remote")]
impl BigQueryClient {
    /// Create a client; fails when project or token is missing
    pub fn new(config: RemoteConfig) -> Result<Self> {
        if config.project_id.is_none() {
            return Err(ReclassError::Configuration {
                message: "No project_id configured for remote queries".to_string(),
                suggestion: Some("Set project_id in config.toml or CDRECLASS_PROJECT_ID".to_string()),
            });
        }
        if config.access_token.is_none() {
            return Err(ReclassError::Configuration {
                message: "No access_token configured for remote queries".to_string(),
                suggestion: Some(
                    "Set CDRECLASS_ACCESS_TOKEN, e.g. to the output of `gcloud auth print-access-token`"
                        .to_string(),
                ),
            });
        }

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds));
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }
        let client = builder.build().map_err(|e| ReclassError::Custom {
            message: format!("Failed to create HTTP client: {}", e),
            suggestion: Some("Check your network configuration".to_string()),
        })?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ReclassError::Custom {
                message: format!("Failed to create async runtime: {}", e),
                suggestion: None,
            })?;

        Ok(Self { config, client, runtime })
    }

    fn project(&self) -> &str {
        self.config.project_id.as_deref().unwrap_or_default()
    }

    fn token(&self) -> &str {
        self.config.access_token.as_deref().unwrap_or_default()
    }

    /// Submit the query via `jobs.query`
    async fn submit(&self, sql: &str) -> Result<QueryResponse> {
        let url = format!("{}/projects/{}/queries", self.config.api_endpoint, self.project());
        let mut body = serde_json::json!({
            "query": sql,
            "useLegacySql": false,
            "maxResults": self.config.page_size,
            "timeoutMs": 10_000,
        });
        if let Some(location) = &self.config.location {
            body["location"] = serde_json::Value::String(location.clone());
        }

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.token())
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;
        decode(response).await
    }

    /// Fetch job status or a further page via `jobs.getQueryResults`
    async fn fetch_page(&self, job: &JobReference, page_token: Option<&str>) -> Result<QueryResponse> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.config.api_endpoint, job.project_id, job.job_id
        );
        let mut params: Vec<(&str, String)> = vec![
            ("maxResults", self.config.page_size.to_string()),
            ("timeoutMs", "10000".to_string()),
        ];
        if let Some(location) = job.location.as_ref().or(self.config.location.as_ref()) {
            params.push(("location", location.clone()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.token())
            .query(&params)
            .send()
            .await
            .map_err(network_error)?;
        decode(response).await
    }

    async fn run_async(&self, sql: &str) -> Result<ResultSet> {
        let deadline = Instant::now() + Duration::from_secs(self.config.timeout_seconds);

        #[cfg(feature = "progress")]
        let spinner = if self.config.show_progress {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} [{elapsed_precise}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(Duration::from_millis(120));
            pb.set_message("running query");
            Some(pb)
        } else {
            None
        };

        let mut page = self.submit(sql).await?;
        let job = page.job_reference.clone();
        debug!(job = ?job.as_ref().map(|j| &j.job_id), "query submitted");

        while !page.job_complete {
            if Instant::now() >= deadline {
                return Err(ReclassError::Query {
                    message: format!("Query did not finish within {}s", self.config.timeout_seconds),
                    status: None,
                    suggestion: Some("Increase timeout_seconds or simplify the query".to_string()),
                });
            }
            let job = job.as_ref().ok_or_else(|| ReclassError::Query {
                message: "Incomplete job without a job reference".to_string(),
                status: None,
                suggestion: None,
            })?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            page = self.fetch_page(job, None).await?;
        }

        let mut acc = PageAccumulator::new();
        acc.push_page(&page)?;
        while let Some(token) = page.page_token.clone() {
            let job = job.as_ref().ok_or_else(|| ReclassError::Query {
                message: "Paged result without a job reference".to_string(),
                status: None,
                suggestion: None,
            })?;
            #[cfg(feature = "progress")]
            if let Some(ref pb) = spinner {
                pb.set_message(format!("fetched {} rows", acc.row_count()));
            }
            page = self.fetch_page(job, Some(&token)).await?;
            acc.push_page(&page)?;
        }

        #[cfg(feature = "progress")]
        if let Some(pb) = spinner {
            pb.finish_and_clear();
        }

        info!(backend = "bigquery", rows = acc.row_count(), "query complete");
        acc.finish()
    }
}

#[cfg(feature = "remote")]
impl QueryBackend for BigQueryClient {
    fn run(&self, sql: &str) -> Result<ResultSet> {
        self.runtime.block_on(self.run_async(sql))
    }

    fn name(&self) -> &str {
        "bigquery"
    }
}

#[cfg(feature = "remote")]
fn network_error(err: reqwest::Error) -> ReclassError {
    ReclassError::Query {
        message: format!("Failed to reach the query service: {}", err),
        status: err.status().map(|s| s.as_u16()),
        suggestion: Some("Check your internet connection and api_endpoint".to_string()),
    }
}

#[cfg(feature = "remote")]
async fn decode(response: reqwest::Response) -> Result<QueryResponse> {
    let status = response.status();
    let body = response.text().await.map_err(network_error)?;
    if !status.is_success() {
        return Err(api_error(status.as_u16(), &body));
    }
    Ok(serde_json::from_str(&body)?)
}

// Placeholder so callers get a clear error when the feature is off
#[cfg(not(feature = "remote"))]
pub struct BigQueryClient;

#[cfg(not(feature = "remote"))]
impl BigQueryClient {
    pub fn new(_config: RemoteConfig) -> Result<Self> {
        Err(ReclassError::feature_required("remote"))
    }
}

#[cfg(not(feature = "remote"))]
impl QueryBackend for BigQueryClient {
    fn run(&self, _sql: &str) -> Result<ResultSet> {
        Err(ReclassError::feature_required("remote"))
    }

    fn name(&self) -> &str {
        "bigquery (disabled)"
    }
}
