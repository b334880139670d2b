use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::metrics::AppMetrics;

const TOKEN_TYPE_HEADER: &str = "x-snowflake-authorization-token-type";
const PROBE_SQL: &str = "SELECT CURRENT_ACCOUNT() AS ACCOUNT, CURRENT_WAREHOUSE() AS WAREHOUSE";

/// Warehouse error codes the dashboard degrades on.
const OBJECT_DOES_NOT_EXIST: &str = "002003";
const UNKNOWN_FUNCTION: &str = "002140";
const INSUFFICIENT_PRIVILEGES: &str = "003001";

/// Which dashboard statement is running; used for logs and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Probe,
    StorageUsage,
    AnomalyDetection,
    Forecast,
    Summary,
}

impl QueryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::Probe => "probe",
            QueryKind::StorageUsage => "storage_usage",
            QueryKind::AnomalyDetection => "anomaly_detection",
            QueryKind::Forecast => "forecast",
            QueryKind::Summary => "summary",
        }
    }
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("warehouse request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("statement failed with HTTP {status} (code {code}, sqlstate {sql_state}): {message}")]
    Statement {
        status: u16,
        code: String,
        sql_state: String,
        message: String,
    },
    #[error("statement {handle} still running after {waited:?}; cancelled")]
    Timeout { handle: String, waited: Duration },
    #[error("malformed warehouse response: {0}")]
    Malformed(String),
    #[error("warehouse client is closed")]
    Closed,
}

impl WarehouseError {
    pub fn code(&self) -> Option<&str> {
        match self {
            WarehouseError::Statement { code, .. } if !code.is_empty() => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn is_missing_object(&self) -> bool {
        self.code() == Some(OBJECT_DOES_NOT_EXIST)
    }

    pub fn is_unknown_function(&self) -> bool {
        self.code() == Some(UNKNOWN_FUNCTION)
    }

    pub fn is_insufficient_privileges(&self) -> bool {
        self.code() == Some(INSUFFICIENT_PRIVILEGES)
    }
}

/// Data-validation failures while decoding result rows.
#[derive(Debug, Error, PartialEq)]
pub enum RowError {
    #[error("result has no column {0}")]
    MissingColumn(String),
    #[error("row {row}: column {column} is null")]
    Null { row: usize, column: String },
    #[error("row {row}: column {column} value {value:?} is not a valid {expected}")]
    Invalid {
        row: usize,
        column: String,
        value: String,
        expected: &'static str,
    },
}

/// Something that can run a SQL statement and hand back a materialized result.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn query(&self, kind: QueryKind, sql: &str) -> Result<ResultSet, WarehouseError>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_name: String,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// A fully fetched statement result. Cells arrive as strings (or null) on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn new(columns: Vec<Column>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Case-insensitive column lookup.
    pub fn column_index(&self, name: &str) -> Result<usize, RowError> {
        self.columns
            .iter()
            .position(|col| col.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| RowError::MissingColumn(name.to_string()))
    }

    /// First matching column among `names`.
    pub fn column_index_any(&self, names: &[&str]) -> Result<usize, RowError> {
        names
            .iter()
            .find_map(|name| self.column_index(name).ok())
            .ok_or_else(|| RowError::MissingColumn(names.join("|")))
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        (0..self.rows.len()).map(move |index| Row { set: self, index })
    }
}

/// Borrowed view of one result row with typed accessors.
#[derive(Clone, Copy)]
pub struct Row<'a> {
    set: &'a ResultSet,
    index: usize,
}

impl<'a> Row<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn opt_str(&self, column: &str) -> Result<Option<&'a str>, RowError> {
        let col = self.set.column_index(column)?;
        Ok(self.cell(col))
    }

    pub fn str(&self, column: &str) -> Result<&'a str, RowError> {
        self.opt_str(column)?.ok_or_else(|| self.null(column))
    }

    pub fn opt_f64(&self, column: &str) -> Result<Option<f64>, RowError> {
        match self.opt_str(column)? {
            Some(raw) => raw
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| self.invalid(column, raw, "number")),
            None => Ok(None),
        }
    }

    pub fn f64(&self, column: &str) -> Result<f64, RowError> {
        self.opt_f64(column)?.ok_or_else(|| self.null(column))
    }

    pub fn bool(&self, column: &str) -> Result<bool, RowError> {
        let raw = self.str(column)?;
        parse_bool(raw).ok_or_else(|| self.invalid(column, raw, "boolean"))
    }

    pub fn date(&self, column: &str) -> Result<NaiveDate, RowError> {
        let raw = self.str(column)?;
        parse_date(raw).ok_or_else(|| self.invalid(column, raw, "date"))
    }

    /// Timestamp from the first present column among `columns`.
    pub fn timestamp_any(&self, columns: &[&str]) -> Result<DateTime<Utc>, RowError> {
        let col = self.set.column_index_any(columns)?;
        let name = self.set.columns[col].name.as_str();
        let raw = self.cell(col).ok_or_else(|| self.null(name))?;
        parse_timestamp(raw).ok_or_else(|| self.invalid(name, raw, "timestamp"))
    }

    fn cell(&self, col: usize) -> Option<&'a str> {
        self.set
            .rows
            .get(self.index)
            .and_then(|row| row.get(col))
            .and_then(|cell| cell.as_deref())
    }

    fn null(&self, column: &str) -> RowError {
        RowError::Null {
            row: self.index,
            column: column.to_string(),
        }
    }

    fn invalid(&self, column: &str, raw: &str, expected: &'static str) -> RowError {
        RowError::Invalid {
            row: self.index,
            column: column.to_string(),
            value: raw.to_string(),
            expected,
        }
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// DATE cells arrive as days since the Unix epoch; ISO dates are accepted too.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(days) = raw.parse::<i64>() {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
        return epoch.checked_add_signed(chrono::Duration::days(days));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

/// TIMESTAMP cells arrive as `seconds.fraction` (optionally followed by an offset
/// in minutes for TIMESTAMP_TZ); RFC 3339 and plain dates are accepted too.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let epoch_part = raw.split_whitespace().next()?;
    let (secs_raw, frac_raw) = match epoch_part.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (epoch_part, ""),
    };
    if let Ok(mut secs) = secs_raw.parse::<i64>() {
        if !frac_raw.chars().all(|ch| ch.is_ascii_digit()) {
            return None;
        }
        let digits: String = frac_raw.chars().chain(std::iter::repeat('0')).take(9).collect();
        let mut nanos: u32 = digits.parse().ok()?;
        if secs_raw.starts_with('-') && nanos > 0 {
            secs -= 1;
            nanos = 1_000_000_000 - nanos;
        }
        return DateTime::from_timestamp(secs, nanos);
    }
    parse_date(raw)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    timeout: u64,
    database: &'a str,
    schema: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    sql_state: Option<String>,
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Option<Vec<Vec<Option<String>>>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    num_rows: u64,
    #[serde(default)]
    row_type: Vec<Column>,
    #[serde(default)]
    partition_info: Vec<PartitionInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartitionInfo {
    #[serde(default)]
    row_count: u64,
}

enum StatementOutcome {
    Complete(StatementResponse),
    Pending(String),
}

/// Classify a SQL API response body by HTTP status.
fn classify(status: StatusCode, body: &[u8]) -> Result<StatementOutcome, WarehouseError> {
    let parsed = serde_json::from_slice::<StatementResponse>(body);
    match (status, parsed) {
        (StatusCode::OK, Ok(payload)) => Ok(StatementOutcome::Complete(payload)),
        (StatusCode::ACCEPTED, Ok(payload)) => payload
            .statement_handle
            .map(StatementOutcome::Pending)
            .ok_or_else(|| WarehouseError::Malformed("202 response without statementHandle".into())),
        (status, Ok(payload)) => Err(WarehouseError::Statement {
            status: status.as_u16(),
            code: payload.code.unwrap_or_default(),
            sql_state: payload.sql_state.unwrap_or_default(),
            message: payload.message.unwrap_or_else(|| status.to_string()),
        }),
        (status, Err(err)) if status.is_success() => {
            Err(WarehouseError::Malformed(format!("{err} (HTTP {status})")))
        }
        (status, Err(_)) => {
            let text = String::from_utf8_lossy(body);
            Err(WarehouseError::Statement {
                status: status.as_u16(),
                code: String::new(),
                sql_state: String::new(),
                message: text.chars().take(512).collect(),
            })
        }
    }
}

/// Turn a completed first-partition payload into column metadata and rows.
fn first_partition(
    payload: StatementResponse,
) -> Result<(Vec<Column>, Vec<Vec<Option<String>>>, usize, Option<String>), WarehouseError> {
    let meta = payload
        .result_set_meta_data
        .ok_or_else(|| WarehouseError::Malformed("missing resultSetMetaData".into()))?;
    let rows = payload.data.unwrap_or_default();
    let expected: u64 = meta.partition_info.iter().map(|p| p.row_count).sum();
    debug!(
        num_rows = meta.num_rows,
        partitions = meta.partition_info.len(),
        expected_rows = expected,
        "statement result metadata"
    );
    Ok((
        meta.row_type,
        rows,
        meta.partition_info.len(),
        payload.statement_handle,
    ))
}

/// Explicitly owned handle to the warehouse SQL API.
///
/// Built once at startup, shared through `AppContext`, and closed on shutdown;
/// closing cancels statements that are still executing.
pub struct WarehouseClient {
    http: reqwest::Client,
    base_url: String,
    database: String,
    schema: String,
    warehouse: Option<String>,
    role: Option<String>,
    statement_timeout: Duration,
    poll_interval: Duration,
    max_poll_wait: Duration,
    in_flight: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl WarehouseClient {
    /// Build the HTTP client without touching the network.
    pub fn new(config: &AppConfig) -> Result<Self> {
        let wh = &config.warehouse;
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", wh.token.expose()))
            .context("access token contains invalid header characters")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            HeaderName::from_static(TOKEN_TYPE_HEADER),
            HeaderValue::from_static(wh.token_type.header_value()),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("stormon/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeouts.request_timeout)
            .build()
            .context("failed to build warehouse HTTP client")?;

        Ok(Self {
            http,
            base_url: wh.endpoint(),
            database: wh.database.clone(),
            schema: wh.schema.clone(),
            warehouse: wh.warehouse.clone(),
            role: wh.role.clone(),
            statement_timeout: config.timeouts.statement_timeout,
            poll_interval: config.timeouts.poll_interval,
            max_poll_wait: config.timeouts.max_poll_wait,
            in_flight: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Build the client and verify the session can run statements.
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let client = Self::new(config)?;
        let probe = client
            .execute(PROBE_SQL)
            .await
            .context("failed to reach the warehouse SQL API")?;
        let row = probe
            .rows()
            .next()
            .context("session probe returned no rows")?;
        let account = row.opt_str("ACCOUNT")?.unwrap_or("unknown").to_string();
        let Some(warehouse) = row.opt_str("WAREHOUSE")? else {
            anyhow::bail!(
                "session has no active warehouse; set SNOWFLAKE_WAREHOUSE or `warehouse.warehouse`"
            );
        };
        info!(
            account = %account,
            warehouse = %warehouse,
            user = config.warehouse.user.as_deref().unwrap_or("-"),
            endpoint = %client.base_url,
            "connected to warehouse"
        );
        Ok(client)
    }

    /// Refuse further statements and cancel anything still executing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<String> = self.in_flight.lock().await.drain().collect();
        for handle in &pending {
            self.cancel(handle).await;
        }
        info!(cancelled = pending.len(), "warehouse client closed");
    }

    fn statement_url(&self, handle: &str) -> String {
        format!("{}/api/v2/statements/{}", self.base_url, handle)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn execute(&self, sql: &str) -> Result<ResultSet, WarehouseError> {
        if self.is_closed() {
            return Err(WarehouseError::Closed);
        }
        // async=true: answer 202 with a handle instead of holding the request open.
        let url = format!(
            "{}/api/v2/statements?requestId={}&async=true",
            self.base_url,
            Uuid::new_v4()
        );
        let request = StatementRequest {
            statement: sql,
            timeout: self.statement_timeout.as_secs().max(1),
            database: &self.database,
            schema: &self.schema,
            warehouse: self.warehouse.as_deref(),
            role: self.role.as_deref(),
        };

        let response = self.http.post(&url).json(&request).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        let payload = match classify(status, &body)? {
            StatementOutcome::Complete(payload) => payload,
            StatementOutcome::Pending(handle) => {
                self.in_flight.lock().await.insert(handle.clone());
                let outcome = self.wait_for(&handle).await;
                self.in_flight.lock().await.remove(&handle);
                outcome?
            }
        };

        let (columns, mut rows, partitions, handle) = first_partition(payload)?;
        if partitions > 1 {
            let handle = handle.ok_or_else(|| {
                WarehouseError::Malformed("multi-partition result without statementHandle".into())
            })?;
            for partition in 1..partitions {
                rows.extend(self.fetch_partition(&handle, partition).await?);
            }
        }
        Ok(ResultSet::new(columns, rows))
    }

    async fn wait_for(&self, handle: &str) -> Result<StatementResponse, WarehouseError> {
        let started = Instant::now();
        loop {
            let waited = started.elapsed();
            if waited >= self.max_poll_wait {
                self.cancel(handle).await;
                return Err(WarehouseError::Timeout {
                    handle: handle.to_string(),
                    waited,
                });
            }
            tokio::time::sleep(self.poll_interval).await;

            if self.is_closed() {
                // Handles registered after `close` drained the set are ours to cancel.
                if self.in_flight.lock().await.remove(handle) {
                    self.cancel(handle).await;
                }
                return Err(WarehouseError::Closed);
            }

            let response = self.http.get(self.statement_url(handle)).send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            match classify(status, &body)? {
                StatementOutcome::Complete(payload) => return Ok(payload),
                StatementOutcome::Pending(_) => {
                    debug!(handle, waited = ?started.elapsed(), "statement still running");
                }
            }
        }
    }

    async fn fetch_partition(
        &self,
        handle: &str,
        partition: usize,
    ) -> Result<Vec<Vec<Option<String>>>, WarehouseError> {
        let response = self
            .http
            .get(self.statement_url(handle))
            .query(&[("partition", partition)])
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        match classify(status, &body)? {
            StatementOutcome::Complete(payload) => Ok(payload.data.unwrap_or_default()),
            StatementOutcome::Pending(_) => Err(WarehouseError::Malformed(format!(
                "partition {partition} of {handle} reported as still running"
            ))),
        }
    }

    async fn cancel(&self, handle: &str) {
        let url = format!("{}/cancel", self.statement_url(handle));
        match self.http.post(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(handle, "cancelled statement");
            }
            Ok(resp) => {
                warn!(handle, status = %resp.status(), "statement cancel rejected");
            }
            Err(err) => {
                error!(handle, error = ?err, "failed to cancel statement");
            }
        }
    }
}

#[async_trait]
impl Warehouse for WarehouseClient {
    async fn query(&self, kind: QueryKind, sql: &str) -> Result<ResultSet, WarehouseError> {
        debug!(query = kind.as_str(), "executing statement");
        self.execute(sql).await
    }
}

/// Records per-statement latency and outcome around another warehouse.
pub struct MeteredWarehouse<'a> {
    inner: &'a dyn Warehouse,
    metrics: &'a AppMetrics,
}

impl<'a> MeteredWarehouse<'a> {
    pub fn new(inner: &'a dyn Warehouse, metrics: &'a AppMetrics) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl Warehouse for MeteredWarehouse<'_> {
    async fn query(&self, kind: QueryKind, sql: &str) -> Result<ResultSet, WarehouseError> {
        let start = Instant::now();
        let result = self.inner.query(kind, sql).await;
        self.metrics
            .observe_query(kind.as_str(), start.elapsed(), result.is_ok());
        result
    }
}
