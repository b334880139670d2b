//! SQL text for the dashboard statements and decoders for their results.
//!
//! Anomaly detection, forecasting and summarization are managed warehouse
//! functions; this module only builds the calls and reads what comes back.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::ResultSet;
use crate::growth::Observation;

const STORAGE_SOURCE: &str = "SNOWFLAKE.ACCOUNT_USAGE.TABLE_STORAGE_METRICS";
const SUMMARY_PROMPT: &str = "Summarize Snowflake storage growth: ";

/// Table size in GiB per table per day over the trailing window.
fn storage_input_sql(days_back: u32) -> String {
    format!(
        "SELECT
    TABLE_NAME,
    USAGE_DATE,
    SUM(BYTES)/(1024*1024*1024) AS SIZE_GB
FROM {STORAGE_SOURCE}
WHERE USAGE_DATE >= DATEADD(day, -{days_back}, CURRENT_DATE())
GROUP BY TABLE_NAME, USAGE_DATE"
    )
}

pub fn storage_usage_sql(days_back: u32) -> String {
    format!(
        "{}\nORDER BY TABLE_NAME, USAGE_DATE",
        storage_input_sql(days_back)
    )
}

pub fn anomaly_sql(days_back: u32) -> String {
    format!(
        "SELECT * FROM TABLE(
    SNOWFLAKE.ML.ANOMALY_DETECTION(
        INPUT => ({input}),
        TIMESTAMP_COLNAME => 'USAGE_DATE',
        TARGET_COLNAME => 'SIZE_GB',
        ID_COLNAME => 'TABLE_NAME'
    )
)",
        input = storage_input_sql(days_back)
    )
}

pub fn forecast_sql(days_back: u32, horizon_days: u32) -> String {
    format!(
        "SELECT * FROM TABLE(
    SNOWFLAKE.ML.FORECAST(
        INPUT => ({input}),
        TIMESTAMP_COLNAME => 'USAGE_DATE',
        TARGET_COLNAME => 'SIZE_GB',
        ID_COLNAME => 'TABLE_NAME',
        PREDICT_FOR => INTERVAL '{horizon_days} day'
    )
)",
        input = storage_input_sql(days_back)
    )
}

pub fn summary_sql(window_days: u32, model: &str) -> String {
    format!(
        "WITH growth AS (
    SELECT
        TABLE_NAME,
        MIN(USAGE_DATE) AS START_DATE,
        MAX(USAGE_DATE) AS END_DATE,
        MIN(BYTES)/(1024*1024*1024) AS START_GB,
        MAX(BYTES)/(1024*1024*1024) AS END_GB
    FROM {STORAGE_SOURCE}
    WHERE USAGE_DATE >= DATEADD(day, -{window_days}, CURRENT_DATE())
    GROUP BY TABLE_NAME
)
SELECT
    SNOWFLAKE.CORTEX.COMPLETE(
        {model},
        {prompt} ||
        LISTAGG(
            'Table ' || TABLE_NAME || ' grew from ' || ROUND(START_GB, 2) ||
            'GB to ' || ROUND(END_GB, 2) || 'GB.', ' '
        )
    ) AS SUMMARY
FROM growth",
        model = quote_literal(model),
        prompt = quote_literal(SUMMARY_PROMPT),
    )
}

/// Single-quoted SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// Decode storage rows, failing on the first malformed row.
pub fn decode_observations(set: &ResultSet) -> Result<Vec<Observation>> {
    let mut observations = Vec::with_capacity(set.len());
    for row in set.rows() {
        let table = row.str("TABLE_NAME")?;
        let date = row.date("USAGE_DATE")?;
        let size = row.f64("SIZE_GB")?;
        let obs = Observation::new(table, date, size)
            .with_context(|| format!("invalid storage row {}", row.index()))?;
        observations.push(obs);
    }
    Ok(observations)
}

/// A point flagged by the managed anomaly-detection function.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyRow {
    pub table: String,
    pub ts: DateTime<Utc>,
    pub observed: Option<f64>,
    pub forecast: Option<f64>,
    pub lower_bound: Option<f64>,
    pub upper_bound: Option<f64>,
    pub percentile: Option<f64>,
    pub distance: Option<f64>,
}

/// Keep only rows the function marked as anomalous.
pub fn decode_anomalies(set: &ResultSet) -> Result<Vec<AnomalyRow>> {
    let mut anomalies = Vec::new();
    for row in set.rows() {
        if !row.bool("IS_ANOMALY")? {
            continue;
        }
        let table = first_str(set, row, &["SERIES", "TABLE_NAME"])?;
        anomalies.push(AnomalyRow {
            table,
            ts: row.timestamp_any(&["TS", "TIMESTAMP", "USAGE_DATE"])?,
            observed: optional_f64(set, row, "Y")?,
            forecast: optional_f64(set, row, "FORECAST")?,
            lower_bound: optional_f64(set, row, "LOWER_BOUND")?,
            upper_bound: optional_f64(set, row, "UPPER_BOUND")?,
            percentile: optional_f64(set, row, "PERCENTILE")?,
            distance: optional_f64(set, row, "DISTANCE")?,
        });
    }
    Ok(anomalies)
}

/// Predicted size for a table at the end of the forecast horizon.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastRow {
    pub table: String,
    pub ts: DateTime<Utc>,
    pub forecast: f64,
    pub lower_bound: Option<f64>,
    pub upper_bound: Option<f64>,
}

/// Keep only rows at the furthest forecast timestamp.
pub fn decode_forecast(set: &ResultSet) -> Result<Vec<ForecastRow>> {
    let mut rows = Vec::with_capacity(set.len());
    for row in set.rows() {
        rows.push(ForecastRow {
            table: first_str(set, row, &["SERIES", "TABLE_NAME"])?,
            ts: row.timestamp_any(&["TS", "TIMESTAMP"])?,
            forecast: row.f64("FORECAST")?,
            lower_bound: optional_f64(set, row, "LOWER_BOUND")?,
            upper_bound: optional_f64(set, row, "UPPER_BOUND")?,
        });
    }
    let Some(horizon) = rows.iter().map(|row| row.ts).max() else {
        return Ok(rows);
    };
    rows.retain(|row| row.ts == horizon);
    Ok(rows)
}

pub fn decode_summary(set: &ResultSet) -> Result<String> {
    let Some(row) = set.rows().next() else {
        bail!("summary statement returned no rows");
    };
    let summary = row.opt_str("SUMMARY")?.unwrap_or_default().trim();
    if summary.is_empty() {
        bail!("summary statement returned an empty completion");
    }
    // COMPLETE returns a JSON string literal when the model quotes its answer.
    let text = serde_json::from_str::<String>(summary).unwrap_or_else(|_| summary.to_string());
    Ok(text)
}

// Managed function outputs name the series column SERIES; variants with the
// input id column are accepted too. Wrapped series ids arrive JSON-quoted.
fn first_str(set: &ResultSet, row: crate::db::Row<'_>, columns: &[&str]) -> Result<String> {
    let col = set.column_index_any(columns)?;
    let name = set.columns[col].name.clone();
    let raw = row.str(&name)?;
    Ok(serde_json::from_str::<String>(raw).unwrap_or_else(|_| raw.to_string()))
}

fn optional_f64(set: &ResultSet, row: crate::db::Row<'_>, column: &str) -> Result<Option<f64>> {
    if set.column_index(column).is_err() {
        return Ok(None);
    }
    Ok(row.opt_f64(column)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Column;

    fn set(columns: &[&str], rows: &[&[Option<&str>]]) -> ResultSet {
        ResultSet::new(
            columns.iter().map(|name| Column::new(*name, "text")).collect(),
            rows.iter()
                .map(|row| row.iter().map(|cell| cell.map(str::to_string)).collect())
                .collect(),
        )
    }

    #[test]
    fn storage_sql_uses_trailing_window() {
        let sql = storage_usage_sql(14);
        assert!(sql.contains("DATEADD(day, -14, CURRENT_DATE())"));
        assert!(sql.contains("GROUP BY TABLE_NAME, USAGE_DATE"));
        assert!(sql.trim_end().ends_with("ORDER BY TABLE_NAME, USAGE_DATE"));
    }

    #[test]
    fn managed_function_sql_wraps_storage_input() {
        let anomaly = anomaly_sql(30);
        assert!(anomaly.contains("SNOWFLAKE.ML.ANOMALY_DETECTION"));
        assert!(anomaly.contains("DATEADD(day, -30, CURRENT_DATE())"));
        assert!(!anomaly.contains("ORDER BY"));

        let forecast = forecast_sql(30, 7);
        assert!(forecast.contains("SNOWFLAKE.ML.FORECAST"));
        assert!(forecast.contains("PREDICT_FOR => INTERVAL '7 day'"));
    }

    #[test]
    fn summary_sql_quotes_model_name() {
        let sql = summary_sql(7, "it's-a-model");
        assert!(sql.contains("'it''s-a-model'"));
        assert!(sql.contains("'Summarize Snowflake storage growth: '"));
        assert!(sql.contains("DATEADD(day, -7, CURRENT_DATE())"));
    }

    #[test]
    fn storage_rows_decode_and_reject_bad_sizes() {
        let good = set(
            &["TABLE_NAME", "USAGE_DATE", "SIZE_GB"],
            &[&[Some("ORDERS"), Some("2024-01-02"), Some("1.5")]],
        );
        let decoded = decode_observations(&good).expect("decode");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].entity_id, "ORDERS");

        let null_size = set(
            &["TABLE_NAME", "USAGE_DATE", "SIZE_GB"],
            &[&[Some("ORDERS"), Some("2024-01-02"), None]],
        );
        assert!(decode_observations(&null_size).is_err());

        let negative = set(
            &["TABLE_NAME", "USAGE_DATE", "SIZE_GB"],
            &[&[Some("ORDERS"), Some("2024-01-02"), Some("-3")]],
        );
        assert!(decode_observations(&negative).is_err());
    }

    #[test]
    fn anomalies_keep_flagged_rows_only() {
        let rows = set(
            &["SERIES", "TS", "Y", "FORECAST", "IS_ANOMALY"],
            &[
                &[Some("\"ORDERS\""), Some("1704067200.000"), Some("9"), Some("3"), Some("true")],
                &[Some("\"EVENTS\""), Some("1704067200.000"), Some("1"), Some("1"), Some("false")],
            ],
        );
        let anomalies = decode_anomalies(&rows).expect("decode");
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].table, "ORDERS");
        assert_eq!(anomalies[0].observed, Some(9.0));
        assert_eq!(anomalies[0].lower_bound, None);
    }

    #[test]
    fn forecast_keeps_furthest_horizon() {
        let rows = set(
            &["SERIES", "TS", "FORECAST"],
            &[
                &[Some("ORDERS"), Some("2024-01-08"), Some("10")],
                &[Some("ORDERS"), Some("2024-01-09"), Some("11")],
                &[Some("EVENTS"), Some("2024-01-09"), Some("4")],
            ],
        );
        let forecast = decode_forecast(&rows).expect("decode");
        assert_eq!(forecast.len(), 2);
        assert!(forecast.iter().all(|row| row.ts.date_naive().to_string() == "2024-01-09"));
    }

    #[test]
    fn summary_requires_text() {
        let empty = set(&["SUMMARY"], &[]);
        assert!(decode_summary(&empty).is_err());

        let quoted = set(&["SUMMARY"], &[&[Some("\"ORDERS grew by 2GB.\"")]]);
        assert_eq!(decode_summary(&quoted).expect("summary"), "ORDERS grew by 2GB.");

        let plain = set(&["SUMMARY"], &[&[Some("Storage is flat.")]]);
        assert_eq!(decode_summary(&plain).expect("summary"), "Storage is flat.");
    }
}
