use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::{DashboardOptions, Sections};
use crate::db::{QueryKind, Warehouse, WarehouseError};
use crate::growth::{self, Observation, RankedTable, TableGrowth};
use crate::queries::{self, AnomalyRow, ForecastRow};

/// Outcome of an optional dashboard stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Section<T> {
    Skipped,
    Ready { data: T },
    Failed { error: String },
}

impl<T> Section<T> {
    pub fn data(&self) -> Option<&T> {
        match self {
            Section::Ready { data } => Some(data),
            _ => None,
        }
    }
}

/// Everything one render produces, ready to chart.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub generated_at: DateTime<Utc>,
    pub days_back: u32,
    pub top_n: usize,
    pub latest_date: Option<NaiveDate>,
    pub tables_observed: usize,
    pub top_tables: Vec<RankedTable>,
    pub series: Vec<Observation>,
    pub growth: Vec<TableGrowth>,
    pub anomalies: Section<Vec<AnomalyRow>>,
    pub forecast: Section<Vec<ForecastRow>>,
    pub summary: Section<String>,
}

/// Run the storage query, select the top tables, then each enabled section.
///
/// A failing storage query fails the render; optional sections fail on their own.
#[instrument(skip_all, fields(days_back = options.days_back, top_n = options.top_n))]
pub async fn render(
    warehouse: &dyn Warehouse,
    options: &DashboardOptions,
    sections: &Sections,
) -> Result<DashboardSnapshot> {
    let storage = warehouse
        .query(
            QueryKind::StorageUsage,
            &queries::storage_usage_sql(options.days_back),
        )
        .await
        .map_err(describe)
        .context("storage usage query failed")?;
    let observations = queries::decode_observations(&storage)?;
    let tables_observed = distinct_tables(&observations);

    let top = growth::rank_latest(&observations, options.top_n);
    let growth = growth::growth_deltas(&top.series);
    info!(
        rows = observations.len(),
        tables = tables_observed,
        latest_date = ?top.latest_date,
        selected = top.ranked.len(),
        "storage usage loaded"
    );

    let anomalies = if sections.anomaly_detection {
        run_section(QueryKind::AnomalyDetection, async {
            let set = warehouse
                .query(
                    QueryKind::AnomalyDetection,
                    &queries::anomaly_sql(options.days_back),
                )
                .await
                .map_err(describe)?;
            queries::decode_anomalies(&set)
        })
        .await
    } else {
        Section::Skipped
    };

    let forecast = if sections.forecast {
        run_section(QueryKind::Forecast, async {
            let set = warehouse
                .query(
                    QueryKind::Forecast,
                    &queries::forecast_sql(options.days_back, options.forecast_horizon_days),
                )
                .await
                .map_err(describe)?;
            queries::decode_forecast(&set)
        })
        .await
    } else {
        Section::Skipped
    };

    let summary = if sections.summary {
        run_section(QueryKind::Summary, async {
            let set = warehouse
                .query(
                    QueryKind::Summary,
                    &queries::summary_sql(options.summary_window_days, &options.summary_model),
                )
                .await
                .map_err(describe)?;
            queries::decode_summary(&set)
        })
        .await
    } else {
        Section::Skipped
    };

    Ok(DashboardSnapshot {
        generated_at: Utc::now(),
        days_back: options.days_back,
        top_n: options.top_n,
        latest_date: top.latest_date,
        tables_observed,
        top_tables: top.ranked,
        series: top.series,
        growth,
        anomalies,
        forecast,
        summary,
    })
}

async fn run_section<T, F>(kind: QueryKind, stage: F) -> Section<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match stage.await {
        Ok(data) => Section::Ready { data },
        Err(err) => {
            warn!(section = kind.as_str(), error = ?err, "dashboard section failed");
            Section::Failed {
                error: format!("{err:#}"),
            }
        }
    }
}

fn describe(err: WarehouseError) -> anyhow::Error {
    let hint = if err.is_unknown_function() {
        Some("managed ML/LLM function is not available in this account or region")
    } else if err.is_missing_object() {
        Some("usage view is not visible to the current role")
    } else if err.is_insufficient_privileges() {
        Some("role lacks privileges for this function")
    } else {
        None
    };
    match hint {
        Some(hint) => anyhow::Error::new(err).context(hint),
        None => anyhow::Error::new(err),
    }
}

fn distinct_tables(observations: &[Observation]) -> usize {
    let mut names: Vec<&str> = observations.iter().map(|o| o.entity_id.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    names.len()
}
