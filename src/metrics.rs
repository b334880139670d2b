use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::dashboard::{DashboardSnapshot, Section};

/// Metrics registry for the service scraped by Prometheus.
#[derive(Clone)]
pub struct AppMetrics {
    registry: Arc<Registry>,
    loops: LoopMetrics,
    queries: QueryMetrics,
    storage: StorageMetrics,
    sections: SectionMetrics,
}

impl AppMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new_custom(Some("stormon".into()), None)?);

        let loops = LoopMetrics::register(&registry)?;
        let queries = QueryMetrics::register(&registry)?;
        let storage = StorageMetrics::register(&registry)?;
        let sections = SectionMetrics::register(&registry)?;

        Ok(Self {
            registry,
            loops,
            queries,
            storage,
            sections,
        })
    }

    /// Observe the execution duration for a loop.
    pub fn observe_duration(&self, loop_name: &str, duration: Duration) {
        self.loops
            .scrape_duration
            .with_label_values(&[loop_name])
            .observe(duration.as_secs_f64());
    }

    /// Record a success flag for a loop iteration (1=success, 0=failed).
    pub fn record_success(&self, loop_name: &str, success: bool) {
        self.loops
            .last_success
            .with_label_values(&[loop_name])
            .set(if success { 1 } else { 0 });
    }

    /// Increment the error counter for a loop.
    pub fn inc_error(&self, loop_name: &str) {
        self.loops
            .errors_total
            .with_label_values(&[loop_name])
            .inc();
    }

    /// Observe one warehouse statement round trip.
    pub fn observe_query(&self, query: &str, duration: Duration, success: bool) {
        self.queries
            .duration
            .with_label_values(&[query])
            .observe(duration.as_secs_f64());
        if !success {
            self.queries.failures_total.with_label_values(&[query]).inc();
        }
    }

    /// Export the top tables and section outcomes of a render.
    pub fn set_dashboard_metrics(&self, account: &str, snapshot: &DashboardSnapshot) {
        self.storage.table_size_gb.reset();
        for ranked in &snapshot.top_tables {
            let table = sanitize_label(&ranked.table);
            let rank = ranked.rank.to_string();
            self.storage
                .table_size_gb
                .with_label_values(&[account, table.as_str(), rank.as_str()])
                .set(ranked.size_value);
        }

        let latest = snapshot
            .latest_date
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc().timestamp())
            .unwrap_or(0);
        self.storage
            .latest_usage_date
            .with_label_values(&[account])
            .set(latest);
        self.storage
            .tables_observed
            .with_label_values(&[account])
            .set(snapshot.tables_observed as i64);

        self.set_section(account, "anomaly_detection", &snapshot.anomalies);
        self.set_section(account, "forecast", &snapshot.forecast);
        self.set_section(account, "summary", &snapshot.summary);

        // Sections without data report zero.
        let anomalies = snapshot.anomalies.data().map_or(0, Vec::len);
        self.sections
            .anomalies_detected
            .with_label_values(&[account])
            .set(anomalies as i64);
        let forecast_rows = snapshot.forecast.data().map_or(0, Vec::len);
        self.sections
            .forecast_rows
            .with_label_values(&[account])
            .set(forecast_rows as i64);
    }

    fn set_section<T>(&self, account: &str, section: &str, outcome: &Section<T>) {
        let value = match outcome {
            Section::Ready { .. } => 1,
            Section::Failed { .. } => 0,
            Section::Skipped => -1,
        };
        self.sections
            .state
            .with_label_values(&[account, section])
            .set(value);
    }

    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[derive(Clone)]
struct LoopMetrics {
    scrape_duration: HistogramVec,
    last_success: IntGaugeVec,
    errors_total: IntCounterVec,
}

impl LoopMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let scrape_duration = HistogramVec::new(
            HistogramOpts::new("loop_duration_seconds", "Loop execution duration"),
            &["loop"],
        )?;
        registry.register(Box::new(scrape_duration.clone()))?;

        let last_success = IntGaugeVec::new(
            Opts::new(
                "loop_last_success",
                "Loop success flag (1=success, 0=failure)",
            ),
            &["loop"],
        )?;
        registry.register(Box::new(last_success.clone()))?;

        let errors_total =
            IntCounterVec::new(Opts::new("loop_errors_total", "Total loop errors"), &["loop"])?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            scrape_duration,
            last_success,
            errors_total,
        })
    }
}

#[derive(Clone)]
struct QueryMetrics {
    duration: HistogramVec,
    failures_total: IntCounterVec,
}

impl QueryMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "warehouse_query_duration_seconds",
                "Warehouse statement round trip including polling",
            )
            .buckets(vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["query"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        let failures_total = IntCounterVec::new(
            Opts::new(
                "warehouse_query_failures_total",
                "Warehouse statements that returned an error",
            ),
            &["query"],
        )?;
        registry.register(Box::new(failures_total.clone()))?;

        Ok(Self {
            duration,
            failures_total,
        })
    }
}

#[derive(Clone)]
struct StorageMetrics {
    table_size_gb: GaugeVec,
    latest_usage_date: IntGaugeVec,
    tables_observed: IntGaugeVec,
}

impl StorageMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let table_size_gb = GaugeVec::new(
            Opts::new(
                "table_size_gb",
                "Size in GiB of the largest tables on the latest usage date",
            ),
            &["account", "table", "rank"],
        )?;
        registry.register(Box::new(table_size_gb.clone()))?;

        let latest_usage_date = IntGaugeVec::new(
            Opts::new(
                "latest_usage_date_timestamp",
                "Unix timestamp of the most recent usage date in the window",
            ),
            &["account"],
        )?;
        registry.register(Box::new(latest_usage_date.clone()))?;

        let tables_observed = IntGaugeVec::new(
            Opts::new("tables_observed", "Distinct tables seen in the window"),
            &["account"],
        )?;
        registry.register(Box::new(tables_observed.clone()))?;

        Ok(Self {
            table_size_gb,
            latest_usage_date,
            tables_observed,
        })
    }
}

#[derive(Clone)]
struct SectionMetrics {
    state: IntGaugeVec,
    anomalies_detected: IntGaugeVec,
    forecast_rows: IntGaugeVec,
}

impl SectionMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let state = IntGaugeVec::new(
            Opts::new(
                "section_state",
                "Optional section outcome (1=ready, 0=failed, -1=skipped)",
            ),
            &["account", "section"],
        )?;
        registry.register(Box::new(state.clone()))?;

        let anomalies_detected = IntGaugeVec::new(
            Opts::new(
                "anomalies_detected",
                "Rows flagged by managed anomaly detection",
            ),
            &["account"],
        )?;
        registry.register(Box::new(anomalies_detected.clone()))?;

        let forecast_rows = IntGaugeVec::new(
            Opts::new("forecast_rows", "Tables with a forecast at the horizon"),
            &["account"],
        )?;
        registry.register(Box::new(forecast_rows.clone()))?;

        Ok(Self {
            state,
            anomalies_detected,
            forecast_rows,
        })
    }
}

fn sanitize_label(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == ':' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
