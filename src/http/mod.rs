use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, get_service};
use serde::Deserialize;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::app::AppContext;
use crate::config::{DashboardOptions, Sections};
use crate::dashboard::{self, DashboardSnapshot};
use crate::db::MeteredWarehouse;
use crate::poller::REFRESH_LOOP;
use crate::state::LoopHealth;

const LOOP_NAMES: &[&str] = &[REFRESH_LOOP];

pub fn create_router(ctx: AppContext) -> Router {
    let static_dir = ctx.config.http.static_dir.clone();

    let asset_service = get_service(ServeDir::new(static_dir));

    let api = Router::new()
        .route("/dashboard", get(get_dashboard))
        .route("/render", get(get_render))
        .route("/loops", get(get_loops));

    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/metrics", get(get_metrics))
        .nest("/api/v1", api)
        .fallback_service(asset_service)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn get_healthz(State(ctx): State<AppContext>) -> StatusCode {
    let staleness = health_staleness(ctx.config.sample_intervals.refresh);
    let is_ready = ctx.state.is_ready(LOOP_NAMES, staleness).await;

    if is_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Two missed refreshes plus one slow render before reporting unhealthy.
fn health_staleness(refresh: Duration) -> Duration {
    refresh
        .saturating_mul(2)
        .saturating_add(Duration::from_secs(120))
}

async fn get_metrics(State(ctx): State<AppContext>) -> Response {
    match ctx.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = ?err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn get_dashboard(
    State(ctx): State<AppContext>,
) -> Result<Json<DashboardSnapshot>, StatusCode> {
    ctx.state
        .dashboard()
        .await
        .map(Json)
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)
}

async fn get_loops(State(ctx): State<AppContext>) -> Json<Vec<LoopHealth>> {
    Json(ctx.state.loop_health().await)
}

/// Per-request overrides for an on-demand render.
/// Query params:
///   ?days=14 (7..=90)  ?top=3
///   ?anomaly=false  ?forecast=false  ?summary=false
#[derive(Debug, Default, Deserialize)]
pub struct RenderParams {
    pub days: Option<u32>,
    pub top: Option<usize>,
    pub anomaly: Option<bool>,
    pub forecast: Option<bool>,
    pub summary: Option<bool>,
}

/// Merge overrides onto the configured view, rejecting out-of-range values.
pub fn apply_render_params(
    base: &DashboardOptions,
    sections: &Sections,
    params: &RenderParams,
) -> Result<(DashboardOptions, Sections), String> {
    let mut options = base.clone();
    if let Some(days) = params.days {
        options.days_back = days;
    }
    if let Some(top) = params.top {
        options.top_n = top;
    }
    options.validate().map_err(|err| err.to_string())?;

    let sections = Sections {
        anomaly_detection: params.anomaly.unwrap_or(sections.anomaly_detection),
        forecast: params.forecast.unwrap_or(sections.forecast),
        summary: params.summary.unwrap_or(sections.summary),
    };
    Ok((options, sections))
}

async fn get_render(
    State(ctx): State<AppContext>,
    Query(params): Query<RenderParams>,
) -> Response {
    let (options, sections) =
        match apply_render_params(&ctx.config.dashboard, &ctx.config.sections, &params) {
            Ok(resolved) => resolved,
            Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
        };

    let warehouse = MeteredWarehouse::new(ctx.warehouse.as_ref(), &ctx.metrics);
    match dashboard::render(&warehouse, &options, &sections).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => {
            warn!(error = ?err, "on-demand render failed");
            (StatusCode::BAD_GATEWAY, format!("{err:#}")).into_response()
        }
    }
}
