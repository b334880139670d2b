use anyhow::Result;
use tracing::instrument;

use crate::app::AppContext;
use crate::dashboard;
use crate::db::MeteredWarehouse;

/// Re-render the dashboard with the configured options and publish it.
#[instrument(skip_all)]
pub async fn run(ctx: &AppContext) -> Result<()> {
    let warehouse = MeteredWarehouse::new(ctx.warehouse.as_ref(), &ctx.metrics);
    let snapshot = dashboard::render(
        &warehouse,
        &ctx.config.dashboard,
        &ctx.config.sections,
    )
    .await?;

    ctx.metrics.set_dashboard_metrics(ctx.account(), &snapshot);
    ctx.state.update_dashboard(snapshot).await;
    Ok(())
}
