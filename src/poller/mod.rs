use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::app::AppContext;

mod refresh;

pub const REFRESH_LOOP: &str = "refresh";

type LoopFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type LoopFn = fn(AppContext) -> LoopFuture;

/// Spawn all poller loops and return their join handles.
pub fn spawn_all(ctx: AppContext) -> Vec<JoinHandle<()>> {
    let interval = ctx.config.sample_intervals.refresh;
    // Managed ML functions routinely take tens of seconds.
    let budget = Duration::from_secs(120);

    vec![spawn_loop(ctx, REFRESH_LOOP, interval, budget, poll_refresh)]
}

fn spawn_loop(
    ctx: AppContext,
    loop_name: &'static str,
    interval: Duration,
    budget: Duration,
    poll_fn: LoopFn,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            loop_name,
            interval = ?interval,
            budget = ?budget,
            "starting poller loop"
        );

        // The first tick completes immediately, so the dashboard renders on startup.
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(err) = poll_once(ctx.clone(), loop_name, budget, poll_fn).await {
                error!(loop_name, error = ?err, "poller loop iteration failed");
            }
        }
    })
}

pub(crate) async fn poll_once(
    ctx: AppContext,
    loop_name: &'static str,
    budget: Duration,
    poll_fn: LoopFn,
) -> Result<()> {
    let start = Instant::now();
    match poll_fn(ctx.clone()).await {
        Ok(_) => {
            let elapsed = start.elapsed();
            ctx.metrics.observe_duration(loop_name, elapsed);
            if elapsed > budget {
                warn!(
                    loop_name,
                    elapsed = ?elapsed,
                    budget = ?budget,
                    "loop exceeded budget"
                );
            } else {
                info!(
                    loop_name,
                    elapsed = ?elapsed,
                    "loop completed successfully"
                );
            }
            ctx.metrics.record_success(loop_name, true);
            ctx.state.record_loop_success(loop_name).await;
            Ok(())
        }
        Err(err) => {
            ctx.metrics.record_success(loop_name, false);
            ctx.metrics.inc_error(loop_name);
            ctx.state
                .record_loop_failure(loop_name, format!("{err:#}"))
                .await;
            Err(err)
        }
    }
}

/// Run a single refresh outside the schedule (used by `--once`).
pub async fn refresh_now(ctx: &AppContext) -> Result<()> {
    poll_once(
        ctx.clone(),
        REFRESH_LOOP,
        Duration::from_secs(120),
        poll_refresh,
    )
    .await
}

fn poll_refresh(ctx: AppContext) -> LoopFuture {
    Box::pin(async move { refresh::run(&ctx).await })
}
