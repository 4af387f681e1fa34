use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use fleet_core::config::Config;
use fleet_core::store::WorkStore;
use fleet_harness::http::HttpControlPlane;
use fleet_harness::shutdown::ShutdownSignal;
use fleet_harness::token::TokenMinter;
use fleet_telemetry::metrics::{global_metrics, names};

use crate::context::WorkerContext;
use crate::leases::LeaseReaper;
use crate::rotation::{RotationManager, RotationReport};
use crate::scheduler::Scheduler;
use crate::watchdog::{Watchdog, WatchdogReport};
use crate::{consumer, recompute, strategy};

/// Signing key used when the configured environment variable is unset.
const DEVELOPMENT_SIGNING_KEY: &str = "change-me";

/// Extra time granted on shutdown beyond the run timeout.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// The worker process: the queue consumer plus the periodic loops.
///
/// Every loop owns a clone of the [`WorkerContext`] and stops when its
/// `ShutdownSignal` is triggered. An in-flight run is finished before the
/// consumer exits.
pub struct Daemon {
    ctx: WorkerContext,
}

impl Daemon {
    /// Wire the HTTP control plane, the work store and the run strategy from config.
    pub async fn from_config(config: Config) -> Result<Self> {
        let signing_key = match config.control_plane.signing_key() {
            Some(key) => key,
            None => {
                warn!(
                    env = %config.control_plane.signing_key_env,
                    "signing key not set, using development default"
                );
                DEVELOPMENT_SIGNING_KEY.to_string()
            }
        };
        let minter = TokenMinter::new(signing_key.as_bytes(), config.control_plane.token_ttl_secs)
            .context("failed to build service token minter")?;
        let control_plane = HttpControlPlane::new(
            &config.control_plane.base_url,
            minter,
            config.control_plane.request_timeout(),
        )
        .context("failed to build control plane client")?;
        let store = WorkStore::open(&config.store.path)
            .await
            .with_context(|| format!("failed to open work store at {}", config.store.path.display()))?;
        let strategy = strategy::probe(&config.execution).await;

        Ok(Self::with_context(WorkerContext::new(
            config,
            Arc::new(control_plane),
            Arc::new(store),
            strategy,
        )))
    }

    pub fn with_context(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.ctx.shutdown.clone()
    }

    /// Run every loop until shutdown, then wait for them to drain.
    pub async fn run(self) -> Result<()> {
        let ctx = self.ctx;
        let intervals = &ctx.config.intervals;
        let mut tasks = JoinSet::new();

        tasks.spawn(consumer::run(ctx.clone()));

        tasks.spawn(periodic("watchdog", secs(intervals.watchdog_secs), ctx.shutdown.clone(), {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move {
                    let report = Watchdog::new(&ctx).sweep(Utc::now()).await;
                    if report != WatchdogReport::default() {
                        info!(requeued = report.requeued, reaped = report.reaped, rejected = report.rejected, "watchdog pass");
                    }
                    match ctx.store.purge_expired().await {
                        Ok(purged) if purged > 0 => debug!(purged, "expired store keys purged"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "store purge failed"),
                    }
                }
            }
        }));

        tasks.spawn(periodic("scheduler", secs(intervals.schedule_secs), ctx.shutdown.clone(), {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move {
                    let fired = Scheduler::new(&ctx).sweep(Utc::now()).await;
                    if fired > 0 {
                        info!(fired, "scheduler pass");
                    }
                }
            }
        }));

        tasks.spawn(periodic("rotation", secs(intervals.rotation_secs), ctx.shutdown.clone(), {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move {
                    let report = RotationManager::new(&ctx).sweep(Utc::now()).await;
                    if report != RotationReport::default() {
                        info!(rotated = report.rotated, notified = report.notified, "rotation pass");
                    }
                }
            }
        }));

        tasks.spawn(periodic("leases", secs(intervals.lease_secs), ctx.shutdown.clone(), {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move {
                    let revoked = LeaseReaper::new(&ctx).sweep(Utc::now()).await;
                    if revoked > 0 {
                        info!(revoked, "lease pass");
                    }
                }
            }
        }));

        tasks.spawn(periodic("recompute", secs(intervals.recompute_secs), ctx.shutdown.clone(), {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move {
                    let projects = recompute::sweep(&ctx).await;
                    debug!(projects, "dynamic group pass");
                }
            }
        }));

        let loops = tasks.len();
        info!(loops, strategy = ctx.strategy.name(), "fleet worker running");

        ctx.shutdown.subscribe().wait().await;
        let drain_timeout = ctx.config.execution.run_timeout() + DRAIN_GRACE;
        if !ctx.shutdown.wait_for_drain(loops, drain_timeout).await.is_complete() {
            tasks.abort_all();
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "worker loop panicked");
                }
            }
        }
        info!(metrics = %global_metrics().snapshot_json(), "fleet worker stopped");
        Ok(())
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

/// Run `body` every `period` until shutdown. A panicking pass is logged
/// and the loop carries on with the next tick.
async fn periodic<F, Fut>(name: &'static str, period: Duration, shutdown: ShutdownSignal, mut body: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let _drained = shutdown.guard();
    let mut listener = shutdown.subscribe();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(name, period_secs = period.as_secs(), "loop started");

    loop {
        tokio::select! {
            _ = listener.wait() => break,
            _ = ticker.tick() => {
                if AssertUnwindSafe(body()).catch_unwind().await.is_err() {
                    error!(name, "loop iteration panicked");
                    global_metrics().increment_counter(names::LOOP_ERRORS, &[("loop", name)]);
                }
            }
        }
    }
    info!(name, "loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn periodic_survives_panics_and_stops_on_shutdown() {
        let shutdown = ShutdownSignal::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(periodic("test", Duration::from_millis(20), shutdown.clone(), {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first pass fails");
                    }
                }
            }
        }));

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.trigger();
        handle.await.unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert!(shutdown.wait_for_drain(1, Duration::from_millis(10)).await.is_complete());
    }
}
