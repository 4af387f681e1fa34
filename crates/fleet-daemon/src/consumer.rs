//! Queue consumer: pops run references and drives them through the
//! pipeline, with bounded retries per run.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tracing::{error, info, warn};

use fleet_core::store::{QueueItem, StoreError};
use fleet_core::types::{RunId, RunStatus};
use fleet_telemetry::metrics::{global_metrics, names};

use crate::context::WorkerContext;
use crate::keys;
use crate::pipeline::{Disposition, Pipeline};

const MAX_BACKOFF_SECS: u64 = 5;
const STORE_ERROR_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Requeue { attempts: i64, backoff: Duration },
    Abort { attempts: i64 },
}

/// Why a run went back through the retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The control plane asked us to try again later.
    Transient,
    /// The pipeline errored or panicked.
    Crash,
}

impl FailureKind {
    fn abort_line(self, attempts: i64) -> String {
        match self {
            FailureKind::Transient => {
                format!("==> abort: too many attempts ({attempts}) to claim/execute run; marking failed")
            }
            FailureKind::Crash => {
                format!("==> abort: worker crashed {attempts} times executing run; marking failed")
            }
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Crash => "crash",
        }
    }
}

/// `min(5, 1 + attempts)` seconds.
pub fn backoff_for(attempts: i64) -> Duration {
    let attempts = u64::try_from(attempts).unwrap_or(0);
    Duration::from_secs(attempts.saturating_add(1).min(MAX_BACKOFF_SECS))
}

/// Attempt accounting backed by the work store, so it survives restarts
/// and is shared by every worker on the host.
pub struct RetryController<'a> {
    ctx: &'a WorkerContext,
}

impl<'a> RetryController<'a> {
    pub fn new(ctx: &'a WorkerContext) -> Self {
        Self { ctx }
    }

    pub async fn record_failure(&self, run_id: RunId) -> Result<RetryDecision, StoreError> {
        let attempts = self
            .ctx
            .store
            .incr_with_ttl(&keys::attempt(run_id), keys::ATTEMPT_TTL)
            .await?;
        if attempts > i64::from(self.ctx.config.execution.max_retries) {
            Ok(RetryDecision::Abort { attempts })
        } else {
            Ok(RetryDecision::Requeue {
                attempts,
                backoff: backoff_for(attempts),
            })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Process one raw queue entry. Returns the backoff to wait before the
/// next pop when the run was requeued.
pub async fn process_one(ctx: &WorkerContext, raw: &str) -> Option<Duration> {
    let Some(item) = QueueItem::parse(raw) else {
        warn!(raw, "dropping malformed queue item");
        return None;
    };

    let result = AssertUnwindSafe(Pipeline::new(ctx).execute(item))
        .catch_unwind()
        .await;
    let kind = match result {
        Ok(Ok(Disposition::Handled)) => return None,
        Ok(Ok(Disposition::Retry)) => FailureKind::Transient,
        Ok(Err(e)) => {
            error!(project_id = item.project_id, run_id = item.run_id, error = %e, "run execution failed");
            FailureKind::Crash
        }
        Err(payload) => {
            error!(
                project_id = item.project_id,
                run_id = item.run_id,
                panic = %panic_message(payload.as_ref()),
                "run execution panicked"
            );
            FailureKind::Crash
        }
    };
    handle_failure(ctx, item, kind).await
}

async fn handle_failure(ctx: &WorkerContext, item: QueueItem, kind: FailureKind) -> Option<Duration> {
    let metrics = global_metrics();
    match RetryController::new(ctx).record_failure(item.run_id).await {
        Ok(RetryDecision::Abort { attempts }) => {
            warn!(run_id = item.run_id, attempts, kind = kind.as_str(), "retry budget exhausted, failing run");
            metrics.increment_counter(names::RUN_RETRIES, &[("outcome", "abort"), ("kind", kind.as_str())]);
            abort_run(ctx, item, kind.abort_line(attempts)).await;
            None
        }
        Ok(RetryDecision::Requeue { attempts, backoff }) => {
            info!(run_id = item.run_id, attempts, backoff_secs = backoff.as_secs(), "requeueing run");
            metrics.increment_counter(names::RUN_RETRIES, &[("outcome", "requeue"), ("kind", kind.as_str())]);
            if let Err(e) = ctx.enqueue(item).await {
                error!(run_id = item.run_id, error = %e, "requeue failed");
            }
            Some(backoff)
        }
        Err(e) => {
            error!(run_id = item.run_id, error = %e, "attempt counter unavailable, requeueing");
            if let Err(e) = ctx.enqueue(item).await {
                error!(run_id = item.run_id, error = %e, "requeue failed");
            }
            Some(backoff_for(1))
        }
    }
}

async fn abort_run(ctx: &WorkerContext, item: QueueItem, line: String) {
    let cp = &ctx.control_plane;
    if let Err(e) = cp.append_log(item.project_id, item.run_id, &format!("{line}\n")).await {
        warn!(run_id = item.run_id, error = %e, "append-log failed");
    }
    if let Err(e) = cp
        .set_status(item.project_id, item.run_id, RunStatus::Failed, Some(Utc::now()))
        .await
    {
        warn!(run_id = item.run_id, error = %e, "failed to mark aborted run failed");
    }
}

/// Consume the queue until shutdown.
///
/// A popped item is always processed to completion; shutdown is only
/// observed between items.
pub async fn run(ctx: WorkerContext) {
    let _drained = ctx.shutdown.guard();
    let mut listener = ctx.shutdown.subscribe();
    let wait = Duration::from_secs(ctx.config.intervals.queue_pop_wait_secs);
    let metrics = global_metrics();
    info!("queue consumer started");

    while !listener.is_shutting_down() {
        let raw = match ctx.store.pop_front_wait(wait).await {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "queue pop failed");
                metrics.increment_counter(names::LOOP_ERRORS, &[("loop", "consumer")]);
                listener.sleep(STORE_ERROR_PAUSE).await;
                continue;
            }
        };
        if let Ok(depth) = ctx.store.len().await {
            metrics.set_gauge(names::QUEUE_DEPTH, i64::try_from(depth).unwrap_or(i64::MAX));
        }
        if let Some(backoff) = process_one(&ctx, &raw).await {
            listener.sleep(backoff).await;
        }
    }
    info!("queue consumer stopped");
}
