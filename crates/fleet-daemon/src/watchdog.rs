//! Recovery sweep for runs that fell out of the queue or stopped
//! reporting.
//!
//! Pending runs older than the requeue threshold go back to the front of
//! the queue, at most once per lock window, unless they target a protected
//! environment: those wait for their approval, and one is opened if the run
//! never got any. Running runs whose start is older than the stale
//! threshold are failed.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use fleet_core::store::QueueItem;
use fleet_core::types::{ApprovalId, ApprovalStatus, ProjectId, Run, RunStatus};
use fleet_telemetry::metrics::{global_metrics, names};

use crate::approval::{ApprovalGate, Decision};
use crate::context::WorkerContext;
use crate::keys;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogReport {
    pub requeued: usize,
    pub reaped: usize,
    pub rejected: usize,
}

impl WatchdogReport {
    fn add(&mut self, other: WatchdogReport) {
        self.requeued += other.requeued;
        self.reaped += other.reaped;
        self.rejected += other.rejected;
    }
}

pub struct Watchdog<'a> {
    ctx: &'a WorkerContext,
}

impl<'a> Watchdog<'a> {
    pub fn new(ctx: &'a WorkerContext) -> Self {
        Self { ctx }
    }

    pub async fn sweep_project(&self, project_id: ProjectId, now: DateTime<Utc>) -> Result<WatchdogReport> {
        let runs = self
            .ctx
            .control_plane
            .list_runs(project_id)
            .await
            .with_context(|| format!("failed to list runs of project {project_id}"))?;
        let mut report = WatchdogReport::default();
        for run in &runs {
            match run.status {
                RunStatus::Pending => {
                    if let Err(e) = self.check_pending(project_id, run, now, &mut report).await {
                        warn!(project_id, run_id = run.id, error = format!("{e:#}"), "pending run check failed");
                    }
                }
                RunStatus::Running => self.check_running(project_id, run, now, &mut report).await,
                RunStatus::Success | RunStatus::Failed => {}
            }
        }
        Ok(report)
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> WatchdogReport {
        let mut total = WatchdogReport::default();
        for project_id in self.ctx.projects().await {
            match self.sweep_project(project_id, now).await {
                Ok(report) => total.add(report),
                Err(e) => warn!(project_id, error = format!("{e:#}"), "watchdog sweep failed"),
            }
        }
        total
    }

    async fn check_pending(
        &self,
        project_id: ProjectId,
        run: &Run,
        now: DateTime<Utc>,
        report: &mut WatchdogReport,
    ) -> Result<()> {
        let threshold = seconds(self.ctx.config.execution.pending_requeue_secs);
        match run.created_at {
            Some(created) if now - created >= threshold => {}
            _ => return Ok(()),
        }

        let snapshot = &run.target_snapshot;
        if let Some(approval_id) = snapshot.approval_id {
            return self.apply_approval(project_id, run, approval_id, report).await;
        }
        if snapshot.approval_status == Some(ApprovalStatus::Pending) {
            return Ok(());
        }
        if !self.take_requeue_lock(project_id, run).await {
            return Ok(());
        }

        let gate = ApprovalGate::new(self.ctx);
        if gate.requires_approval(run) {
            // Gated but never got an approval: open one instead of queueing.
            match gate.submit(run, "pending run without approval").await {
                Ok(outcome) => info!(project_id, run_id = run.id, ?outcome, "approval opened for held run"),
                Err(e) => warn!(project_id, run_id = run.id, error = format!("{e:#}"), "held run could not be submitted"),
            }
            return Ok(());
        }
        if let Err(e) = self
            .ctx
            .store
            .push_front(QueueItem::new(project_id, run.id).to_string())
            .await
        {
            warn!(project_id, run_id = run.id, error = %e, "requeue failed");
            return Ok(());
        }
        info!(project_id, run_id = run.id, "requeued stalled pending run");
        global_metrics().increment_counter(names::RUNS_REQUEUED, &[]);
        report.requeued += 1;
        Ok(())
    }

    /// The approval record decides whether a gated run may be queued.
    async fn apply_approval(
        &self,
        project_id: ProjectId,
        run: &Run,
        approval_id: ApprovalId,
        report: &mut WatchdogReport,
    ) -> Result<()> {
        let approval = match self.ctx.control_plane.get_approval(project_id, approval_id).await {
            Ok(approval) => approval,
            Err(e) => {
                debug!(run_id = run.id, approval_id, error = %e, "approval lookup failed, leaving run pending");
                return Ok(());
            }
        };
        match approval.status {
            ApprovalStatus::Pending => Ok(()),
            ApprovalStatus::Approved => {
                if !self.take_requeue_lock(project_id, run).await {
                    return Ok(());
                }
                if ApprovalGate::new(self.ctx).on_decision(run, &approval).await? == Decision::Enqueued {
                    global_metrics().increment_counter(names::RUNS_REQUEUED, &[]);
                    report.requeued += 1;
                }
                Ok(())
            }
            ApprovalStatus::Rejected => {
                ApprovalGate::new(self.ctx).on_decision(run, &approval).await?;
                report.rejected += 1;
                Ok(())
            }
        }
    }

    /// `false` when the lock is held or the store is unavailable.
    async fn take_requeue_lock(&self, project_id: ProjectId, run: &Run) -> bool {
        match self
            .ctx
            .store
            .set_if_absent(&keys::requeue_lock(project_id, run.id), keys::REQUEUE_LOCK_TTL)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                debug!(project_id, run_id = run.id, "requeue lock held, skipping");
                false
            }
            Err(e) => {
                warn!(project_id, run_id = run.id, error = %e, "requeue lock unavailable, skipping");
                false
            }
        }
    }

    async fn check_running(&self, project_id: ProjectId, run: &Run, now: DateTime<Utc>, report: &mut WatchdogReport) {
        let Some(started) = run.started_at else {
            return;
        };
        let age = now - started;
        if age < seconds(self.ctx.config.execution.stale_secs) {
            return;
        }
        let cp = &self.ctx.control_plane;
        let line = format!(
            "==> watchdog: run stuck (running for more than {}s), marking failed\n",
            age.num_seconds()
        );
        if let Err(e) = cp.append_log(project_id, run.id, &line).await {
            warn!(run_id = run.id, error = %e, "append-log failed");
        }
        match cp.set_status(project_id, run.id, RunStatus::Failed, Some(now)).await {
            Ok(()) => {
                info!(project_id, run_id = run.id, age_secs = age.num_seconds(), "reaped stale running run");
                global_metrics().increment_counter(names::RUNS_REAPED, &[]);
                report.reaped += 1;
            }
            Err(e) => warn!(project_id, run_id = run.id, error = %e, "failed to reap stale run"),
        }
    }
}

fn seconds(secs: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}
