//! Approval gate for runs that touch protected environments.
//!
//! A gated run is never queued directly: [`ApprovalGate::submit`] opens an
//! approval and leaves the run `pending`. Once a human decides,
//! [`ApprovalGate::on_decision`] either queues the run or fails it. A gated
//! run whose approval cannot be opened is failed on the spot.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use fleet_core::store::QueueItem;
use fleet_core::types::{Approval, ApprovalId, ApprovalStatus, Run, RunStatus};
use fleet_harness::control_plane::ControlPlaneError;

use crate::context::WorkerContext;
use crate::rotation::RotationManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Enqueued,
    AwaitingApproval(ApprovalId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Enqueued,
    Rejected,
    StillPending,
}

pub struct ApprovalGate<'a> {
    ctx: &'a WorkerContext,
}

impl<'a> ApprovalGate<'a> {
    pub fn new(ctx: &'a WorkerContext) -> Self {
        Self { ctx }
    }

    /// A run needs approval when any snapshot host is in a protected environment.
    pub fn requires_approval(&self, run: &Run) -> bool {
        run.target_snapshot
            .hosts
            .iter()
            .filter_map(|h| h.environment.as_deref())
            .any(|env| self.ctx.config.approval.is_protected(env))
    }

    /// Queue `run`, or open an approval for it when it is gated.
    pub async fn submit(&self, run: &Run, reason: &str) -> Result<GateOutcome> {
        if !self.requires_approval(run) {
            self.ctx
                .enqueue(QueueItem::new(run.project_id, run.id))
                .await
                .context("failed to enqueue run")?;
            return Ok(GateOutcome::Enqueued);
        }

        let approval = match self
            .ctx
            .control_plane
            .request_approval(run.project_id, run.id, reason)
            .await
        {
            Ok(approval) => approval,
            Err(e) => {
                let line = format!("==> error: approval request failed: {e}; marking failed\n");
                if let Err(status_err) = self.fail(run, &line).await {
                    warn!(run_id = run.id, error = %status_err, "failed to fail run without approval");
                }
                return Err(e).with_context(|| format!("failed to request approval for run {}", run.id));
            }
        };
        info!(run_id = run.id, approval_id = approval.id, "run held for approval");

        let payload = json!({
            "run_id": run.id,
            "approval_id": approval.id,
            "playbook_id": run.playbook_id,
            "reason": reason,
        });
        if let Err(e) = self
            .ctx
            .control_plane
            .emit_notification(run.project_id, "approval.requested", &payload)
            .await
        {
            warn!(run_id = run.id, error = %e, "approval notification failed");
        }
        Ok(GateOutcome::AwaitingApproval(approval.id))
    }

    /// Apply a decision on `run`: approved runs are queued, rejected runs
    /// are failed and their rotation, if any, is wound up.
    pub async fn on_decision(&self, run: &Run, approval: &Approval) -> Result<Decision> {
        match approval.status {
            ApprovalStatus::Pending => Ok(Decision::StillPending),
            ApprovalStatus::Approved => {
                self.ctx
                    .enqueue(QueueItem::new(run.project_id, run.id))
                    .await
                    .context("failed to enqueue approved run")?;
                info!(run_id = run.id, approval_id = approval.id, "approved run queued");
                Ok(Decision::Enqueued)
            }
            ApprovalStatus::Rejected => {
                let by = approval.decided_by.as_deref().unwrap_or("unknown");
                let line = format!("==> approval rejected by {by}; marking failed\n");
                if !self.fail(run, &line).await.context("failed to fail rejected run")? {
                    return Ok(Decision::Rejected);
                }
                if let Some(link) = run.target_snapshot.rotation {
                    RotationManager::new(self.ctx)
                        .finalize(run.project_id, run.id, link, RunStatus::Failed)
                        .await;
                }
                info!(run_id = run.id, approval_id = approval.id, "rejected run failed");
                Ok(Decision::Rejected)
            }
        }
    }

    /// Log `line` and mark `run` failed. Returns `false` when the run had
    /// already finished and nothing was written.
    async fn fail(&self, run: &Run, line: &str) -> Result<bool, ControlPlaneError> {
        if !run.status.can_transition_to(&RunStatus::Failed) {
            debug!(run_id = run.id, status = %run.status, "run already finished, leaving status");
            return Ok(false);
        }
        let cp = &self.ctx.control_plane;
        if let Err(e) = cp.append_log(run.project_id, run.id, line).await {
            warn!(run_id = run.id, error = %e, "append-log failed");
        }
        cp.set_status(run.project_id, run.id, RunStatus::Failed, Some(Utc::now()))
            .await?;
        Ok(true)
    }
}
