//! Revocation of dynamic secret leases past their expiry.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use fleet_core::types::ProjectId;
use fleet_telemetry::metrics::{global_metrics, names};

use crate::context::WorkerContext;

pub struct LeaseReaper<'a> {
    ctx: &'a WorkerContext,
}

impl<'a> LeaseReaper<'a> {
    pub fn new(ctx: &'a WorkerContext) -> Self {
        Self { ctx }
    }

    /// Revoke every unrevoked lease of `project_id` expired at `now`.
    pub async fn expire_project(&self, project_id: ProjectId, now: DateTime<Utc>) -> Result<usize> {
        let cp = &self.ctx.control_plane;
        let leases = cp
            .list_leases(project_id)
            .await
            .with_context(|| format!("failed to list leases of project {project_id}"))?;

        let mut revoked = 0;
        for lease in leases.iter().filter(|l| l.is_expired(now)) {
            match cp.revoke_lease(project_id, lease.id).await {
                Ok(()) => {
                    revoked += 1;
                    info!(project_id, lease_id = lease.id, secret_id = lease.secret_id, "expired lease revoked");
                }
                Err(e) => warn!(project_id, lease_id = lease.id, error = %e, "lease revocation failed"),
            }
        }
        if revoked > 0 {
            global_metrics().increment_counter_by(names::LEASES_REVOKED, &[], revoked as u64);
        }
        Ok(revoked)
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut total = 0;
        for project_id in self.ctx.projects().await {
            match self.expire_project(project_id, now).await {
                Ok(n) => total += n,
                Err(e) => warn!(project_id, error = format!("{e:#}"), "lease sweep failed"),
            }
        }
        total
    }
}
