use tracing::{debug, warn};

use crate::context::WorkerContext;

/// Ask the control plane to rebuild dynamic group membership in every
/// project in scope. Returns the number of projects recomputed.
pub async fn sweep(ctx: &WorkerContext) -> usize {
    let mut done = 0;
    for project_id in ctx.projects().await {
        match ctx.control_plane.recompute_dynamic_groups(project_id).await {
            Ok(()) => {
                debug!(project_id, "dynamic groups recomputed");
                done += 1;
            }
            Err(e) => warn!(project_id, error = %e, "dynamic group recompute failed"),
        }
    }
    done
}
