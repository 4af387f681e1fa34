//! Names and lifetimes of the advisory keys kept in the work store.

use std::time::Duration;

use chrono::NaiveDate;
use fleet_core::types::{PlaybookId, ProjectId, RunId, SecretId};

pub const ATTEMPT_TTL: Duration = Duration::from_secs(3600);
pub const REQUEUE_LOCK_TTL: Duration = Duration::from_secs(300);
pub const SCHEDULE_LOCK_TTL: Duration = Duration::from_secs(300);
pub const EXPIRY_NOTICE_TTL: Duration = Duration::from_secs(86_400);

/// Durable per-run attempt counter.
pub fn attempt(run_id: RunId) -> String {
    format!("fleet:runs:attempt:{run_id}")
}

pub fn requeue_lock(project_id: ProjectId, run_id: RunId) -> String {
    format!("fleet:runs:requeue:{project_id}:{run_id}")
}

/// One key per playbook and due instant.
pub fn schedule_lock(project_id: ProjectId, playbook_id: PlaybookId, due_key: &str) -> String {
    format!("fleet:schedule:lock:{project_id}:{playbook_id}:{due_key}")
}

pub fn rotation_lock(secret_id: SecretId) -> String {
    format!("fleet:secret:rotate:{secret_id}")
}

pub fn expiry_notice(secret_id: SecretId, expires_on: NaiveDate) -> String {
    format!("fleet:secret:expiring:{secret_id}:{expires_on}")
}
