//! Control-plane contract for the fleet worker.
//!
//! The worker owns no durable state of its own besides the shared work
//! store. Runs, playbooks, secrets, hosts, approvals and notifications all
//! live behind the control plane, which is reached through the
//! [`ControlPlane`] trait defined here.
//!
//! # Overview
//!
//! - **Runs**: [`ControlPlane::claim_run`] is the only way a run moves from
//!   `pending` to `running`; the control plane makes it atomic across
//!   workers. Logs and terminal status are written back with
//!   [`ControlPlane::append_log`] and [`ControlPlane::set_status`].
//! - **Secrets**: plaintext is only ever obtained through
//!   [`ControlPlane::reveal_secret`], and only for the duration of a run.
//! - **Errors** are classified by [`ControlPlaneError`] so callers can tell
//!   a permanent refusal (4xx) from a transient failure (5xx, transport).
//!
//! Every operation is scoped to a project; the HTTP implementation sends it
//! as the `X-Project-Id` header.
//!
//! # Example
//!
//! ```rust,no_run
//! use fleet_harness::control_plane::{ControlPlane, ControlPlaneError};
//!
//! async fn claim(cp: &dyn ControlPlane) -> Result<(), ControlPlaneError> {
//!     match cp.claim_run(1, 42).await {
//!         Ok(claimed) => println!("claimed {}", claimed.run.id),
//!         Err(e) if e.is_transient() => println!("retry later: {e}"),
//!         Err(e) => println!("already handled elsewhere: {e}"),
//!     }
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use fleet_core::types::{
    Approval, ApprovalId, ClaimedRun, Host, HostId, LeaseId, NewSecret, PlaybookId, Playbook,
    Project, ProjectId, RevealedSecret, Run, RunId, RunRequest, RunStatus, Schedule, SecretId,
    SecretLease, SecretMeta,
};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Failure talking to the control plane.
///
/// The variant decides retry behaviour:
///
/// | variant     | meaning                                   | transient |
/// |-------------|-------------------------------------------|-----------|
/// | `Client`    | 4xx: already claimed, not found, invalid  | no        |
/// | `Server`    | 5xx                                       | yes       |
/// | `Transport` | connect/timeout/IO before a status        | yes       |
/// | `Decode`    | a 2xx body that did not match the schema  | no        |
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    /// The control plane refused the request. `body` is truncated.
    #[error("control plane refused request (status {status}): {body}")]
    Client { status: u16, body: String },

    /// The control plane failed while handling the request.
    #[error("control plane error (status {status}): {body}")]
    Server { status: u16, body: String },

    /// The request never produced a response.
    #[error("control plane unreachable: {0}")]
    Transport(String),

    /// The response could not be decoded.
    #[error("control plane response decode failed: {0}")]
    Decode(String),
}

impl ControlPlaneError {
    /// Classify an HTTP status code with its (already truncated) body.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if status >= 500 {
            ControlPlaneError::Server { status, body }
        } else {
            ControlPlaneError::Client { status, body }
        }
    }

    /// Server and transport failures may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ControlPlaneError::Server { .. } | ControlPlaneError::Transport(_)
        )
    }

    pub fn is_client(&self) -> bool {
        matches!(self, ControlPlaneError::Client { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ControlPlaneError::Client { status, .. } | ControlPlaneError::Server { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ControlPlane
// ---------------------------------------------------------------------------

/// Operations the worker needs from the control plane.
///
/// Implementations must be cheap to share (`Arc<dyn ControlPlane>`) and safe
/// to call concurrently from every worker loop.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    // -- Projects -----------------------------------------------------------

    /// Projects to fan periodic work out over. Implementations fall back to
    /// the default project when the listing is unavailable or empty.
    async fn list_projects(&self) -> Result<Vec<Project>, ControlPlaneError>;

    // -- Runs ---------------------------------------------------------------

    /// Atomically move a `pending` run to `running` and return its spec.
    /// A run that is not pending is refused with a `Client` error.
    async fn claim_run(&self, project_id: ProjectId, run_id: RunId) -> Result<ClaimedRun, ControlPlaneError>;

    /// Append a chunk to the run's log. Only valid before the run is terminal.
    async fn append_log(&self, project_id: ProjectId, run_id: RunId, chunk: &str) -> Result<(), ControlPlaneError>;

    async fn set_status(
        &self,
        project_id: ProjectId,
        run_id: RunId,
        status: RunStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), ControlPlaneError>;

    async fn list_runs(&self, project_id: ProjectId) -> Result<Vec<Run>, ControlPlaneError>;

    /// Create a `pending` run of a playbook. The returned run carries the
    /// resolved target snapshot.
    async fn create_run(
        &self,
        project_id: ProjectId,
        playbook_id: PlaybookId,
        request: &RunRequest,
    ) -> Result<Run, ControlPlaneError>;

    // -- Playbooks ----------------------------------------------------------

    async fn list_playbooks(&self, project_id: ProjectId) -> Result<Vec<Playbook>, ControlPlaneError>;

    async fn update_playbook_schedule(
        &self,
        project_id: ProjectId,
        playbook_id: PlaybookId,
        schedule: &Schedule,
    ) -> Result<(), ControlPlaneError>;

    // -- Secrets ------------------------------------------------------------

    /// Decrypt a secret for internal use. Never log the result.
    async fn reveal_secret(&self, project_id: ProjectId, secret_id: SecretId) -> Result<RevealedSecret, ControlPlaneError>;

    async fn get_secret(&self, project_id: ProjectId, secret_id: SecretId) -> Result<SecretMeta, ControlPlaneError>;

    async fn list_secrets(&self, project_id: ProjectId) -> Result<Vec<SecretMeta>, ControlPlaneError>;

    async fn create_secret(&self, project_id: ProjectId, secret: &NewSecret) -> Result<SecretMeta, ControlPlaneError>;

    /// Overwrite a secret's value, stamping `last_rotated_at` and
    /// recomputing `next_rotated_at`.
    async fn rotate_secret(
        &self,
        project_id: ProjectId,
        secret_id: SecretId,
        value: &str,
        passphrase: Option<&str>,
    ) -> Result<SecretMeta, ControlPlaneError>;

    /// Ask the control plane to drive the apply flow itself. Refused with a
    /// `Client` error when the secret has no apply configuration.
    async fn rotate_secret_apply(&self, project_id: ProjectId, secret_id: SecretId, value: &str) -> Result<(), ControlPlaneError>;

    async fn delete_secret(&self, project_id: ProjectId, secret_id: SecretId) -> Result<(), ControlPlaneError>;

    // -- Leases -------------------------------------------------------------

    /// Leases of the project that are not yet revoked.
    async fn list_leases(&self, project_id: ProjectId) -> Result<Vec<SecretLease>, ControlPlaneError>;

    async fn revoke_lease(&self, project_id: ProjectId, lease_id: LeaseId) -> Result<(), ControlPlaneError>;

    // -- Hosts and groups ---------------------------------------------------

    async fn recompute_dynamic_groups(&self, project_id: ProjectId) -> Result<(), ControlPlaneError>;

    /// Hosts whose connection credential is `secret_id`.
    async fn list_hosts_for_credential(&self, project_id: ProjectId, secret_id: SecretId) -> Result<Vec<Host>, ControlPlaneError>;

    async fn push_host_facts(&self, project_id: ProjectId, host_id: HostId, facts: &Value) -> Result<(), ControlPlaneError>;

    // -- Approvals ----------------------------------------------------------

    async fn request_approval(&self, project_id: ProjectId, run_id: RunId, reason: &str) -> Result<Approval, ControlPlaneError>;

    async fn get_approval(&self, project_id: ProjectId, approval_id: ApprovalId) -> Result<Approval, ControlPlaneError>;

    // -- Notifications ------------------------------------------------------

    async fn emit_notification(&self, project_id: ProjectId, event: &str, payload: &Value) -> Result<(), ControlPlaneError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
