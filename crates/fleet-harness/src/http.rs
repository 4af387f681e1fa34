//! `reqwest` implementation of [`ControlPlane`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use fleet_core::types::{
    Approval, ApprovalId, ClaimedRun, Host, HostId, LeaseId, NewSecret, PlaybookId, Playbook,
    Project, ProjectId, RevealedSecret, Run, RunId, RunRequest, RunStatus, Schedule, SecretId,
    SecretLease, SecretMeta,
};

use crate::control_plane::{ControlPlane, ControlPlaneError};
use crate::token::TokenMinter;

/// Error bodies are cut to this many characters before logging.
const ERROR_BODY_LIMIT: usize = 200;

impl From<reqwest::Error> for ControlPlaneError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ControlPlaneError::Decode(err.to_string())
        } else {
            ControlPlaneError::Transport(err.to_string())
        }
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(ERROR_BODY_LIMIT).collect()
}

/// `worker-<tag>-<unix millis>`, correlating worker and control-plane logs.
pub fn request_id(tag: &str) -> String {
    format!("worker-{tag}-{}", Utc::now().timestamp_millis())
}

/// Control-plane client speaking the `/api/v1` HTTP API.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    minter: TokenMinter,
}

impl HttpControlPlane {
    pub fn new(base_url: &str, minter: TokenMinter, timeout: Duration) -> Result<Self, ControlPlaneError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlPlaneError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            minter,
        })
    }

    fn request(&self, method: Method, path: &str, project_id: Option<ProjectId>, tag: &str) -> RequestBuilder {
        let mut rb = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(self.minter.mint(Utc::now()))
            .header("X-Request-Id", request_id(tag));
        if let Some(pid) = project_id {
            rb = rb.header("X-Project-Id", pid.to_string());
        }
        rb
    }

    /// Send and map non-2xx statuses to classified errors.
    async fn send(&self, rb: RequestBuilder, path: &str) -> Result<Response, ControlPlaneError> {
        let resp = rb.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = truncate(&resp.text().await.unwrap_or_default());
        warn!(path, status = status.as_u16(), body = %body, "control plane request failed");
        Err(ControlPlaneError::from_status(status.as_u16(), body))
    }

    async fn json<T: DeserializeOwned>(&self, rb: RequestBuilder, path: &str) -> Result<T, ControlPlaneError> {
        let resp = self.send(rb, path).await?;
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ControlPlaneError::Decode(format!("{path}: {e}")))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, project_id: ProjectId, tag: &str) -> Result<T, ControlPlaneError> {
        let rb = self.request(Method::GET, path, Some(project_id), tag);
        self.json(rb, path).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, project_id: ProjectId, tag: &str, body: &Value) -> Result<T, ControlPlaneError> {
        let rb = self.request(Method::POST, path, Some(project_id), tag).json(body);
        self.json(rb, path).await
    }

    /// POST where the response body is ignored (usually 204).
    async fn post_empty(&self, path: &str, project_id: ProjectId, tag: &str, body: Option<&Value>) -> Result<(), ControlPlaneError> {
        let mut rb = self.request(Method::POST, path, Some(project_id), tag);
        if let Some(body) = body {
            rb = rb.json(body);
        }
        self.send(rb, path).await.map(|_| ())
    }
}

/// Claim payload: the playbook part omits project and schedule.
#[derive(Deserialize)]
struct ClaimResponse {
    run: Run,
    playbook: ClaimPlaybook,
}

#[derive(Deserialize)]
struct ClaimPlaybook {
    id: PlaybookId,
    #[serde(default)]
    name: String,
    #[serde(default)]
    stored_content: Option<String>,
    #[serde(default)]
    variables: serde_json::Map<String, Value>,
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn list_projects(&self) -> Result<Vec<Project>, ControlPlaneError> {
        let path = "/api/v1/projects/";
        let rb = self.request(Method::GET, path, None, "projects");
        match self.json::<Vec<Project>>(rb, path).await {
            Ok(projects) if !projects.is_empty() => Ok(projects),
            Ok(_) => Ok(vec![Project::default_project()]),
            Err(e) => {
                debug!(error = %e, "project listing unavailable, using default project");
                Ok(vec![Project::default_project()])
            }
        }
    }

    async fn claim_run(&self, project_id: ProjectId, run_id: RunId) -> Result<ClaimedRun, ControlPlaneError> {
        let path = format!("/api/v1/runs/{run_id}/claim");
        let rb = self.request(Method::POST, &path, Some(project_id), &format!("run-{run_id}"));
        let claim: ClaimResponse = self.json(rb, &path).await?;
        let project = claim.run.project_id;
        Ok(ClaimedRun {
            playbook: Playbook {
                id: claim.playbook.id,
                project_id: project,
                name: claim.playbook.name,
                stored_content: claim.playbook.stored_content,
                variables: claim.playbook.variables,
                schedule: None,
            },
            run: claim.run,
        })
    }

    async fn append_log(&self, project_id: ProjectId, run_id: RunId, chunk: &str) -> Result<(), ControlPlaneError> {
        if chunk.is_empty() {
            return Ok(());
        }
        let path = format!("/api/v1/runs/{run_id}/append-log");
        self.post_empty(&path, project_id, &format!("run-{run_id}"), Some(&json!({ "chunk": chunk })))
            .await
    }

    async fn set_status(
        &self,
        project_id: ProjectId,
        run_id: RunId,
        status: RunStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), ControlPlaneError> {
        let path = format!("/api/v1/runs/{run_id}/set-status");
        // The control plane stores naive UTC timestamps.
        let finished = finished_at.map(|t| t.naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string());
        let body = json!({ "status": status.as_str(), "finished_at": finished });
        self.post_empty(&path, project_id, &format!("run-{run_id}"), Some(&body)).await
    }

    async fn list_runs(&self, project_id: ProjectId) -> Result<Vec<Run>, ControlPlaneError> {
        self.get("/api/v1/runs/", project_id, &format!("runs-p{project_id}")).await
    }

    async fn create_run(
        &self,
        project_id: ProjectId,
        playbook_id: PlaybookId,
        request: &RunRequest,
    ) -> Result<Run, ControlPlaneError> {
        let path = format!("/api/v1/playbooks/{playbook_id}/run");
        let body = serde_json::to_value(request).map_err(|e| ControlPlaneError::Decode(e.to_string()))?;
        self.post(&path, project_id, &format!("p{project_id}-pb{playbook_id}-run"), &body)
            .await
    }

    async fn list_playbooks(&self, project_id: ProjectId) -> Result<Vec<Playbook>, ControlPlaneError> {
        self.get("/api/v1/playbooks/", project_id, &format!("schedule-p{project_id}")).await
    }

    async fn update_playbook_schedule(
        &self,
        project_id: ProjectId,
        playbook_id: PlaybookId,
        schedule: &Schedule,
    ) -> Result<(), ControlPlaneError> {
        let path = format!("/api/v1/playbooks/{playbook_id}");
        let rb = self
            .request(Method::PUT, &path, Some(project_id), &format!("schedule-p{project_id}-pb{playbook_id}"))
            .json(&json!({ "schedule": schedule }));
        self.send(rb, &path).await.map(|_| ())
    }

    async fn reveal_secret(&self, project_id: ProjectId, secret_id: SecretId) -> Result<RevealedSecret, ControlPlaneError> {
        let path = format!("/api/v1/secrets/{secret_id}/reveal-internal");
        let rb = self.request(Method::POST, &path, Some(project_id), &format!("secret-{secret_id}"));
        self.json(rb, &path).await
    }

    async fn get_secret(&self, project_id: ProjectId, secret_id: SecretId) -> Result<SecretMeta, ControlPlaneError> {
        let path = format!("/api/v1/secrets/{secret_id}");
        self.get(&path, project_id, &format!("secret-{secret_id}")).await
    }

    async fn list_secrets(&self, project_id: ProjectId) -> Result<Vec<SecretMeta>, ControlPlaneError> {
        self.get("/api/v1/secrets/", project_id, &format!("secrets-p{project_id}")).await
    }

    async fn create_secret(&self, project_id: ProjectId, secret: &NewSecret) -> Result<SecretMeta, ControlPlaneError> {
        let path = "/api/v1/secrets/";
        let rb = self
            .request(Method::POST, path, Some(project_id), "secret-create")
            .json(secret);
        self.json(rb, path).await
    }

    async fn rotate_secret(
        &self,
        project_id: ProjectId,
        secret_id: SecretId,
        value: &str,
        passphrase: Option<&str>,
    ) -> Result<SecretMeta, ControlPlaneError> {
        let path = format!("/api/v1/secrets/{secret_id}/rotate");
        let mut body = json!({ "value": value });
        if let Some(p) = passphrase.filter(|p| !p.is_empty()) {
            body["passphrase"] = json!(p);
        }
        self.post(&path, project_id, &format!("secret-rotate-{secret_id}"), &body).await
    }

    async fn rotate_secret_apply(&self, project_id: ProjectId, secret_id: SecretId, value: &str) -> Result<(), ControlPlaneError> {
        let path = format!("/api/v1/secrets/{secret_id}/rotate-apply");
        self.post_empty(
            &path,
            project_id,
            &format!("secret-rotate-apply-{secret_id}"),
            Some(&json!({ "value": value })),
        )
        .await
    }

    async fn delete_secret(&self, project_id: ProjectId, secret_id: SecretId) -> Result<(), ControlPlaneError> {
        let path = format!("/api/v1/secrets/{secret_id}");
        let rb = self.request(Method::DELETE, &path, Some(project_id), &format!("secret-delete-{secret_id}"));
        match self.send(rb, &path).await {
            Ok(_) => Ok(()),
            // Already gone is what we wanted.
            Err(ControlPlaneError::Client { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_leases(&self, project_id: ProjectId) -> Result<Vec<SecretLease>, ControlPlaneError> {
        self.get("/api/v1/secrets/leases/", project_id, &format!("leases-p{project_id}")).await
    }

    async fn revoke_lease(&self, project_id: ProjectId, lease_id: LeaseId) -> Result<(), ControlPlaneError> {
        let path = format!("/api/v1/secrets/leases/{lease_id}/revoke");
        self.post_empty(&path, project_id, &format!("lease-revoke-{lease_id}"), None).await
    }

    async fn recompute_dynamic_groups(&self, project_id: ProjectId) -> Result<(), ControlPlaneError> {
        self.post_empty(
            "/api/v1/groups/recompute-dynamic",
            project_id,
            &format!("recompute-p{project_id}"),
            None,
        )
        .await
    }

    async fn list_hosts_for_credential(&self, project_id: ProjectId, secret_id: SecretId) -> Result<Vec<Host>, ControlPlaneError> {
        let path = format!("/api/v1/hosts/?credential_id={secret_id}");
        self.get(&path, project_id, &format!("hosts-cred-{secret_id}")).await
    }

    async fn push_host_facts(&self, project_id: ProjectId, host_id: HostId, facts: &Value) -> Result<(), ControlPlaneError> {
        let path = format!("/api/v1/hosts/{host_id}/facts");
        self.post_empty(&path, project_id, &format!("facts-{host_id}"), Some(&json!({ "facts": facts })))
            .await
    }

    async fn request_approval(&self, project_id: ProjectId, run_id: RunId, reason: &str) -> Result<Approval, ControlPlaneError> {
        let body = json!({ "run_id": run_id, "reason": reason });
        self.post("/api/v1/approvals/", project_id, &format!("approval-run-{run_id}"), &body)
            .await
    }

    async fn get_approval(&self, project_id: ProjectId, approval_id: ApprovalId) -> Result<Approval, ControlPlaneError> {
        let path = format!("/api/v1/approvals/{approval_id}");
        self.get(&path, project_id, &format!("approval-{approval_id}")).await
    }

    async fn emit_notification(&self, project_id: ProjectId, event: &str, payload: &Value) -> Result<(), ControlPlaneError> {
        let body = json!({ "event": event, "payload": payload });
        self.post_empty("/api/v1/notifications/emit", project_id, &format!("notify-{event}"), Some(&body))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_bodies_are_truncated_on_char_boundaries() {
        let body = "ж".repeat(500);
        assert_eq!(truncate(&body).chars().count(), ERROR_BODY_LIMIT);
        assert_eq!(truncate("short"), "short");
    }

    #[test]
    fn request_ids_carry_tag() {
        let id = request_id("run-7");
        assert!(id.starts_with("worker-run-7-"));
        assert!(id.rsplit('-').next().unwrap().parse::<i64>().is_ok());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let minter = TokenMinter::new(b"k", 60).unwrap();
        let cp = HttpControlPlane::new("http://backend:8000/", minter, Duration::from_secs(5)).unwrap();
        assert_eq!(cp.base_url, "http://backend:8000");
    }

    #[tokio::test]
    async fn unreachable_project_listing_falls_back_to_default() {
        let minter = TokenMinter::new(b"k", 60).unwrap();
        // Port 9 (discard) on localhost is closed in test environments.
        let cp = HttpControlPlane::new("http://127.0.0.1:9", minter, Duration::from_millis(500)).unwrap();
        let projects = cp.list_projects().await.unwrap();
        assert_eq!(projects, vec![Project::default_project()]);
    }

    #[tokio::test]
    async fn unreachable_claim_is_transient() {
        let minter = TokenMinter::new(b"k", 60).unwrap();
        let cp = HttpControlPlane::new("http://127.0.0.1:9", minter, Duration::from_millis(500)).unwrap();
        let err = cp.claim_run(1, 1).await.unwrap_err();
        assert!(err.is_transient());
    }
}
