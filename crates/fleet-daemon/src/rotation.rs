//! Secret rotation and expiry notices.
//!
//! Apply-and-verify: the new value is stored as a temporary secret, a run
//! of the secret's rotation playbook pushes it to every host bound to the
//! secret, and only a successful run copies it onto the real secret. The
//! temporary secret is deleted whatever the outcome.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::{json, Map};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use fleet_core::types::{
    NewSecret, PlaybookId, ProjectId, RotationLink, RunId, RunRequest, RunStatus, SecretId, SecretMeta,
};
use fleet_telemetry::metrics::{global_metrics, names};

use crate::approval::{ApprovalGate, GateOutcome};
use crate::context::WorkerContext;
use crate::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// A rotation run was created; the value lands when it succeeds.
    Applying {
        run_id: RunId,
        temp_secret_id: SecretId,
        gate: GateOutcome,
    },
    /// The control plane ran its own apply flow.
    AppliedByControlPlane,
    /// The value was written without an apply run.
    Direct,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RotationReport {
    pub rotated: usize,
    pub notified: usize,
}

/// URL-safe random value from `bytes` bytes of system randomness.
pub fn generate_value(bytes: usize) -> Result<Zeroizing<String>> {
    let mut buf = Zeroizing::new(vec![0u8; bytes]);
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| anyhow!("system randomness unavailable"))?;
    Ok(Zeroizing::new(URL_SAFE_NO_PAD.encode(&buf[..])))
}

pub struct RotationManager<'a> {
    ctx: &'a WorkerContext,
}

impl<'a> RotationManager<'a> {
    pub fn new(ctx: &'a WorkerContext) -> Self {
        Self { ctx }
    }

    /// Rotate `secret` to `new_value`.
    ///
    /// With a rotation playbook and bound hosts this starts the apply flow.
    /// Otherwise the control plane's own apply endpoint is tried, and a
    /// secret without apply configuration is overwritten directly.
    pub async fn rotate(&self, project_id: ProjectId, secret: &SecretMeta, new_value: &str) -> Result<RotationOutcome> {
        let cp = &self.ctx.control_plane;
        if let Some(playbook_id) = secret.rotation_playbook_id {
            let hosts = cp
                .list_hosts_for_credential(project_id, secret.id)
                .await
                .with_context(|| format!("failed to list hosts bound to secret {}", secret.id))?;
            if !hosts.is_empty() {
                let host_ids = hosts.iter().map(|h| h.id).collect();
                return self
                    .start_apply(project_id, secret, playbook_id, host_ids, new_value)
                    .await;
            }
            debug!(secret_id = secret.id, "no hosts bound to secret, skipping apply run");
        }

        match cp.rotate_secret_apply(project_id, secret.id, new_value).await {
            Ok(()) => Ok(RotationOutcome::AppliedByControlPlane),
            Err(e) if e.is_client() => {
                debug!(secret_id = secret.id, error = %e, "apply refused, writing value directly");
                cp.rotate_secret(project_id, secret.id, new_value, None)
                    .await
                    .with_context(|| format!("failed to rotate secret {}", secret.id))?;
                Ok(RotationOutcome::Direct)
            }
            Err(e) => Err(e).with_context(|| format!("failed to apply rotation of secret {}", secret.id)),
        }
    }

    async fn start_apply(
        &self,
        project_id: ProjectId,
        secret: &SecretMeta,
        playbook_id: PlaybookId,
        host_ids: Vec<i64>,
        new_value: &str,
    ) -> Result<RotationOutcome> {
        let cp = &self.ctx.control_plane;
        let temp = cp
            .create_secret(
                project_id,
                &NewSecret {
                    name: format!("rotation-{}-{}", secret.id, uuid::Uuid::new_v4().simple()),
                    secret_type: secret.secret_type,
                    value: new_value.to_string(),
                    passphrase: None,
                    scope: secret.scope,
                    description: Some(format!("pending rotation value for secret {}", secret.id)),
                },
            )
            .await
            .with_context(|| format!("failed to store rotation value for secret {}", secret.id))?;

        let link = RotationLink {
            target_secret_id: secret.id,
            temp_secret_id: temp.id,
        };
        let mut extra_vars = Map::new();
        extra_vars.insert("rotation_secret_id".into(), json!(secret.id));
        extra_vars.insert(
            "rotation_new_value".into(),
            json!(format!("{{{{ secret:{} }}}}", temp.id)),
        );
        let request = RunRequest {
            host_ids,
            group_ids: Vec::new(),
            extra_vars,
            dry_run: false,
            rotation: Some(link),
        };

        let run = match cp.create_run(project_id, playbook_id, &request).await {
            Ok(run) => run,
            Err(e) => {
                self.discard_temp(project_id, temp.id).await;
                return Err(e).with_context(|| format!("failed to create rotation run for secret {}", secret.id));
            }
        };
        let gate = match ApprovalGate::new(self.ctx)
            .submit(&run, &format!("rotation of secret {}", secret.name))
            .await
        {
            Ok(gate) => gate,
            Err(e) => {
                self.finalize(project_id, run.id, link, RunStatus::Failed).await;
                return Err(e.context(format!("failed to submit rotation run for secret {}", secret.id)));
            }
        };
        info!(secret_id = secret.id, run_id = run.id, ?gate, "rotation run created");
        Ok(RotationOutcome::Applying {
            run_id: run.id,
            temp_secret_id: temp.id,
            gate,
        })
    }

    /// Finish a rotation run. Never fails; returns whether the value was applied.
    pub async fn finalize(&self, project_id: ProjectId, run_id: RunId, link: RotationLink, status: RunStatus) -> bool {
        let cp = &self.ctx.control_plane;
        let mut applied = false;
        if status == RunStatus::Success {
            match cp.reveal_secret(project_id, link.temp_secret_id).await {
                Ok(revealed) => {
                    let passphrase = revealed.passphrase.as_deref().filter(|p| !p.is_empty());
                    match cp
                        .rotate_secret(project_id, link.target_secret_id, &revealed.value, passphrase)
                        .await
                    {
                        Ok(_) => {
                            applied = true;
                            info!(run_id, secret_id = link.target_secret_id, "rotation applied");
                        }
                        Err(e) => warn!(
                            run_id,
                            secret_id = link.target_secret_id,
                            error = %e,
                            "rotation apply failed"
                        ),
                    }
                }
                Err(e) => warn!(
                    run_id,
                    temp_secret_id = link.temp_secret_id,
                    error = %e,
                    "rotation reveal failed"
                ),
            }
        } else {
            info!(run_id, secret_id = link.target_secret_id, %status, "rotation run did not succeed, secret unchanged");
        }
        let result = if applied { "applied" } else { "failed" };
        global_metrics().increment_counter(names::ROTATIONS, &[("result", result)]);
        self.discard_temp(project_id, link.temp_secret_id).await;
        applied
    }

    async fn discard_temp(&self, project_id: ProjectId, temp_secret_id: SecretId) {
        if let Err(e) = self.ctx.control_plane.delete_secret(project_id, temp_secret_id).await {
            warn!(temp_secret_id, error = %e, "temporary rotation secret cleanup failed");
        }
    }

    /// Emit `secret.expiring` once per secret and expiry date.
    async fn notify_expiry(&self, project_id: ProjectId, secret: &SecretMeta, now: DateTime<Utc>) -> bool {
        let window = self.ctx.config.rotation.expiry_warning_window();
        let Some(expires_at) = secret.expires_at.filter(|_| secret.expires_within(now, window)) else {
            return false;
        };
        let key = keys::expiry_notice(secret.id, expires_at.date_naive());
        match self.ctx.store.set_if_absent(&key, keys::EXPIRY_NOTICE_TTL).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                warn!(secret_id = secret.id, error = %e, "expiry notice key unavailable");
                return false;
            }
        }
        let payload = json!({
            "secret_id": secret.id,
            "name": secret.name,
            "expires_at": expires_at.to_rfc3339(),
        });
        match self
            .ctx
            .control_plane
            .emit_notification(project_id, "secret.expiring", &payload)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(secret_id = secret.id, error = %e, "expiry notification failed");
                false
            }
        }
    }

    /// Expiry notices and scheduled rotation for one project.
    pub async fn sweep_project(&self, project_id: ProjectId, now: DateTime<Utc>) -> Result<RotationReport> {
        let secrets = self
            .ctx
            .control_plane
            .list_secrets(project_id)
            .await
            .with_context(|| format!("failed to list secrets of project {project_id}"))?;
        let lock_ttl = Duration::from_secs(self.ctx.config.rotation.lock_ttl_secs);
        let mut report = RotationReport::default();

        for secret in &secrets {
            if self.notify_expiry(project_id, secret, now).await {
                report.notified += 1;
            }
            if !secret.is_rotation_due(now) {
                continue;
            }
            if !self
                .ctx
                .store
                .set_if_absent(&keys::rotation_lock(secret.id), lock_ttl)
                .await?
            {
                debug!(secret_id = secret.id, "rotation already in progress");
                continue;
            }
            let value = generate_value(self.ctx.config.rotation.generated_bytes)?;
            match self.rotate(project_id, secret, &value).await {
                Ok(outcome) => {
                    info!(project_id, secret_id = secret.id, ?outcome, "scheduled rotation started");
                    report.rotated += 1;
                }
                Err(e) => warn!(project_id, secret_id = secret.id, error = format!("{e:#}"), "scheduled rotation failed"),
            }
        }
        Ok(report)
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> RotationReport {
        let mut total = RotationReport::default();
        for project_id in self.ctx.projects().await {
            match self.sweep_project(project_id, now).await {
                Ok(report) => {
                    total.rotated += report.rotated;
                    total.notified += report.notified;
                }
                Err(e) => warn!(project_id, error = format!("{e:#}"), "rotation sweep failed"),
            }
        }
        total
    }
}
