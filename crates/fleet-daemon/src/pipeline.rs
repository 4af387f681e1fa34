//! Execution of one claimed run, from claim to terminal status.
//!
//! Every line a user sees in the run log is written here or by the run
//! strategy. Failures before execution are reported as `==> error:` lines
//! and end the run as `failed`; only claim failures the control plane
//! reports as transient ask the consumer to retry.

use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use fleet_core::access::GroupMembership;
use fleet_core::store::QueueItem;
use fleet_core::types::{ClaimedRun, HostId, Playbook, Run, RunStatus, SnapshotHost};
use fleet_harness::control_plane::ControlPlaneError;
use fleet_telemetry::metrics::{global_metrics, names};

use crate::artifacts::{self, RunDir};
use crate::context::WorkerContext;
use crate::inventory::build_inventory;
use crate::rotation::RotationManager;
use crate::runlog::RunLog;
use crate::secret_refs::SecretResolver;
use crate::ssh_agent::SshAgent;
use crate::strategy::{ExecutionOutcome, RunSpec};

/// What the consumer should do with the queue item afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    Retry,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("control plane: {0}")]
    ControlPlane(#[from] ControlPlaneError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A strategy outcome plus the host its facts belong to, if any were gathered.
struct Executed {
    outcome: ExecutionOutcome,
    facts_host: Option<HostId>,
}

/// Per-run resources released whatever the outcome.
#[derive(Default)]
struct RunResources {
    run_dir: Option<RunDir>,
    agent: Option<SshAgent>,
}

impl RunResources {
    async fn release(self, keep_sensitive: bool) {
        if let Some(agent) = self.agent {
            agent.stop().await;
        }
        if let Some(run_dir) = self.run_dir {
            if keep_sensitive {
                debug!(path = %run_dir.path().display(), "keeping sensitive run artifacts");
            } else {
                run_dir.cleanup_sensitive().await;
            }
        }
    }
}

pub struct Pipeline<'a> {
    ctx: &'a WorkerContext,
}

impl<'a> Pipeline<'a> {
    pub fn new(ctx: &'a WorkerContext) -> Self {
        Self { ctx }
    }

    pub async fn execute(&self, item: QueueItem) -> Result<Disposition, PipelineError> {
        let cp = &self.ctx.control_plane;
        let ClaimedRun { run, playbook } = match cp.claim_run(item.project_id, item.run_id).await {
            Ok(claimed) => claimed,
            Err(e) if e.is_transient() => {
                warn!(project_id = item.project_id, run_id = item.run_id, error = %e, "claim failed, will retry");
                return Ok(Disposition::Retry);
            }
            Err(e) => {
                info!(project_id = item.project_id, run_id = item.run_id, status = ?e.status(), "claim refused");
                return Ok(Disposition::Handled);
            }
        };
        global_metrics().increment_counter(names::RUNS_CLAIMED, &[]);

        if run.project_id != item.project_id {
            warn!(
                queued_project = item.project_id,
                run_project = run.project_id,
                run_id = run.id,
                "claimed run belongs to another project, ignoring"
            );
            return Ok(Disposition::Handled);
        }

        let started = Instant::now();
        let exec = &self.ctx.config.execution;
        let mut log = RunLog::new(cp.clone(), run.project_id, run.id)
            .with_batching(exec.log_batch_lines, exec.log_flush_interval());
        let mut resources = RunResources::default();

        let executed = self.prepare_and_run(&run, &playbook, &mut log, &mut resources).await;
        let status = executed.as_ref().map_or(RunStatus::Failed, |e| e.outcome.status);
        log.flush().await;

        let status_result = if run.status.can_transition_to(&status) {
            cp.set_status(run.project_id, run.id, status, Some(Utc::now())).await
        } else {
            warn!(run_id = run.id, from = %run.status, to = %status, "claimed run cannot take final status");
            Ok(())
        };
        if let Err(e) = &status_result {
            warn!(run_id = run.id, %status, error = %e, "final status update failed");
        }

        if let Some(Executed {
            outcome: ExecutionOutcome { facts: Some(facts), .. },
            facts_host: Some(host_id),
        }) = executed
        {
            self.store_facts(&run, host_id, facts).await;
        }
        if let Some(link) = run.target_snapshot.rotation {
            RotationManager::new(self.ctx)
                .finalize(run.project_id, run.id, link, status)
                .await;
        }
        resources.release(exec.keep_sensitive_artifacts).await;

        let metrics = global_metrics();
        metrics.increment_counter(names::RUNS_FINISHED, &[("status", status.as_str())]);
        metrics.observe_duration(names::RUN_DURATION, started.elapsed());
        info!(project_id = run.project_id, run_id = run.id, %status, elapsed_ms = started.elapsed().as_millis() as u64, "run finished");

        status_result?;
        Ok(Disposition::Handled)
    }

    /// Everything between the start line and the strategy's done line.
    /// `None` means the run failed before or while executing; the reason
    /// has already been written to the run log.
    async fn prepare_and_run(
        &self,
        run: &Run,
        playbook: &Playbook,
        log: &mut RunLog,
        resources: &mut RunResources,
    ) -> Option<Executed> {
        let exec = &self.ctx.config.execution;
        let snapshot = &run.target_snapshot;

        let run_dir = match RunDir::create(&exec.runs_dir, run.id).await {
            Ok(dir) => dir,
            Err(e) => {
                log.line(format!("==> start run_id={} playbook={}", run.id, playbook.name)).await;
                log.line(format!("==> error: cannot create run directory: {e}")).await;
                return None;
            }
        };
        log.set_mirror(run_dir.run_log());
        resources.run_dir = Some(run_dir.clone());
        log.line(format!("==> start run_id={} playbook={}", run.id, playbook.name)).await;

        let Some(content) = playbook.stored_content.as_deref().filter(|c| !c.trim().is_empty()) else {
            log.line("==> error: playbook has no stored content").await;
            return None;
        };

        let hosts = self.hosts_in_scope(&snapshot.hosts, log).await;
        if hosts.is_empty() {
            log.line("==> error: no target hosts for this run").await;
            return None;
        }

        if let Err(e) = artifacts::write_public(&run_dir.playbook(), content.as_bytes()).await {
            log.line(format!("==> error: cannot write playbook: {e}")).await;
            return None;
        }

        let mut merged: Map<String, Value> = playbook.variables.clone();
        merged.extend(snapshot.extra_vars.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut resolver = SecretResolver::new(self.ctx.control_plane.as_ref(), run.project_id);
        let extra_vars = match resolver.resolve(&merged).await {
            Ok(vars) => vars,
            Err(e) => {
                log.line(format!("==> error: {e}")).await;
                return None;
            }
        };
        let inventory = match build_inventory(&hosts, &run_dir, &mut resolver).await {
            Ok(inventory) => inventory,
            Err(e) => {
                log.line(format!("==> error: {e}")).await;
                return None;
            }
        };
        debug!(run_id = run.id, revealed = resolver.revealed_count(), "credentials resolved");

        let written = async {
            artifacts::write_private(&run_dir.inventory(), inventory.private.as_bytes()).await?;
            artifacts::write_public(&run_dir.public_inventory(), inventory.public.as_bytes()).await
        };
        if let Err(e) = written.await {
            log.line(format!("==> error: cannot write inventory: {e}")).await;
            return None;
        }

        let mut env = Vec::new();
        if !inventory.agent_keys.is_empty() {
            let agent = match SshAgent::start().await {
                Ok(agent) => agent,
                Err(e) => {
                    log.line(format!("==> error: {e}")).await;
                    return None;
                }
            };
            env = agent.env();
            let agent = resources.agent.insert(agent);
            for key in &inventory.agent_keys {
                if let Err(e) = agent.add_key(&key.path, &key.passphrase, run_dir.path()).await {
                    log.line(format!("==> error: {e}")).await;
                    return None;
                }
            }
        }

        let facts_host = match hosts.as_slice() {
            [host] if snapshot.facts_run => Some(host.id),
            _ => None,
        };
        let collect_facts = facts_host.is_some();
        if snapshot.facts_run && !collect_facts {
            log.line(format!(
                "==> facts: fact collection needs exactly one host, got {}",
                hosts.len()
            ))
            .await;
        }

        let spec = RunSpec {
            run_dir,
            extra_vars,
            dry_run: snapshot.dry_run,
            env,
            timeout: exec.run_timeout(),
            collect_facts,
            keep_sensitive_artifacts: exec.keep_sensitive_artifacts,
        };
        match self.ctx.strategy.execute(&spec, log).await {
            Ok(outcome) => Some(Executed { outcome, facts_host }),
            Err(e) => {
                log.line(format!("==> error: {} strategy failed: {e}", self.ctx.strategy.name())).await;
                None
            }
        }
    }

    /// Drop snapshot hosts outside the worker's host scope.
    async fn hosts_in_scope(&self, hosts: &[SnapshotHost], log: &mut RunLog) -> Vec<SnapshotHost> {
        let scope = self
            .ctx
            .config
            .scope
            .host_scope(&GroupMembership::from_snapshot(hosts));
        let allowed: Vec<SnapshotHost> = hosts
            .iter()
            .filter(|h| scope.allows_snapshot_host(h))
            .cloned()
            .collect();
        let skipped = hosts.len() - allowed.len();
        if skipped > 0 {
            log.line(format!("==> scope: {skipped} host(s) outside worker scope skipped")).await;
        }
        allowed
    }

    async fn store_facts(&self, run: &Run, host_id: HostId, facts: Value) {
        if let Err(e) = self
            .ctx
            .control_plane
            .push_host_facts(run.project_id, host_id, &facts)
            .await
        {
            warn!(run_id = run.id, host_id, error = %e, "storing host facts failed");
        }
    }
}
