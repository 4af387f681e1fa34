//! In-memory control plane and worker context for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tempfile::TempDir;

use fleet_core::config::Config;
use fleet_core::store::WorkStore;
use fleet_core::types::*;
use fleet_daemon::context::WorkerContext;
use fleet_daemon::strategy::SubprocessStrategy;
use fleet_harness::control_plane::{ControlPlane, ControlPlaneError};

#[derive(Default)]
pub struct FakeState {
    pub runs: BTreeMap<RunId, Run>,
    pub playbooks: BTreeMap<PlaybookId, Playbook>,
    pub hosts: BTreeMap<HostId, SnapshotHost>,
    pub secrets: BTreeMap<SecretId, SecretMeta>,
    pub values: BTreeMap<SecretId, RevealedSecret>,
    pub leases: Vec<SecretLease>,
    pub approvals: BTreeMap<ApprovalId, Approval>,
    pub hosts_by_credential: BTreeMap<SecretId, Vec<Host>>,
    pub logs: BTreeMap<RunId, String>,
    pub facts: Vec<(HostId, Value)>,
    pub notifications: Vec<(String, Value)>,
    pub schedule_updates: Vec<(PlaybookId, Schedule)>,
    pub rotations: Vec<(SecretId, String)>,
    pub apply_calls: Vec<SecretId>,
    pub deleted_secrets: Vec<SecretId>,
    pub revoked_leases: Vec<LeaseId>,
    pub recomputed: Vec<ProjectId>,
    /// Statuses returned by the next claims, in order.
    pub claim_failures: VecDeque<u16>,
    /// Status returned by every claim once `claim_failures` is drained.
    pub claim_always: Option<u16>,
    pub refuse_apply: bool,
    /// `request_approval` answers 503.
    pub refuse_approval: bool,
    pub unrevealable: HashSet<SecretId>,
    pub calls: BTreeMap<&'static str, usize>,
    next_id: i64,
}

impl FakeState {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        1000 + self.next_id
    }

    fn count(&mut self, name: &'static str) {
        *self.calls.entry(name).or_default() += 1;
    }
}

#[derive(Default)]
pub struct FakeControlPlane {
    state: Mutex<FakeState>,
}

fn not_found(what: &str) -> ControlPlaneError {
    ControlPlaneError::from_status(404, format!("{what} not found"))
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self, name: &str) -> usize {
        self.state().calls.get(name).copied().unwrap_or(0)
    }

    pub fn add_playbook(&self, id: PlaybookId, content: Option<&str>) {
        self.state().playbooks.insert(
            id,
            Playbook {
                id,
                project_id: DEFAULT_PROJECT_ID,
                name: format!("playbook-{id}"),
                stored_content: content.map(String::from),
                variables: Map::new(),
                schedule: None,
            },
        );
    }

    pub fn add_host(&self, host: SnapshotHost) {
        self.state().hosts.insert(host.id, host);
    }

    /// A pending run of `playbook_id` targeting the given snapshot hosts.
    pub fn add_run(&self, id: RunId, playbook_id: PlaybookId, hosts: Vec<SnapshotHost>) {
        let snapshot = TargetSnapshot {
            host_ids: hosts.iter().map(|h| h.id).collect(),
            hosts,
            ..TargetSnapshot::default()
        };
        self.state().runs.insert(
            id,
            Run {
                id,
                project_id: DEFAULT_PROJECT_ID,
                playbook_id,
                status: RunStatus::Pending,
                target_snapshot: snapshot,
                logs: None,
                triggered_by: None,
                created_at: Some(Utc::now()),
                started_at: None,
                finished_at: None,
            },
        );
    }

    pub fn update_run(&self, id: RunId, f: impl FnOnce(&mut Run)) {
        if let Some(run) = self.state().runs.get_mut(&id) {
            f(run);
        }
    }

    pub fn add_secret(&self, meta: SecretMeta, value: &str, passphrase: Option<&str>) {
        let mut state = self.state();
        state.values.insert(
            meta.id,
            RevealedSecret {
                value: value.into(),
                passphrase: passphrase.map(String::from),
            },
        );
        state.secrets.insert(meta.id, meta);
    }

    pub fn run(&self, id: RunId) -> Run {
        self.state().runs.get(&id).cloned().expect("run exists")
    }

    pub fn status(&self, id: RunId) -> RunStatus {
        self.run(id).status
    }

    pub fn log(&self, id: RunId) -> String {
        self.state().logs.get(&id).cloned().unwrap_or_default()
    }

    pub fn secret_value(&self, id: SecretId) -> Option<String> {
        self.state().values.get(&id).map(|v| v.value.clone())
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn list_projects(&self) -> Result<Vec<Project>, ControlPlaneError> {
        Ok(vec![Project::default_project()])
    }

    async fn claim_run(&self, _project_id: ProjectId, run_id: RunId) -> Result<ClaimedRun, ControlPlaneError> {
        let mut state = self.state();
        state.count("claim_run");
        if let Some(status) = state.claim_failures.pop_front().or(state.claim_always) {
            return Err(ControlPlaneError::from_status(status, "injected"));
        }
        let run = state.runs.get_mut(&run_id).ok_or_else(|| not_found("run"))?;
        if run.status != RunStatus::Pending {
            return Err(ControlPlaneError::from_status(409, "run is not pending"));
        }
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        let run = run.clone();
        let playbook = state
            .playbooks
            .get(&run.playbook_id)
            .cloned()
            .ok_or_else(|| not_found("playbook"))?;
        Ok(ClaimedRun { run, playbook })
    }

    async fn append_log(&self, _project_id: ProjectId, run_id: RunId, chunk: &str) -> Result<(), ControlPlaneError> {
        let mut state = self.state();
        state.count("append_log");
        state.logs.entry(run_id).or_default().push_str(chunk);
        Ok(())
    }

    async fn set_status(
        &self,
        _project_id: ProjectId,
        run_id: RunId,
        status: RunStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), ControlPlaneError> {
        let mut state = self.state();
        state.count("set_status");
        let run = state.runs.get_mut(&run_id).ok_or_else(|| not_found("run"))?;
        run.status = status;
        run.finished_at = finished_at;
        Ok(())
    }

    async fn list_runs(&self, project_id: ProjectId) -> Result<Vec<Run>, ControlPlaneError> {
        Ok(self
            .state()
            .runs
            .values()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn create_run(
        &self,
        project_id: ProjectId,
        playbook_id: PlaybookId,
        request: &RunRequest,
    ) -> Result<Run, ControlPlaneError> {
        let mut state = self.state();
        state.count("create_run");
        if !state.playbooks.contains_key(&playbook_id) {
            return Err(not_found("playbook"));
        }
        let id = state.id();
        let hosts = request
            .host_ids
            .iter()
            .filter_map(|h| state.hosts.get(h).cloned())
            .collect();
        let run = Run {
            id,
            project_id,
            playbook_id,
            status: RunStatus::Pending,
            target_snapshot: TargetSnapshot {
                hosts,
                host_ids: request.host_ids.clone(),
                group_ids: request.group_ids.clone(),
                extra_vars: request.extra_vars.clone(),
                dry_run: request.dry_run,
                rotation: request.rotation,
                ..TargetSnapshot::default()
            },
            logs: None,
            triggered_by: Some("worker".into()),
            created_at: Some(Utc::now()),
            started_at: None,
            finished_at: None,
        };
        state.runs.insert(id, run.clone());
        Ok(run)
    }

    async fn list_playbooks(&self, project_id: ProjectId) -> Result<Vec<Playbook>, ControlPlaneError> {
        Ok(self
            .state()
            .playbooks
            .values()
            .filter(|p| p.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn update_playbook_schedule(
        &self,
        _project_id: ProjectId,
        playbook_id: PlaybookId,
        schedule: &Schedule,
    ) -> Result<(), ControlPlaneError> {
        let mut state = self.state();
        let playbook = state.playbooks.get_mut(&playbook_id).ok_or_else(|| not_found("playbook"))?;
        playbook.schedule = Some(schedule.clone());
        state.schedule_updates.push((playbook_id, schedule.clone()));
        Ok(())
    }

    async fn reveal_secret(&self, _project_id: ProjectId, secret_id: SecretId) -> Result<RevealedSecret, ControlPlaneError> {
        let mut state = self.state();
        state.count("reveal_secret");
        if state.unrevealable.contains(&secret_id) {
            return Err(ControlPlaneError::from_status(500, "decrypt failed"));
        }
        state.values.get(&secret_id).cloned().ok_or_else(|| not_found("secret"))
    }

    async fn get_secret(&self, _project_id: ProjectId, secret_id: SecretId) -> Result<SecretMeta, ControlPlaneError> {
        self.state().secrets.get(&secret_id).cloned().ok_or_else(|| not_found("secret"))
    }

    async fn list_secrets(&self, _project_id: ProjectId) -> Result<Vec<SecretMeta>, ControlPlaneError> {
        Ok(self.state().secrets.values().cloned().collect())
    }

    async fn create_secret(&self, project_id: ProjectId, secret: &NewSecret) -> Result<SecretMeta, ControlPlaneError> {
        let mut state = self.state();
        state.count("create_secret");
        let id = state.id();
        let meta = SecretMeta {
            id,
            project_id: Some(project_id),
            name: secret.name.clone(),
            secret_type: secret.secret_type,
            scope: secret.scope,
            rotation_interval_days: None,
            rotation_playbook_id: None,
            last_rotated_at: None,
            next_rotated_at: None,
            expires_at: None,
            dynamic_enabled: false,
            dynamic_ttl_seconds: None,
        };
        state.values.insert(
            id,
            RevealedSecret {
                value: secret.value.clone(),
                passphrase: secret.passphrase.clone(),
            },
        );
        state.secrets.insert(id, meta.clone());
        Ok(meta)
    }

    async fn rotate_secret(
        &self,
        _project_id: ProjectId,
        secret_id: SecretId,
        value: &str,
        passphrase: Option<&str>,
    ) -> Result<SecretMeta, ControlPlaneError> {
        let mut state = self.state();
        state.count("rotate_secret");
        let meta = state.secrets.get_mut(&secret_id).ok_or_else(|| not_found("secret"))?;
        meta.mark_rotated(Utc::now());
        let meta = meta.clone();
        state.values.insert(
            secret_id,
            RevealedSecret {
                value: value.into(),
                passphrase: passphrase.map(String::from),
            },
        );
        state.rotations.push((secret_id, value.into()));
        Ok(meta)
    }

    async fn rotate_secret_apply(&self, _project_id: ProjectId, secret_id: SecretId, _value: &str) -> Result<(), ControlPlaneError> {
        let mut state = self.state();
        state.count("rotate_secret_apply");
        if state.refuse_apply {
            return Err(ControlPlaneError::from_status(400, "no apply configuration"));
        }
        state.apply_calls.push(secret_id);
        Ok(())
    }

    async fn delete_secret(&self, _project_id: ProjectId, secret_id: SecretId) -> Result<(), ControlPlaneError> {
        let mut state = self.state();
        state.secrets.remove(&secret_id);
        state.values.remove(&secret_id);
        state.deleted_secrets.push(secret_id);
        Ok(())
    }

    async fn list_leases(&self, _project_id: ProjectId) -> Result<Vec<SecretLease>, ControlPlaneError> {
        Ok(self
            .state()
            .leases
            .iter()
            .filter(|l| !l.is_revoked())
            .cloned()
            .collect())
    }

    async fn revoke_lease(&self, _project_id: ProjectId, lease_id: LeaseId) -> Result<(), ControlPlaneError> {
        let mut state = self.state();
        let lease = state
            .leases
            .iter_mut()
            .find(|l| l.id == lease_id)
            .ok_or_else(|| not_found("lease"))?;
        lease.revoked_at = Some(Utc::now());
        state.revoked_leases.push(lease_id);
        Ok(())
    }

    async fn recompute_dynamic_groups(&self, project_id: ProjectId) -> Result<(), ControlPlaneError> {
        self.state().recomputed.push(project_id);
        Ok(())
    }

    async fn list_hosts_for_credential(&self, _project_id: ProjectId, secret_id: SecretId) -> Result<Vec<Host>, ControlPlaneError> {
        Ok(self
            .state()
            .hosts_by_credential
            .get(&secret_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn push_host_facts(&self, _project_id: ProjectId, host_id: HostId, facts: &Value) -> Result<(), ControlPlaneError> {
        self.state().facts.push((host_id, facts.clone()));
        Ok(())
    }

    async fn request_approval(&self, _project_id: ProjectId, run_id: RunId, reason: &str) -> Result<Approval, ControlPlaneError> {
        let mut state = self.state();
        state.count("request_approval");
        if state.refuse_approval {
            return Err(ControlPlaneError::from_status(503, "approvals unavailable"));
        }
        let id = state.id();
        let approval = Approval {
            id,
            run_id,
            status: ApprovalStatus::Pending,
            requested_by: Some("worker".into()),
            decided_by: None,
            reason: Some(reason.into()),
            decided_at: None,
        };
        state.approvals.insert(id, approval.clone());
        if let Some(run) = state.runs.get_mut(&run_id) {
            run.target_snapshot.approval_id = Some(id);
            run.target_snapshot.approval_status = Some(ApprovalStatus::Pending);
        }
        Ok(approval)
    }

    async fn get_approval(&self, _project_id: ProjectId, approval_id: ApprovalId) -> Result<Approval, ControlPlaneError> {
        self.state()
            .approvals
            .get(&approval_id)
            .cloned()
            .ok_or_else(|| not_found("approval"))
    }

    async fn emit_notification(&self, _project_id: ProjectId, event: &str, payload: &Value) -> Result<(), ControlPlaneError> {
        self.state().notifications.push((event.into(), payload.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn snapshot_host(id: HostId) -> SnapshotHost {
    SnapshotHost {
        id,
        name: Some(format!("web-{id}")),
        hostname: format!("10.0.0.{id}"),
        port: None,
        username: None,
        credential_id: None,
        environment: Some("dev".into()),
        group_ids: vec![],
    }
}

/// A snapshot host in the protected `prod` environment.
pub fn prod_host(id: HostId) -> SnapshotHost {
    SnapshotHost {
        environment: Some("prod".into()),
        ..snapshot_host(id)
    }
}

pub fn secret(id: SecretId, secret_type: SecretType) -> SecretMeta {
    SecretMeta {
        id,
        project_id: Some(DEFAULT_PROJECT_ID),
        name: format!("secret-{id}"),
        secret_type,
        scope: SecretScope::Project,
        rotation_interval_days: None,
        rotation_playbook_id: None,
        last_rotated_at: None,
        next_rotated_at: None,
        expires_at: None,
        dynamic_enabled: false,
        dynamic_ttl_seconds: None,
    }
}

/// A context wired to `cp`, an in-memory store and a shell script standing
/// in for the playbook engine. The script receives the engine's argv.
pub struct TestWorker {
    pub ctx: WorkerContext,
    pub cp: Arc<FakeControlPlane>,
    pub dir: TempDir,
}

impl TestWorker {
    pub fn runs_dir(&self) -> PathBuf {
        self.dir.path().join("runs")
    }

    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.runs_dir().join(run_id.to_string())
    }
}

pub const SUCCEED: &str = "echo \"PLAY [all]\"\necho \"ok: [web-1]\"\nexit 0\n";
pub const FAIL: &str = "echo \"fatal: [web-1]: UNREACHABLE\"\nexit 2\n";

pub async fn worker(cp: FakeControlPlane, script: &str) -> TestWorker {
    worker_with(cp, script, |_| {}).await
}

pub async fn worker_with(cp: FakeControlPlane, script: &str, tweak: impl FnOnce(&mut Config)) -> TestWorker {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("engine.sh");
    std::fs::write(&script_path, script).expect("write engine script");

    let mut config = Config::default();
    config.execution.runs_dir = dir.path().join("runs");
    config.execution.playbook_command = vec!["sh".into(), script_path.display().to_string()];
    config.execution.use_structured_runner = false;
    config.execution.log_flush_ms = 10;
    tweak(&mut config);

    let command = config.execution.playbook_command.clone();
    let cp = Arc::new(cp);
    let store = WorkStore::new_in_memory().await.expect("in-memory store");
    let ctx = WorkerContext::new(
        config,
        cp.clone(),
        Arc::new(store),
        Arc::new(SubprocessStrategy::new(command)),
    );
    TestWorker { ctx, cp, dir }
}
