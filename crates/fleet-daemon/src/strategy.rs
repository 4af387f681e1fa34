//! Run strategies: how a prepared run is actually executed.
//!
//! - [`SubprocessStrategy`] invokes the playbook command directly and
//!   streams combined output.
//! - [`RunnerStrategy`] drives the structured runner through a private data
//!   directory and parses its JSON event stream (facts capture included).
//! - [`FallbackStrategy`] tries the runner and falls back to the subprocess
//!   when the runner cannot be used.
//!
//! [`probe`] picks one at startup; the pipeline only sees [`RunStrategy`].

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use fleet_core::config::ExecutionConfig;
use fleet_core::types::RunStatus;

use crate::artifacts::{self, RunDir};
use crate::runlog::RunLog;

pub const SSH_COMMON_ARGS: &str = "-o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a strategy needs to execute one run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub run_dir: RunDir,
    /// Variables after secret resolution. Sensitive.
    pub extra_vars: Map<String, Value>,
    pub dry_run: bool,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    pub collect_facts: bool,
    pub keep_sensitive_artifacts: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: RunStatus,
    pub return_code: Option<i32>,
    pub timed_out: bool,
    /// Facts gathered for a facts run, when the strategy can capture them.
    pub facts: Option<Value>,
}

impl ExecutionOutcome {
    fn exited(code: Option<i32>) -> Self {
        Self {
            status: if code == Some(0) {
                RunStatus::Success
            } else {
                RunStatus::Failed
            },
            return_code: code,
            timed_out: false,
            facts: None,
        }
    }

    fn timed_out() -> Self {
        Self {
            status: RunStatus::Failed,
            return_code: None,
            timed_out: true,
            facts: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error("command is empty")]
    EmptyCommand,
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait RunStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Execute the run, writing exec/timeout/done markers to `log`.
    async fn execute(&self, spec: &RunSpec, log: &mut RunLog) -> Result<ExecutionOutcome, StrategyError>;
}

// ---------------------------------------------------------------------------
// Process streaming
// ---------------------------------------------------------------------------

enum StreamEnd {
    Exited(Option<i32>),
    TimedOut,
}

fn split_command(command: &[String]) -> Result<(&str, &[String]), StrategyError> {
    match command.split_first() {
        Some((program, rest)) if !program.is_empty() => Ok((program.as_str(), rest)),
        _ => Err(StrategyError::EmptyCommand),
    }
}

fn spawn(program: &str, args: &[String], spec: &RunSpec) -> Result<Child, StrategyError> {
    Command::new(program)
        .args(args)
        .current_dir(spec.run_dir.path())
        .env("ANSIBLE_HOST_KEY_CHECKING", "False")
        .env("PYTHONUNBUFFERED", "1")
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| StrategyError::Spawn {
            program: program.to_string(),
            source,
        })
}

/// Stream stdout and stderr into `log` until the child exits or `deadline`
/// passes. `on_stdout` maps a stdout line to the text to log, if any.
async fn stream_child(
    child: &mut Child,
    deadline: Instant,
    log: &mut RunLog,
    mut on_stdout: impl FnMut(&str) -> Option<String> + Send,
) -> io::Result<StreamEnd> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("stderr not captured"))?;
    let mut out = BufReader::new(stdout).lines();
    let mut err = BufReader::new(stderr).lines();
    let (mut out_open, mut err_open) = (true, true);

    let mut ticker = tokio::time::interval(log.flush_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while out_open || err_open {
        tokio::select! {
            line = out.next_line(), if out_open => match line {
                Ok(Some(line)) => {
                    if let Some(text) = on_stdout(line.as_str()) {
                        log.push(&text).await;
                    }
                }
                _ => out_open = false,
            },
            line = err.next_line(), if err_open => match line {
                Ok(Some(line)) => log.push(&line).await,
                _ => err_open = false,
            },
            _ = ticker.tick() => log.flush_if_due().await,
            _ = tokio::time::sleep_until(deadline) => {
                log.flush().await;
                return Ok(StreamEnd::TimedOut);
            }
        }
    }
    log.flush().await;

    match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(status) => Ok(StreamEnd::Exited(status?.code())),
        Err(_) => Ok(StreamEnd::TimedOut),
    }
}

async fn kill(child: &mut Child, run_id: i64) {
    if let Err(e) = child.kill().await {
        warn!(run_id, error = %e, "failed to kill timed-out process");
    }
}

// ---------------------------------------------------------------------------
// SubprocessStrategy
// ---------------------------------------------------------------------------

pub struct SubprocessStrategy {
    command: Vec<String>,
}

impl SubprocessStrategy {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn args(&self, spec: &RunSpec) -> Result<(String, Vec<String>), StrategyError> {
        let (program, base) = split_command(&self.command)?;
        let mut args = base.to_vec();
        args.extend([
            "-i".to_string(),
            spec.run_dir.inventory().display().to_string(),
            spec.run_dir.playbook().display().to_string(),
            "--ssh-common-args".to_string(),
            SSH_COMMON_ARGS.to_string(),
            "--extra-vars".to_string(),
            format!("@{}", spec.run_dir.extra_vars().display()),
        ]);
        if spec.dry_run {
            args.push("--check".into());
        }
        Ok((program.to_string(), args))
    }
}

#[async_trait]
impl RunStrategy for SubprocessStrategy {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn execute(&self, spec: &RunSpec, log: &mut RunLog) -> Result<ExecutionOutcome, StrategyError> {
        if spec.collect_facts {
            log.line("==> facts: structured runner unavailable, facts not stored").await;
        }
        let vars = serde_json::to_vec(&spec.extra_vars)?;
        artifacts::write_private(&spec.run_dir.extra_vars(), &vars).await?;

        let (program, args) = self.args(spec)?;
        log.line(format!("==> exec: {} {}", program, args.join(" "))).await;

        let mut child = spawn(&program, &args, spec)?;
        let deadline = Instant::now() + spec.timeout;
        match stream_child(&mut child, deadline, log, |line| Some(line.to_string())).await? {
            StreamEnd::TimedOut => {
                log.line(format!(
                    "==> timeout: exceeded {}s, stopping process",
                    spec.timeout.as_secs()
                ))
                .await;
                kill(&mut child, log.run_id()).await;
                Ok(ExecutionOutcome::timed_out())
            }
            StreamEnd::Exited(code) => {
                let outcome = ExecutionOutcome::exited(code);
                match (outcome.status, code) {
                    (RunStatus::Success, _) => log.line("==> done: success").await,
                    (_, Some(code)) => log.line(format!("==> done: failed (exit={code})")).await,
                    (_, None) => log.line("==> done: failed (killed by signal)").await,
                }
                Ok(outcome)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RunnerStrategy
// ---------------------------------------------------------------------------

pub struct RunnerStrategy {
    command: Vec<String>,
}

impl RunnerStrategy {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// `<runner> --version`; returns the reported version.
    pub async fn probe(&self) -> Result<String, StrategyError> {
        let (program, base) = split_command(&self.command)?;
        let out = tokio::time::timeout(
            PROBE_TIMEOUT,
            Command::new(program)
                .args(base)
                .arg("--version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| StrategyError::Probe("timed out".into()))?
        .map_err(|source| StrategyError::Spawn {
            program: program.to_string(),
            source,
        })?;
        if !out.status.success() {
            return Err(StrategyError::Probe(format!("exit status {}", out.status)));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Lay out `project/`, `inventory/` and `env/` under the private dir.
    async fn prepare(&self, spec: &RunSpec) -> Result<(), StrategyError> {
        let private = spec.run_dir.runner_dir();
        for sub in ["project", "inventory", "env"] {
            tokio::fs::create_dir_all(private.join(sub)).await?;
        }
        tokio::fs::copy(spec.run_dir.playbook(), private.join("project").join("playbook.yml")).await?;

        let inventory = zeroize::Zeroizing::new(tokio::fs::read(spec.run_dir.inventory()).await?);
        artifacts::write_private(&private.join("inventory").join("hosts"), &inventory).await?;

        let extravars = serde_json::to_vec(&spec.extra_vars)?;
        artifacts::write_private(&private.join("env").join("extravars"), &extravars).await?;

        let mut envvars = Map::new();
        envvars.insert("ANSIBLE_HOST_KEY_CHECKING".into(), json!("False"));
        envvars.insert("PYTHONUNBUFFERED".into(), json!("1"));
        for (k, v) in &spec.env {
            if k == "SSH_AUTH_SOCK" || k == "SSH_AGENT_PID" {
                envvars.insert(k.clone(), json!(v));
            }
        }
        artifacts::write_private(&private.join("env").join("envvars"), &serde_json::to_vec(&envvars)?).await?;

        let mut cmdline = format!("--ssh-common-args '{SSH_COMMON_ARGS}'");
        if spec.dry_run {
            cmdline.push_str(" --check");
        }
        artifacts::write_public(&private.join("env").join("cmdline"), cmdline.as_bytes()).await?;
        Ok(())
    }
}

/// Log text and captured facts for one runner event line.
pub fn parse_runner_event(line: &str, collect_facts: bool, facts: &mut Option<Value>) -> Option<String> {
    let Ok(event) = serde_json::from_str::<Value>(line) else {
        return Some(line.to_string());
    };
    if collect_facts && event.get("event").and_then(Value::as_str) == Some("runner_on_ok") {
        let data = event.get("event_data");
        let task = data.and_then(|d| d.get("task")).and_then(Value::as_str);
        if task == Some("Gathering Facts") {
            if let Some(f) = data
                .and_then(|d| d.get("res"))
                .and_then(|r| r.get("ansible_facts"))
                .filter(|f| f.is_object())
            {
                *facts = Some(f.clone());
            }
        }
    }
    event
        .get("stdout")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

#[async_trait]
impl RunStrategy for RunnerStrategy {
    fn name(&self) -> &'static str {
        "structured-runner"
    }

    async fn execute(&self, spec: &RunSpec, log: &mut RunLog) -> Result<ExecutionOutcome, StrategyError> {
        let (program, base) = split_command(&self.command)?;
        self.prepare(spec).await?;
        let private = spec.run_dir.runner_dir();

        let mut args = base.to_vec();
        args.extend([
            "run".to_string(),
            private.display().to_string(),
            "-p".to_string(),
            "playbook.yml".to_string(),
            "-j".to_string(),
        ]);
        log.line("==> exec: ansible-runner").await;
        let mut child = spawn(program, &args, spec)?;

        let mut facts = None;
        let collect = spec.collect_facts;
        let deadline = Instant::now() + spec.timeout;
        let end = stream_child(&mut child, deadline, log, |line| {
            parse_runner_event(line, collect, &mut facts)
        })
        .await?;

        let mut outcome = match end {
            StreamEnd::TimedOut => {
                log.line(format!(
                    "==> timeout: exceeded {}s, cancelling runner",
                    spec.timeout.as_secs()
                ))
                .await;
                kill(&mut child, log.run_id()).await;
                ExecutionOutcome::timed_out()
            }
            StreamEnd::Exited(code) => ExecutionOutcome::exited(code),
        };
        let rc = outcome
            .return_code
            .map_or_else(|| "none".to_string(), |c| c.to_string());
        log.line(format!("==> done: {} (rc={rc})", outcome.status)).await;

        let summary = json!({
            "runner": "ansible-runner",
            "rc": outcome.return_code,
            "status": outcome.status.as_str(),
        });
        match serde_json::to_vec_pretty(&summary) {
            Ok(bytes) => {
                if let Err(e) = artifacts::write_public(&spec.run_dir.runner_summary(), &bytes).await {
                    warn!(run_id = log.run_id(), error = %e, "runner summary not written");
                }
            }
            Err(e) => warn!(run_id = log.run_id(), error = %e, "runner summary not encoded"),
        }

        if !spec.keep_sensitive_artifacts {
            artifacts::remove_dir_quiet(&private).await;
        }
        outcome.facts = facts;
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// FallbackStrategy
// ---------------------------------------------------------------------------

/// Use `primary`; when it errors before producing an outcome, run `fallback`.
pub struct FallbackStrategy {
    primary: Arc<dyn RunStrategy>,
    fallback: Arc<dyn RunStrategy>,
}

impl FallbackStrategy {
    pub fn new(primary: Arc<dyn RunStrategy>, fallback: Arc<dyn RunStrategy>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl RunStrategy for FallbackStrategy {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    async fn execute(&self, spec: &RunSpec, log: &mut RunLog) -> Result<ExecutionOutcome, StrategyError> {
        match self.primary.execute(spec, log).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(
                    run_id = log.run_id(),
                    primary = self.primary.name(),
                    fallback = self.fallback.name(),
                    error = %e,
                    "run strategy failed, falling back"
                );
                self.fallback.execute(spec, log).await
            }
        }
    }
}

/// Pick the run strategy for this process.
pub async fn probe(config: &ExecutionConfig) -> Arc<dyn RunStrategy> {
    let subprocess: Arc<dyn RunStrategy> = Arc::new(SubprocessStrategy::new(config.playbook_command.clone()));
    if !config.use_structured_runner {
        info!("structured runner disabled, using subprocess strategy");
        return subprocess;
    }
    let runner = RunnerStrategy::new(config.runner_command.clone());
    match runner.probe().await {
        Ok(version) => {
            info!(version = %version, "structured runner available");
            Arc::new(FallbackStrategy::new(Arc::new(runner), subprocess))
        }
        Err(e) => {
            info!(error = %e, "structured runner unavailable, using subprocess strategy");
            subprocess
        }
    }
}
