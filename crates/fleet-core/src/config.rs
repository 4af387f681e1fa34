use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::access::Principal;

/// Environment variable naming an alternate config file.
pub const CONFIG_PATH_ENV: &str = "FLEET_CONFIG";

/// Lower bound applied to the run timeout.
pub const MIN_RUN_TIMEOUT_SECS: u64 = 5;

/// Top-level worker configuration loaded from `~/.fleet-worker/config.toml`.
///
/// **Security**: the service-token signing key is never stored here. The
/// file only names the environment variable that holds it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub intervals: IntervalsConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub scope: Principal,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from `$FLEET_CONFIG` or the default path, falling back to
    /// defaults when no file exists, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_path);
        let mut cfg = if path.exists() {
            Self::parse_file(&path)?
        } else {
            Config::default()
        };
        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific path, without environment overrides.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let cfg = Self::parse_file(&path.into())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply deployment overrides. `lookup` is `std::env::var` in
    /// production; tests pass a map.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn num(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut u64) {
            if let Some(v) = lookup(key).and_then(|s| s.trim().parse().ok()) {
                *slot = v;
            }
        }
        fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut bool) {
            if let Some(v) = lookup(key) {
                *slot = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
            }
        }

        if let Some(url) = lookup("BACKEND_URL").filter(|s| !s.trim().is_empty()) {
            self.control_plane.base_url = url.trim().to_string();
        }
        if let Some(path) = lookup("WORKER_STORE_PATH").filter(|s| !s.trim().is_empty()) {
            self.store.path = PathBuf::from(path.trim());
        }
        num(&lookup, "WORKER_RECOMPUTE_INTERVAL_SECONDS", &mut self.intervals.recompute_secs);
        num(&lookup, "WORKER_SCHEDULE_POLL_SECONDS", &mut self.intervals.schedule_secs);
        num(&lookup, "WORKER_ROTATION_POLL_SECONDS", &mut self.intervals.rotation_secs);
        num(&lookup, "WORKER_LEASE_EXPIRE_POLL_SECONDS", &mut self.intervals.lease_secs);
        num(&lookup, "WORKER_RUN_TIMEOUT_SECONDS", &mut self.execution.run_timeout_secs);
        num(&lookup, "WORKER_RUN_STALE_SECONDS", &mut self.execution.stale_secs);
        num(&lookup, "WORKER_PENDING_REQUEUE_SECONDS", &mut self.execution.pending_requeue_secs);
        if let Some(v) = lookup("WORKER_RUN_MAX_RETRIES").and_then(|s| s.trim().parse().ok()) {
            self.execution.max_retries = v;
        }
        flag(&lookup, "WORKER_KEEP_SENSITIVE_ARTIFACTS", &mut self.execution.keep_sensitive_artifacts);
        flag(&lookup, "WORKER_USE_ANSIBLE_RUNNER", &mut self.execution.use_structured_runner);
        if let Some(dir) = lookup("WORKER_RUNS_DIR").filter(|s| !s.trim().is_empty()) {
            self.execution.runs_dir = PathBuf::from(dir.trim());
        }
        flag(&lookup, "WORKER_LOG_JSON", &mut self.logging.json);
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control_plane.base_url.trim().is_empty() {
            return Err(ConfigError::Validation("control_plane.base_url is empty".into()));
        }
        if self.control_plane.signing_key_env.trim().is_empty() {
            return Err(ConfigError::Validation(
                "control_plane.signing_key_env is empty".into(),
            ));
        }
        if self.control_plane.token_ttl_secs == 0 {
            return Err(ConfigError::Validation("control_plane.token_ttl_secs must be > 0".into()));
        }
        self.intervals.validate()?;
        if self.execution.playbook_command.is_empty() {
            return Err(ConfigError::Validation("execution.playbook_command is empty".into()));
        }
        if self.execution.runner_command.is_empty() {
            return Err(ConfigError::Validation("execution.runner_command is empty".into()));
        }
        if self.execution.log_batch_lines == 0 {
            return Err(ConfigError::Validation("execution.log_batch_lines must be > 0".into()));
        }
        if self.rotation.generated_bytes < 16 {
            return Err(ConfigError::Validation("rotation.generated_bytes must be >= 16".into()));
        }
        Ok(())
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".fleet-worker")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    /// Name of the environment variable holding the HS256 signing key.
    #[serde(default = "default_signing_key_env")]
    pub signing_key_env: String,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            token_ttl_secs: default_token_ttl(),
            signing_key_env: default_signing_key_env(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Read the signing key from the configured environment variable.
    pub fn signing_key(&self) -> Option<String> {
        std::env::var(&self.signing_key_env).ok().filter(|k| !k.is_empty())
    }
}

fn default_base_url() -> String {
    "http://backend:8000".into()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_token_ttl() -> u64 {
    300
}
fn default_signing_key_env() -> String {
    "SECRET_KEY".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fleet-worker")
        .join("work.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalsConfig {
    #[serde(default = "default_recompute_secs")]
    pub recompute_secs: u64,
    #[serde(default = "default_schedule_secs")]
    pub schedule_secs: u64,
    #[serde(default = "default_rotation_secs")]
    pub rotation_secs: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,
    #[serde(default = "default_queue_pop_wait_secs")]
    pub queue_pop_wait_secs: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            recompute_secs: default_recompute_secs(),
            schedule_secs: default_schedule_secs(),
            rotation_secs: default_rotation_secs(),
            lease_secs: default_lease_secs(),
            watchdog_secs: default_watchdog_secs(),
            queue_pop_wait_secs: default_queue_pop_wait_secs(),
        }
    }
}

impl IntervalsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let all = [
            ("recompute_secs", self.recompute_secs),
            ("schedule_secs", self.schedule_secs),
            ("rotation_secs", self.rotation_secs),
            ("lease_secs", self.lease_secs),
            ("watchdog_secs", self.watchdog_secs),
            ("queue_pop_wait_secs", self.queue_pop_wait_secs),
        ];
        for (name, value) in all {
            if value == 0 {
                return Err(ConfigError::Validation(format!("intervals.{name} must be > 0")));
            }
        }
        Ok(())
    }
}

fn default_recompute_secs() -> u64 {
    60
}
fn default_schedule_secs() -> u64 {
    10
}
fn default_rotation_secs() -> u64 {
    60
}
fn default_lease_secs() -> u64 {
    60
}
fn default_watchdog_secs() -> u64 {
    30
}
fn default_queue_pop_wait_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_stale_secs")]
    pub stale_secs: u64,
    #[serde(default = "default_pending_requeue_secs")]
    pub pending_requeue_secs: u64,
    #[serde(default)]
    pub keep_sensitive_artifacts: bool,
    #[serde(default = "default_true")]
    pub use_structured_runner: bool,
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
    /// argv prefix for the playbook engine; inventory and playbook args follow.
    #[serde(default = "default_playbook_command")]
    pub playbook_command: Vec<String>,
    #[serde(default = "default_runner_command")]
    pub runner_command: Vec<String>,
    #[serde(default = "default_log_batch_lines")]
    pub log_batch_lines: usize,
    #[serde(default = "default_log_flush_ms")]
    pub log_flush_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: default_run_timeout(),
            max_retries: default_max_retries(),
            stale_secs: default_stale_secs(),
            pending_requeue_secs: default_pending_requeue_secs(),
            keep_sensitive_artifacts: false,
            use_structured_runner: true,
            runs_dir: default_runs_dir(),
            playbook_command: default_playbook_command(),
            runner_command: default_runner_command(),
            log_batch_lines: default_log_batch_lines(),
            log_flush_ms: default_log_flush_ms(),
        }
    }
}

impl ExecutionConfig {
    /// Run timeout with the lower bound applied.
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs.max(MIN_RUN_TIMEOUT_SECS))
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_ms.max(1))
    }
}

fn default_run_timeout() -> u64 {
    1800
}
fn default_max_retries() -> u32 {
    3
}
fn default_stale_secs() -> u64 {
    3600
}
fn default_pending_requeue_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}
fn default_runs_dir() -> PathBuf {
    PathBuf::from("/var/ansible/runs")
}
fn default_playbook_command() -> Vec<String> {
    vec!["ansible-playbook".into()]
}
fn default_runner_command() -> Vec<String> {
    vec!["ansible-runner".into()]
}
fn default_log_batch_lines() -> usize {
    50
}
fn default_log_flush_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_protected_environments")]
    pub protected_environments: Vec<String>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            protected_environments: default_protected_environments(),
        }
    }
}

impl ApprovalConfig {
    pub fn is_protected(&self, environment: &str) -> bool {
        self.protected_environments.iter().any(|e| e == environment)
    }
}

fn default_protected_environments() -> Vec<String> {
    vec!["prod".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    #[serde(default = "default_expiry_warning_days")]
    pub expiry_warning_days: u32,
    /// Random bytes drawn for a generated value before encoding.
    #[serde(default = "default_generated_bytes")]
    pub generated_bytes: usize,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            expiry_warning_days: default_expiry_warning_days(),
            generated_bytes: default_generated_bytes(),
            lock_ttl_secs: default_lock_ttl(),
        }
    }
}

impl RotationConfig {
    pub fn expiry_warning_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.expiry_warning_days))
    }
}

fn default_expiry_warning_days() -> u32 {
    7
}
fn default_generated_bytes() -> usize {
    24
}
fn default_lock_ttl() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
