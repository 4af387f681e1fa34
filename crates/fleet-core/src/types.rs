use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub type ProjectId = i64;
pub type RunId = i64;
pub type PlaybookId = i64;
pub type SecretId = i64;
pub type HostId = i64;
pub type GroupId = i64;
pub type ApprovalId = i64;
pub type LeaseId = i64;

/// Project every queue item and periodic loop falls back to.
pub const DEFAULT_PROJECT_ID: ProjectId = 1;

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `Pending -> Failed` covers pre-claim aborts (retry exhaustion,
    /// rejected approval); everything else goes through `Running`.
    pub fn can_transition_to(&self, target: &RunStatus) -> bool {
        matches!(
            (self, target),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Success)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Target snapshot
// ---------------------------------------------------------------------------

/// One resolved host as captured when the run was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHost {
    pub id: HostId,
    #[serde(default)]
    pub name: Option<String>,
    pub hostname: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential_id: Option<SecretId>,
    #[serde(default)]
    pub environment: Option<String>,
    /// Groups the host belonged to at snapshot time (static and dynamic).
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
}

impl SnapshotHost {
    pub fn port_or_default(&self) -> u16 {
        self.port.filter(|p| *p != 0).unwrap_or(22)
    }

    pub fn username_or_default(&self) -> &str {
        match self.username.as_deref() {
            Some(u) if !u.is_empty() => u,
            _ => "root",
        }
    }

    pub fn display_name(&self) -> String {
        match self.name.as_deref() {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => format!("host-{}", self.id),
        }
    }
}

/// Links a run to an in-flight secret rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationLink {
    pub target_secret_id: SecretId,
    pub temp_secret_id: SecretId,
}

/// Immutable record of what a run was created against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetSnapshot {
    #[serde(default)]
    pub hosts: Vec<SnapshotHost>,
    #[serde(default)]
    pub host_ids: Vec<HostId>,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub extra_vars: Map<String, Value>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub facts_run: bool,
    #[serde(default)]
    pub rotation: Option<RotationLink>,
    #[serde(default)]
    pub approval_id: Option<ApprovalId>,
    #[serde(default)]
    pub approval_status: Option<ApprovalStatus>,
    #[serde(default)]
    pub trigger: Option<String>,
}

// ---------------------------------------------------------------------------
// Run / Playbook
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    #[serde(default = "default_project_id")]
    pub project_id: ProjectId,
    pub playbook_id: PlaybookId,
    pub status: RunStatus,
    #[serde(default)]
    pub target_snapshot: TargetSnapshot,
    #[serde(default)]
    pub logs: Option<String>,
    #[serde(default)]
    pub triggered_by: Option<String>,
    #[serde(default, with = "flex_time")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "flex_time")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "flex_time")]
    pub finished_at: Option<DateTime<Utc>>,
}

fn default_project_id() -> ProjectId {
    DEFAULT_PROJECT_ID
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub id: PlaybookId,
    #[serde(default = "default_project_id")]
    pub project_id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub stored_content: Option<String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
}

/// Response of a successful claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedRun {
    pub run: Run,
    pub playbook: Playbook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    #[default]
    Interval,
    Cron,
}

/// Playbook schedule: fixed interval in seconds or a cron expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "type")]
    pub kind: ScheduleKind,
    #[serde(default = "default_schedule_value", deserialize_with = "string_or_number")]
    pub value: String,
    #[serde(default)]
    pub host_ids: Vec<HostId>,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub extra_vars: Map<String, Value>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, with = "flex_time")]
    pub last_run_at: Option<DateTime<Utc>>,
}

fn default_schedule_value() -> String {
    "300".into()
}

fn string_or_number<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(default_schedule_value()),
        other => Err(serde::de::Error::custom(format!(
            "schedule value must be a string or number, got {other}"
        ))),
    }
}

/// Parameters for creating a run through the control plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub host_ids: Vec<HostId>,
    pub group_ids: Vec<GroupId>,
    pub extra_vars: Map<String, Value>,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<RotationLink>,
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub run_id: RunId,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, with = "flex_time")]
    pub decided_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretType {
    Text,
    Password,
    Token,
    PrivateKey,
}

impl SecretType {
    /// Only generated-value secrets are rotated on a schedule.
    pub fn supports_scheduled_rotation(&self) -> bool {
        matches!(self, SecretType::Password | SecretType::Token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretScope {
    #[default]
    Project,
    Global,
}

/// Secret metadata as listed by the control plane (never the value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretMeta {
    pub id: SecretId,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    pub name: String,
    #[serde(rename = "type")]
    pub secret_type: SecretType,
    #[serde(default)]
    pub scope: SecretScope,
    #[serde(default)]
    pub rotation_interval_days: Option<u32>,
    #[serde(default)]
    pub rotation_playbook_id: Option<PlaybookId>,
    #[serde(default, with = "flex_time")]
    pub last_rotated_at: Option<DateTime<Utc>>,
    #[serde(default, with = "flex_time")]
    pub next_rotated_at: Option<DateTime<Utc>>,
    #[serde(default, with = "flex_time")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dynamic_enabled: bool,
    #[serde(default)]
    pub dynamic_ttl_seconds: Option<u64>,
}

impl SecretMeta {
    /// `last_rotated_at + interval` when an interval is set, else `None`.
    pub fn expected_next_rotation(&self) -> Option<DateTime<Utc>> {
        let days = self.rotation_interval_days.filter(|d| *d > 0)?;
        self.last_rotated_at
            .map(|last| last + Duration::days(i64::from(days)))
    }

    /// Record a rotation at `at`, keeping `next_rotated_at` consistent.
    pub fn mark_rotated(&mut self, at: DateTime<Utc>) {
        self.last_rotated_at = Some(at);
        self.next_rotated_at = self.expected_next_rotation();
    }

    /// Scheduled rotation is due when an interval is configured, the type
    /// supports generated values, and `next_rotated_at` is unset or passed.
    pub fn is_rotation_due(&self, now: DateTime<Utc>) -> bool {
        if self.rotation_interval_days.unwrap_or(0) == 0 {
            return false;
        }
        if !self.secret_type.supports_scheduled_rotation() {
            return false;
        }
        match self.next_rotated_at {
            Some(next) => next <= now,
            None => true,
        }
    }

    /// `true` when `expires_at` falls within `[now, now + window]`.
    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.expires_at {
            Some(exp) => exp >= now && exp - now <= window,
            None => false,
        }
    }
}

/// Plaintext secret material. Zeroed on drop and redacted in `Debug`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RevealedSecret {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl fmt::Debug for RevealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevealedSecret")
            .field("value", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Request body for creating a secret (used for temporary rotation values).
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct NewSecret {
    pub name: String,
    #[zeroize(skip)]
    #[serde(rename = "type")]
    pub secret_type: SecretType,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[zeroize(skip)]
    #[serde(default)]
    pub scope: SecretScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl fmt::Debug for NewSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewSecret")
            .field("name", &self.name)
            .field("secret_type", &self.secret_type)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// A time-bounded, dynamically issued secret value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretLease {
    pub id: LeaseId,
    pub secret_id: SecretId,
    #[serde(default)]
    pub issued_by: Option<String>,
    #[serde(with = "flex_time::required")]
    pub issued_at: DateTime<Utc>,
    #[serde(with = "flex_time::required")]
    pub expires_at: DateTime<Utc>,
    #[serde(default, with = "flex_time")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl SecretLease {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Unrevoked and past `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && self.expires_at <= now
    }
}

// ---------------------------------------------------------------------------
// Hosts and groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    #[serde(default = "default_project_id")]
    pub project_id: ProjectId,
    pub name: String,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, Value>,
    #[serde(default)]
    pub credential_id: Option<SecretId>,
}

fn default_port() -> u16 {
    22
}

fn default_username() -> String {
    "root".into()
}

impl Host {
    pub fn new(id: HostId, name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            id,
            project_id: DEFAULT_PROJECT_ID,
            name: name.into(),
            hostname: hostname.into(),
            port: default_port(),
            username: default_username(),
            os_type: Some("linux".into()),
            environment: None,
            tags: BTreeMap::new(),
            credential_id: None,
        }
    }

    pub fn with_environment(mut self, env: impl Into<String>) -> Self {
        self.environment = Some(env.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostGroup {
    pub id: GroupId,
    #[serde(default = "default_project_id")]
    pub project_id: ProjectId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: GroupKind,
    #[serde(default)]
    pub rule: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    #[serde(default)]
    pub name: Option<String>,
}

impl Project {
    pub fn default_project() -> Self {
        Self {
            id: DEFAULT_PROJECT_ID,
            name: Some("default".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Timestamp (de)serialisation
// ---------------------------------------------------------------------------

/// Accepts RFC 3339 timestamps as well as naive ISO timestamps, which the
/// control plane emits for UTC columns without an offset.
pub mod flex_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => s.serialize_str(&dt.to_rfc3339()),
            None => s.serialize_none(),
        }
    }

    /// Unparsable timestamps become `None` rather than failing the record.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        Ok(raw.as_deref().filter(|s| !s.is_empty()).and_then(parse))
    }

    pub mod required {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(&value.to_rfc3339())
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
            let raw = String::deserialize(d)?;
            super::parse(&raw)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
