//! Per-run `ssh-agent` holding passphrase-protected keys.
//!
//! The passphrase is handed to `ssh-add` through a throwaway askpass script
//! that reads it from the child's environment, so it never lands in the
//! inventory or on disk.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::artifacts;

const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$FLEET_SSH_PASSPHRASE\"\n";
const ASKPASS_FILE: &str = ".askpass.sh";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("ssh-agent failed: {0}")]
    Start(String),
    #[error("ssh-add failed: {0}")]
    AddKey(String),
}

#[derive(Debug)]
pub struct SshAgent {
    auth_sock: String,
    pid: String,
}

impl SshAgent {
    pub async fn start() -> Result<Self, AgentError> {
        let out = Command::new("ssh-agent")
            .arg("-s")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| AgentError::Spawn {
                program: "ssh-agent",
                source,
            })?;
        if !out.status.success() {
            return Err(AgentError::Start(String::from_utf8_lossy(&out.stderr).trim().to_string()));
        }
        let text = String::from_utf8_lossy(&out.stdout);
        let (auth_sock, pid) =
            parse_agent_output(&text).ok_or_else(|| AgentError::Start("unexpected ssh-agent output".into()))?;
        debug!(pid = %pid, "ssh-agent started");
        Ok(Self { auth_sock, pid })
    }

    /// Variables a child process needs to reach this agent.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            ("SSH_AUTH_SOCK".into(), self.auth_sock.clone()),
            ("SSH_AGENT_PID".into(), self.pid.clone()),
        ]
    }

    /// Register `key` with the agent, unlocking it with `passphrase`.
    pub async fn add_key(&self, key: &Path, passphrase: &str, scratch_dir: &Path) -> Result<(), AgentError> {
        let askpass = scratch_dir.join(ASKPASS_FILE);
        write_askpass(&askpass).await.map_err(|source| AgentError::Spawn {
            program: "ssh-add",
            source,
        })?;
        let result = Command::new("ssh-add")
            .arg(key)
            .envs(self.env())
            .env("SSH_ASKPASS", &askpass)
            .env("SSH_ASKPASS_REQUIRE", "force")
            .env("DISPLAY", std::env::var("DISPLAY").unwrap_or_else(|_| ":0".into()))
            .env("FLEET_SSH_PASSPHRASE", passphrase)
            .stdin(Stdio::null())
            .output()
            .await;
        artifacts::remove_file_quiet(&askpass).await;

        let out = result.map_err(|source| AgentError::Spawn {
            program: "ssh-add",
            source,
        })?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let detail = if stderr.trim().is_empty() {
                String::from_utf8_lossy(&out.stdout).trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(AgentError::AddKey(detail));
        }
        Ok(())
    }

    /// Kill the agent. Best-effort.
    pub async fn stop(self) {
        let result = Command::new("ssh-agent")
            .arg("-k")
            .envs(self.env())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!(pid = %self.pid, error = %e, "ssh-agent teardown failed");
        }
    }
}

async fn write_askpass(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    artifacts::write_private(path, ASKPASS_SCRIPT.as_bytes()).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await
}

/// Extract `SSH_AUTH_SOCK` and `SSH_AGENT_PID` from `ssh-agent -s` output.
pub fn parse_agent_output(text: &str) -> Option<(String, String)> {
    let mut sock = None;
    let mut pid = None;
    for part in text.split([';', '\n']) {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("SSH_AUTH_SOCK=") {
            sock = Some(v.to_string());
        } else if let Some(v) = part.strip_prefix("SSH_AGENT_PID=") {
            pid = Some(v.to_string());
        }
    }
    Some((sock?, pid?))
}
