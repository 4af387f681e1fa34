//! Per-run working directory on local disk.
//!
//! Layout of `<runs_dir>/<run_id>/`:
//!
//! | file                   | mode | sensitive |
//! |------------------------|------|-----------|
//! | `playbook.yml`         | 0644 | no        |
//! | `inventory.ini`        | 0600 | yes       |
//! | `inventory.public.ini` | 0644 | no        |
//! | `extra_vars.json`      | 0600 | yes       |
//! | `key_<host_id>.pem`    | 0600 | yes       |
//! | `run.log`              | 0644 | no        |
//! | `runner/`              | -    | yes       |
//! | `runner.summary.json`  | 0644 | no        |

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use fleet_core::types::{HostId, RunId};
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const PLAYBOOK_FILE: &str = "playbook.yml";
pub const INVENTORY_FILE: &str = "inventory.ini";
pub const PUBLIC_INVENTORY_FILE: &str = "inventory.public.ini";
pub const EXTRA_VARS_FILE: &str = "extra_vars.json";
pub const RUN_LOG_FILE: &str = "run.log";
pub const RUNNER_DIR: &str = "runner";
pub const RUNNER_SUMMARY_FILE: &str = "runner.summary.json";

#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    pub async fn create(runs_dir: &Path, run_id: RunId) -> io::Result<Self> {
        let root = runs_dir.join(run_id.to_string());
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn playbook(&self) -> PathBuf {
        self.root.join(PLAYBOOK_FILE)
    }

    pub fn inventory(&self) -> PathBuf {
        self.root.join(INVENTORY_FILE)
    }

    pub fn public_inventory(&self) -> PathBuf {
        self.root.join(PUBLIC_INVENTORY_FILE)
    }

    pub fn extra_vars(&self) -> PathBuf {
        self.root.join(EXTRA_VARS_FILE)
    }

    pub fn run_log(&self) -> PathBuf {
        self.root.join(RUN_LOG_FILE)
    }

    pub fn runner_dir(&self) -> PathBuf {
        self.root.join(RUNNER_DIR)
    }

    pub fn runner_summary(&self) -> PathBuf {
        self.root.join(RUNNER_SUMMARY_FILE)
    }

    pub fn key(&self, host_id: HostId) -> PathBuf {
        self.root.join(format!("key_{host_id}.pem"))
    }

    /// Remove every file that may hold plaintext secrets. Best-effort.
    pub async fn cleanup_sensitive(&self) {
        remove_file_quiet(&self.inventory()).await;
        remove_file_quiet(&self.extra_vars()).await;
        remove_dir_quiet(&self.runner_dir()).await;
        let Ok(mut entries) = tokio::fs::read_dir(&self.root).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("key_") && name.ends_with(".pem") {
                remove_file_quiet(&entry.path()).await;
            }
        }
    }
}

/// Write `contents` readable by the owner only.
pub async fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_with_mode(path, contents, 0o600).await
}

pub async fn write_public(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_with_mode(path, contents, 0o644).await
}

async fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .await?;
    file.write_all(contents).await?;
    file.flush().await?;
    // A pre-existing file keeps its old mode on open.
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

/// Append to a file, creating it (and its parent) if needed.
pub async fn append(path: &Path, chunk: &str) -> io::Result<()> {
    if chunk.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(chunk.as_bytes()).await?;
    file.flush().await
}

pub async fn remove_file_quiet(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "artifact removal failed");
        }
    }
}

pub async fn remove_dir_quiet(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "artifact removal failed");
        }
    }
}
