//! Credential injection and inventory rendering.
//!
//! Produces two INI inventories from a run's host snapshot: the private
//! one handed to the automation engine (passwords, key paths) and a public
//! one that is safe to keep next to the run log.

use std::path::PathBuf;

use tracing::debug;
use zeroize::Zeroizing;

use fleet_core::types::{SecretType, SnapshotHost};

use crate::artifacts::{self, RunDir};
use crate::secret_refs::{SecretRefError, SecretResolver};

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error(transparent)]
    Secret(#[from] SecretRefError),
    #[error("failed to write key material: {0}")]
    Io(#[from] std::io::Error),
}

/// A key file that must be unlocked through the run's SSH agent.
pub struct AgentKey {
    pub path: PathBuf,
    pub passphrase: Zeroizing<String>,
}

pub struct Inventory {
    pub private: Zeroizing<String>,
    pub public: String,
    pub agent_keys: Vec<AgentKey>,
}

/// Host alias usable as an INI key: anything outside `[A-Za-z0-9_.-]` becomes `_`.
pub fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Escape a value for an inventory line: spaces are escaped, line breaks dropped.
pub fn escape_ini(value: &str) -> String {
    value.replace(' ', "\\ ").replace(['\n', '\r'], "")
}

/// Connection fields shared by both inventories.
pub fn host_line(host: &SnapshotHost) -> String {
    format!(
        "{} ansible_host={} ansible_port={} ansible_user={}",
        safe_name(&host.display_name()),
        host.hostname,
        host.port_or_default(),
        host.username_or_default(),
    )
}

/// Build both inventories, writing private keys into `run_dir`.
///
/// Password credentials are embedded in the private inventory. Private keys
/// are written as `key_<host_id>.pem` (0600); keys without a passphrase are
/// referenced directly, the others are returned in `agent_keys`. A host
/// whose credential metadata cannot be read is rendered without one.
pub async fn build_inventory(
    hosts: &[SnapshotHost],
    run_dir: &RunDir,
    resolver: &mut SecretResolver<'_>,
) -> Result<Inventory, InventoryError> {
    let mut private = Zeroizing::new(String::from("[all]\n"));
    let mut public = String::from("[all]\n");
    let mut agent_keys = Vec::new();

    for host in hosts {
        let base = host_line(host);
        public.push_str(&base);
        public.push('\n');

        let mut line = Zeroizing::new(base);
        if let Some(cred_id) = host.credential_id {
            match resolver.secret_type(cred_id).await {
                Some(SecretType::Password) => {
                    let secret = resolver.reveal(cred_id).await?;
                    line.push_str(" ansible_password=");
                    line.push_str(&escape_ini(&secret.value));
                }
                Some(SecretType::PrivateKey) => {
                    let secret = resolver.reveal(cred_id).await?;
                    let key_path = run_dir.key(host.id);
                    artifacts::write_private(&key_path, secret.value.as_bytes()).await?;
                    match secret.passphrase.as_deref().filter(|p| !p.is_empty()) {
                        Some(passphrase) => agent_keys.push(AgentKey {
                            path: key_path,
                            passphrase: Zeroizing::new(passphrase.to_string()),
                        }),
                        None => {
                            line.push_str(" ansible_ssh_private_key_file=");
                            line.push_str(&key_path.display().to_string());
                        }
                    }
                }
                Some(other) => {
                    debug!(host_id = host.id, secret_id = cred_id, kind = ?other, "credential type not injectable");
                }
                None => {}
            }
        }
        private.push_str(&line);
        private.push('\n');
    }

    Ok(Inventory {
        private,
        public,
        agent_keys,
    })
}
