//! `{{ secret:<id> }}` references in run variables.
//!
//! Resolution is two passes over the JSON tree: collect referenced ids,
//! reveal each id once through the per-run [`SecretResolver`] cache, then
//! substitute. The same resolver serves inventory credentials, so a secret
//! used both as a host credential and in variables is revealed once.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use tracing::warn;

use fleet_core::types::{ProjectId, RevealedSecret, SecretId, SecretType};
use fleet_harness::control_plane::{ControlPlane, ControlPlaneError};

static SECRET_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*secret:(\d+)\s*\}\}").expect("static pattern compiles")
});

/// Errors never carry plaintext; only the secret id is reported.
#[derive(Debug, thiserror::Error)]
pub enum SecretRefError {
    #[error("secret {secret_id} could not be revealed")]
    Reveal {
        secret_id: SecretId,
        #[source]
        source: ControlPlaneError,
    },
    #[error("invalid secret reference {0:?}")]
    InvalidReference(String),
}

/// Memoising reveal cache scoped to one run.
pub struct SecretResolver<'a> {
    control_plane: &'a dyn ControlPlane,
    project_id: ProjectId,
    revealed: HashMap<SecretId, RevealedSecret>,
    types: HashMap<SecretId, Option<SecretType>>,
}

impl<'a> SecretResolver<'a> {
    pub fn new(control_plane: &'a dyn ControlPlane, project_id: ProjectId) -> Self {
        Self {
            control_plane,
            project_id,
            revealed: HashMap::new(),
            types: HashMap::new(),
        }
    }

    pub async fn reveal(&mut self, secret_id: SecretId) -> Result<&RevealedSecret, SecretRefError> {
        if !self.revealed.contains_key(&secret_id) {
            let secret = self
                .control_plane
                .reveal_secret(self.project_id, secret_id)
                .await
                .map_err(|source| SecretRefError::Reveal { secret_id, source })?;
            self.revealed.insert(secret_id, secret);
        }
        self.revealed
            .get(&secret_id)
            .ok_or(SecretRefError::InvalidReference(secret_id.to_string()))
    }

    /// Type of a secret, or `None` when its metadata is unavailable.
    pub async fn secret_type(&mut self, secret_id: SecretId) -> Option<SecretType> {
        if let Some(known) = self.types.get(&secret_id) {
            return *known;
        }
        let kind = match self.control_plane.get_secret(self.project_id, secret_id).await {
            Ok(meta) => Some(meta.secret_type),
            Err(e) => {
                warn!(secret_id, error = %e, "secret metadata unavailable, credential skipped");
                None
            }
        };
        self.types.insert(secret_id, kind);
        kind
    }

    /// Number of distinct secrets revealed so far.
    pub fn revealed_count(&self) -> usize {
        self.revealed.len()
    }

    /// Resolve every reference in `vars`, returning a new map.
    pub async fn resolve(&mut self, vars: &Map<String, Value>) -> Result<Map<String, Value>, SecretRefError> {
        let mut ids = BTreeSet::new();
        for value in vars.values() {
            collect_references(value, &mut ids)?;
        }
        for id in &ids {
            self.reveal(*id).await?;
        }
        Ok(vars
            .iter()
            .map(|(k, v)| (k.clone(), substitute(v, &self.revealed)))
            .collect())
    }
}

/// Every secret id referenced anywhere in `value`.
pub fn collect_references(value: &Value, out: &mut BTreeSet<SecretId>) -> Result<(), SecretRefError> {
    match value {
        Value::String(s) => {
            for caps in SECRET_REF.captures_iter(s) {
                let raw = &caps[1];
                let id = raw
                    .parse::<SecretId>()
                    .map_err(|_| SecretRefError::InvalidReference(caps[0].to_string()))?;
                out.insert(id);
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(|v| collect_references(v, out)),
        Value::Object(map) => map.values().try_for_each(|v| collect_references(v, out)),
        _ => Ok(()),
    }
}

fn substitute(value: &Value, revealed: &HashMap<SecretId, RevealedSecret>) -> Value {
    match value {
        Value::String(s) => {
            let replaced = SECRET_REF.replace_all(s, |caps: &Captures<'_>| {
                caps[1]
                    .parse::<SecretId>()
                    .ok()
                    .and_then(|id| revealed.get(&id))
                    .map(|secret| secret.value.clone())
                    .unwrap_or_default()
            });
            Value::String(replaced.into_owned())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, revealed)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, revealed)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn references_are_found_in_nested_values() {
        let mut ids = BTreeSet::new();
        let v = json!({
            "a": "x {{secret:1}} y {{  secret:2 }}",
            "b": ["{{ secret:3 }}", 4, {"c": "{{ secret:1 }}"}],
            "d": "{{ secret:abc }}",
        });
        collect_references(&v, &mut ids).unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn oversized_id_is_rejected() {
        let mut ids = BTreeSet::new();
        let v = json!("{{ secret:99999999999999999999999 }}");
        assert!(matches!(
            collect_references(&v, &mut ids),
            Err(SecretRefError::InvalidReference(_))
        ));
    }

    #[test]
    fn substitution_keeps_non_strings() {
        let mut revealed = HashMap::new();
        revealed.insert(
            7,
            RevealedSecret {
                value: "hunter2".into(),
                passphrase: None,
            },
        );
        let out = substitute(&json!({"pw": "pw={{ secret:7 }}", "n": 5, "f": false}), &revealed);
        assert_eq!(out, json!({"pw": "pw=hunter2", "n": 5, "f": false}));
    }
}
