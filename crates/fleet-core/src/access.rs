//! Read-side scope predicates for a principal's allow-lists.
//!
//! Every allow-list follows the same convention: `None` means
//! unrestricted, an empty list means nothing is visible, and a non-empty
//! list is a membership test. Group scoping of hosts unions static
//! membership with the dynamic-group cache.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::types::{GroupId, Host, HostGroup, HostId, ProjectId, SnapshotHost};

/// A subject whose visibility is restricted by optional allow-lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    #[serde(default)]
    pub allowed_environments: Option<Vec<String>>,
    #[serde(default)]
    pub allowed_group_ids: Option<Vec<GroupId>>,
    #[serde(default)]
    pub allowed_project_ids: Option<Vec<ProjectId>>,
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// A composable membership filter over `T`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope<T: Eq + Hash> {
    Unrestricted,
    Only(HashSet<T>),
}

impl<T: Eq + Hash + Clone> Scope<T> {
    pub fn from_allow_list(list: Option<&[T]>) -> Self {
        match list {
            None => Scope::Unrestricted,
            Some(items) => Scope::Only(items.iter().cloned().collect()),
        }
    }

    pub fn nothing() -> Self {
        Scope::Only(HashSet::new())
    }

    pub fn allows(&self, value: &T) -> bool {
        match self {
            Scope::Unrestricted => true,
            Scope::Only(set) => set.contains(value),
        }
    }

    /// Like [`allows`](Self::allows) for an optional attribute; a missing
    /// attribute passes only an unrestricted scope.
    pub fn allows_opt(&self, value: Option<&T>) -> bool {
        match (self, value) {
            (Scope::Unrestricted, _) => true,
            (Scope::Only(_), None) => false,
            (Scope::Only(set), Some(v)) => set.contains(v),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Scope::Only(set) if set.is_empty())
    }

    pub fn intersect(self, other: Scope<T>) -> Scope<T> {
        match (self, other) {
            (Scope::Unrestricted, s) | (s, Scope::Unrestricted) => s,
            (Scope::Only(a), Scope::Only(b)) => Scope::Only(a.intersection(&b).cloned().collect()),
        }
    }
}

// ---------------------------------------------------------------------------
// Group membership
// ---------------------------------------------------------------------------

/// Group -> host membership from both the static join table and the
/// dynamic-group cache.
#[derive(Debug, Clone, Default)]
pub struct GroupMembership {
    static_members: HashMap<GroupId, HashSet<HostId>>,
    dynamic_members: HashMap<GroupId, HashSet<HostId>>,
}

impl GroupMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_static(&mut self, group: GroupId, host: HostId) {
        self.static_members.entry(group).or_default().insert(host);
    }

    pub fn add_dynamic(&mut self, group: GroupId, host: HostId) {
        self.dynamic_members.entry(group).or_default().insert(host);
    }

    /// Membership as recorded on run snapshot hosts, which already carry
    /// the union of static and dynamic groups.
    pub fn from_snapshot(hosts: &[SnapshotHost]) -> Self {
        let mut m = Self::new();
        for host in hosts {
            for group in &host.group_ids {
                m.add_static(*group, host.id);
            }
        }
        m
    }

    /// Hosts belonging to any of `groups`, static or dynamic.
    pub fn hosts_in<'a>(&self, groups: impl IntoIterator<Item = &'a GroupId>) -> HashSet<HostId> {
        let mut out = HashSet::new();
        for group in groups {
            for source in [&self.static_members, &self.dynamic_members] {
                if let Some(members) = source.get(group) {
                    out.extend(members.iter().copied());
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Host scope
// ---------------------------------------------------------------------------

/// Host-level filter derived from a principal.
#[derive(Debug, Clone)]
pub struct HostScope {
    environments: Scope<String>,
    host_ids: Scope<HostId>,
}

impl HostScope {
    pub fn unrestricted() -> Self {
        Self {
            environments: Scope::Unrestricted,
            host_ids: Scope::Unrestricted,
        }
    }

    pub fn allows(&self, host_id: HostId, environment: Option<&str>) -> bool {
        if self.environments.is_empty() || self.host_ids.is_empty() {
            return false;
        }
        let env_ok = match environment {
            Some(env) => self.environments.allows(&env.to_string()),
            None => matches!(self.environments, Scope::Unrestricted),
        };
        env_ok && self.host_ids.allows(&host_id)
    }

    pub fn allows_host(&self, host: &Host) -> bool {
        self.allows(host.id, host.environment.as_deref())
    }

    pub fn allows_snapshot_host(&self, host: &SnapshotHost) -> bool {
        self.allows(host.id, host.environment.as_deref())
    }

    /// Compose with another scope; a host must pass both.
    pub fn and(self, other: HostScope) -> HostScope {
        HostScope {
            environments: self.environments.intersect(other.environments),
            host_ids: self.host_ids.intersect(other.host_ids),
        }
    }
}

impl Principal {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn is_project_allowed(&self, project_id: ProjectId) -> bool {
        self.project_scope().allows(&project_id)
    }

    pub fn project_scope(&self) -> Scope<ProjectId> {
        Scope::from_allow_list(self.allowed_project_ids.as_deref())
    }

    pub fn group_scope(&self) -> Scope<GroupId> {
        Scope::from_allow_list(self.allowed_group_ids.as_deref())
    }

    /// Build the host filter. Group allow-lists are expanded through
    /// `membership` so hosts reached via dynamic groups are covered too.
    pub fn host_scope(&self, membership: &GroupMembership) -> HostScope {
        let environments = Scope::from_allow_list(self.allowed_environments.as_deref());
        let host_ids = match &self.allowed_group_ids {
            None => Scope::Unrestricted,
            Some(groups) => Scope::Only(membership.hosts_in(groups.iter())),
        };
        HostScope {
            environments,
            host_ids,
        }
    }

    pub fn allows_group(&self, group: &HostGroup) -> bool {
        self.group_scope().allows(&group.id)
    }

    pub fn filter_hosts<'a>(&self, hosts: &'a [Host], membership: &GroupMembership) -> Vec<&'a Host> {
        let scope = self.host_scope(membership);
        hosts
            .iter()
            .filter(|h| self.is_project_allowed(h.project_id) && scope.allows_host(h))
            .collect()
    }

    pub fn filter_groups<'a>(&self, groups: &'a [HostGroup]) -> Vec<&'a HostGroup> {
        groups
            .iter()
            .filter(|g| self.is_project_allowed(g.project_id) && self.allows_group(g))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
