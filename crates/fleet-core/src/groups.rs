//! Dynamic group resolver.
//!
//! Dynamic groups materialise their membership into the catalog cache on
//! recompute; reads fall back to a live evaluation while the cache is
//! empty so a freshly created group is never reported as empty.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::catalog::{Catalog, CatalogError};
use crate::rules;
use crate::types::{GroupId, GroupKind, Host, HostGroup, HostId, ProjectId};

/// Result of recomputing one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecomputeOutcome {
    /// Static groups have explicit membership; nothing to do.
    Static,
    Dynamic { members: usize },
}

pub struct GroupResolver<'a> {
    catalog: &'a Catalog,
}

impl<'a> GroupResolver<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    async fn group(&self, group_id: GroupId) -> Result<HostGroup, CatalogError> {
        self.catalog
            .get_group(group_id)
            .await?
            .ok_or(CatalogError::GroupNotFound(group_id))
    }

    /// Hosts of the group's project that satisfy its rule.
    async fn evaluate(&self, group: &HostGroup) -> Result<Vec<HostId>, CatalogError> {
        let predicate = rules::compile(group.rule.as_ref());
        let hosts = self.catalog.list_hosts(group.project_id).await?;
        Ok(predicate.select(&hosts).into_iter().map(|h| h.id).collect())
    }

    pub async fn recompute_group(&self, group_id: GroupId, now: DateTime<Utc>) -> Result<RecomputeOutcome, CatalogError> {
        let group = self.group(group_id).await?;
        if group.kind == GroupKind::Static {
            return Ok(RecomputeOutcome::Static);
        }
        let members = self.evaluate(&group).await?;
        self.catalog.replace_dynamic_cache(group.id, &members, now).await?;
        debug!(group_id, members = members.len(), "dynamic group recomputed");
        Ok(RecomputeOutcome::Dynamic {
            members: members.len(),
        })
    }

    /// Recompute every dynamic group in a project. Returns the number of
    /// groups recomputed.
    pub async fn recompute_project(&self, project_id: ProjectId, now: DateTime<Utc>) -> Result<usize, CatalogError> {
        let mut count = 0;
        for group in self.catalog.list_groups(project_id).await? {
            if group.kind == GroupKind::Dynamic {
                self.recompute_group(group.id, now).await?;
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn list_group_host_ids(&self, group_id: GroupId) -> Result<Vec<HostId>, CatalogError> {
        let group = self.group(group_id).await?;
        match group.kind {
            GroupKind::Static => self.catalog.static_members(group.id).await,
            GroupKind::Dynamic => {
                let cached = self.catalog.cached_members(group.id).await?;
                if cached.is_empty() {
                    self.evaluate(&group).await
                } else {
                    Ok(cached)
                }
            }
        }
    }

    pub async fn list_group_hosts(&self, group_id: GroupId) -> Result<Vec<Host>, CatalogError> {
        let ids = self.list_group_host_ids(group_id).await?;
        self.catalog.hosts_by_ids(&ids).await
    }
}
