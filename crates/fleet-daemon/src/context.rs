use std::sync::Arc;

use tracing::warn;

use fleet_core::config::Config;
use fleet_core::store::{QueueItem, StoreError, WorkStore};
use fleet_core::types::{ProjectId, DEFAULT_PROJECT_ID};
use fleet_harness::control_plane::ControlPlane;
use fleet_harness::shutdown::ShutdownSignal;

use crate::strategy::RunStrategy;

/// Handles shared by every worker loop.
///
/// Built once at startup and cloned into each loop; there is no other
/// process-wide state besides the metrics collector.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<Config>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub store: Arc<WorkStore>,
    pub strategy: Arc<dyn RunStrategy>,
    pub shutdown: ShutdownSignal,
}

impl WorkerContext {
    pub fn new(
        config: Config,
        control_plane: Arc<dyn ControlPlane>,
        store: Arc<WorkStore>,
        strategy: Arc<dyn RunStrategy>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            control_plane,
            store,
            strategy,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Projects the periodic loops fan out over, restricted to the worker's
    /// configured project scope.
    pub async fn projects(&self) -> Vec<ProjectId> {
        let listed = match self.control_plane.list_projects().await {
            Ok(projects) => projects.into_iter().map(|p| p.id).collect(),
            Err(e) => {
                warn!(error = %e, "project listing failed, using default project");
                vec![DEFAULT_PROJECT_ID]
            }
        };
        listed
            .into_iter()
            .filter(|id| self.config.scope.is_project_allowed(*id))
            .collect()
    }

    /// Append a run to the back of the work queue.
    pub async fn enqueue(&self, item: QueueItem) -> Result<(), StoreError> {
        self.store.push_back(item.to_string()).await
    }
}
