//! Shared controller state and the per-cycle read-only snapshot

use std::sync::Arc;

use tracing::debug;

use crate::config::CharmConfig;
use crate::error::Result;
use crate::platform::{ClusterApi, Model, Workload};

/// Label every pod of the application carries
pub const APP_NAME_LABEL: &str = "app.kubernetes.io/name";

/// Who this process runs as: fixed for the lifetime of the process
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitIdentity {
    pub app_name: String,
    pub unit_name: String,
    /// Kubernetes namespace, equal to the model name
    pub namespace: String,
}

impl UnitIdentity {
    pub fn new(unit_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let unit_name = unit_name.into();
        let app_name = unit_name
            .split_once('/')
            .map(|(app, _)| app.to_string())
            .unwrap_or_else(|| unit_name.clone());
        Self {
            app_name,
            unit_name,
            namespace: namespace.into(),
        }
    }

    /// Name of the managed exposure Service
    pub fn exposure_service_name(&self) -> String {
        format!("{}-lb", self.app_name)
    }

    /// Label selector matching the application's pods
    pub fn pod_selector(&self) -> String {
        format!("{}={}", APP_NAME_LABEL, self.app_name)
    }
}

/// Collaborators shared by every handler
pub struct ControllerState {
    pub identity: UnitIdentity,
    pub workload: Arc<dyn Workload>,
    pub model: Arc<dyn Model>,
    pub cluster: Arc<dyn ClusterApi>,
}

impl ControllerState {
    pub fn new(
        identity: UnitIdentity,
        workload: Arc<dyn Workload>,
        model: Arc<dyn Model>,
        cluster: Arc<dyn ClusterApi>,
    ) -> Self {
        Self {
            identity,
            workload,
            model,
            cluster,
        }
    }

    /// Take the snapshot a cycle reasons about
    pub async fn snapshot(&self) -> Result<CharmContext> {
        let config = self.model.config().await?;
        let planned_units = self.model.planned_units().await?;
        debug!(
            "Snapshot for {}: planned_units={}",
            self.identity.unit_name, planned_units
        );

        Ok(CharmContext {
            identity: self.identity.clone(),
            planned_units,
            config,
        })
    }
}

/// Read-only view of the model taken once at the start of a cycle.
///
/// Leadership is not part of the snapshot: every leader-only write asks
/// [`Model::is_leader`] right before it happens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharmContext {
    pub identity: UnitIdentity,
    pub planned_units: u32,
    pub config: CharmConfig,
}
