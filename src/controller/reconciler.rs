//! The reconcile loop
//!
//! One pass brings the workload in line with the current options:
//! configuration file, then supervision layer, then restart, then
//! exposure, then endpoint publication. Every step is idempotent, so the
//! same pass can run for any trigger.

use tracing::{debug, error, info, instrument, warn};

use super::context::ControllerState;
use super::endpoints::EndpointResolver;
use super::exposure::{self, ServiceExposer};
use super::status::{restart_failed_message, update_status, update_unit_status, Phase};
use crate::config::ValidatedConfig;
use crate::consul::{
    ConsulConfigBuilder, Layer, RenderedConfig, CONSUL_CONFIG_PATH, CONSUL_SERVICE_NAME,
};
use crate::error::Result;
use crate::platform::{Databag, RelationId};
use crate::relation::CLUSTER_RELATION;

/// Where endpoints get published at the end of a cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishTarget {
    /// Every `consul-cluster` relation
    All,
    /// Only the relation that asked
    Relation(RelationId),
}

pub struct ReconcileLoop<'a> {
    state: &'a ControllerState,
}

impl<'a> ReconcileLoop<'a> {
    pub fn new(state: &'a ControllerState) -> Self {
        Self { state }
    }

    /// Run one cycle and report the phase it ended in
    #[instrument(skip(self), fields(unit = %self.state.identity.unit_name))]
    pub async fn run(&self, target: PublishTarget) -> Result<Phase> {
        let ctx = self.state.snapshot().await?;

        let config = match ctx.config.validate() {
            Ok(config) => config,
            Err(e) => {
                warn!("Invalid configuration: {}", e);
                let phase = Phase::Blocked(e.to_string());
                update_status(self.state, &phase.status()).await?;
                return Ok(phase);
            }
        };

        if !self.state.workload.can_connect().await {
            info!("Workload not reachable yet");
            let phase = Phase::WaitingForWorkload;
            update_status(self.state, &phase.status()).await?;
            return Ok(phase);
        }

        let resolver = EndpointResolver::new(self.state, &config);
        let rendered = ConsulConfigBuilder::new(
            config.ports(),
            config.datacenter.as_str(),
            ctx.planned_units,
            resolver.internal_join_addresses(),
        )
        .build();

        let config_changed = self.update_consul_config(&rendered).await?;
        let layer_changed = self.update_layer().await?;

        if config_changed || layer_changed {
            update_unit_status(self.state, &Phase::Configuring.status()).await?;
            debug!("Restarting the consul service");
            if let Err(e) = self.state.workload.restart(CONSUL_SERVICE_NAME).await {
                let message = restart_failed_message(&e);
                error!("{}", message);
                let phase = Phase::Blocked(message);
                update_status(self.state, &phase.status()).await?;
                return Ok(phase);
            }
        }

        self.apply_exposure(&config).await;
        self.publish(&resolver, &target).await?;

        let phase = Phase::Active;
        update_status(self.state, &phase.status()).await?;
        Ok(phase)
    }

    /// Write the server configuration if it differs from what is on disk
    async fn update_consul_config(&self, rendered: &RenderedConfig) -> Result<bool> {
        let persisted = match self.state.workload.pull(CONSUL_CONFIG_PATH).await {
            Ok(Some(text)) => match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Ignoring unreadable Consul config: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!("Failed to retrieve Consul config {}", e);
                None
            }
        };

        if persisted.as_ref().is_some_and(|p| rendered.matches(p)) {
            return Ok(false);
        }

        self.state
            .workload
            .push(CONSUL_CONFIG_PATH, &rendered.to_json_pretty()?)
            .await?;
        info!("Consul configuration file updated");
        Ok(true)
    }

    /// Add the supervision layer if the active plan differs
    async fn update_layer(&self) -> Result<bool> {
        let layer = Layer::consul();
        let plan = self.state.workload.plan().await?;
        if layer.is_applied(&plan) {
            return Ok(false);
        }

        self.state
            .workload
            .add_layer(CONSUL_SERVICE_NAME, &layer)
            .await?;
        info!("Pebble layer is updated");
        Ok(true)
    }

    /// Kubernetes and port errors do not stop the cycle
    async fn apply_exposure(&self, config: &ValidatedConfig) {
        let plan = exposure::plan(&self.state.identity, config.expose_mode, &config.ports());
        if let Err(e) = ServiceExposer::new(self.state).reconcile(&plan).await {
            warn!("Failed to apply exposure for {}: {}", config.expose_mode, e);
        }
    }

    /// Publish the endpoint set; leader only
    async fn publish(&self, resolver: &EndpointResolver<'_>, target: &PublishTarget) -> Result<()> {
        if !self.state.model.is_leader().await? {
            debug!("Not a leader unit, skipping endpoint publication");
            return Ok(());
        }

        let relations = match target {
            PublishTarget::All => self.state.model.relation_ids(CLUSTER_RELATION).await?,
            PublishTarget::Relation(relation) => vec![relation.clone()],
        };
        if relations.is_empty() {
            return Ok(());
        }

        let endpoints = match resolver.resolve().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!("Cannot resolve cluster endpoints, not publishing: {}", e);
                return Ok(());
            }
        };
        let databag = endpoints.to_databag()?;

        for relation in relations {
            if !self.state.model.is_leader().await? {
                warn!("Lost leadership while publishing endpoints");
                return Ok(());
            }
            debug!("Sending endpoints on relation {}", relation);
            self.state
                .model
                .relation_set(&relation, Databag::LocalApp, &databag)
                .await?;
        }
        Ok(())
    }
}
