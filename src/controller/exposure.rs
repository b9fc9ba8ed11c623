//! Exposure of the gossip and HTTP ports
//!
//! The unit always opens the gossip and HTTP ports Consul listens on, which
//! Juju publishes through the `<app>` Service. NodePort and LoadBalancer
//! exposure additionally manage one Service named `<app>-lb`, owned by the
//! leader.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{debug, info, instrument, warn};

use super::context::{ControllerState, UnitIdentity, APP_NAME_LABEL};
use crate::config::ExposeMode;
use crate::consul::PortSet;
use crate::error::Result;
use crate::platform::OpenPort;

/// What the current options require to be exposed
#[derive(Clone, Debug, PartialEq)]
pub struct ExposurePlan {
    /// Exactly this set of ports open on the unit
    pub unit_ports: BTreeSet<OpenPort>,
    /// The `<app>-lb` Service; `None` means it must not exist
    pub service: Option<Box<Service>>,
}

/// Compute the exposure plan; pure
pub fn plan(identity: &UnitIdentity, expose_mode: ExposeMode, ports: &PortSet) -> ExposurePlan {
    let unit_ports = [
        OpenPort::tcp(ports.serf_lan),
        OpenPort::udp(ports.serf_lan),
        OpenPort::tcp(ports.http),
    ]
    .into_iter()
    .collect();

    let service = match expose_mode {
        ExposeMode::Disabled => None,
        ExposeMode::NodePort => Some(build_service(identity, "NodePort", ports)),
        ExposeMode::LoadBalancer => Some(build_service(identity, "LoadBalancer", ports)),
    };

    ExposurePlan {
        unit_ports,
        service: service.map(Box::new),
    }
}

fn app_labels(identity: &UnitIdentity) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_NAME_LABEL.to_string(), identity.app_name.clone());
    labels
}

/// Build the `<app>-lb` Service.
///
/// The gossip port is published on the node port with the same number, so
/// that what Consul advertises is reachable from outside the cluster.
pub fn build_service(identity: &UnitIdentity, service_type: &str, ports: &PortSet) -> Service {
    let labels = app_labels(identity);
    let serf = ports.serf_lan;
    let http = ports.http;

    let service_ports = vec![
        ServicePort {
            name: Some(format!("juju-{serf}-tcp")),
            port: serf,
            protocol: Some("TCP".to_string()),
            node_port: Some(serf),
            ..Default::default()
        },
        ServicePort {
            name: Some(format!("juju-{serf}-udp")),
            port: serf,
            protocol: Some("UDP".to_string()),
            node_port: Some(serf),
            ..Default::default()
        },
        ServicePort {
            name: Some(format!("juju-{http}-tcp")),
            port: http,
            protocol: Some("TCP".to_string()),
            target_port: Some(IntOrString::Int(http)),
            ..Default::default()
        },
    ];

    Service {
        metadata: ObjectMeta {
            name: Some(identity.exposure_service_name()),
            namespace: Some(identity.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            selector: Some(labels),
            ports: Some(service_ports),
            ..Default::default()
        }),
        status: None,
    }
}

/// Juju removes non-leader units on scale down, so a leader seeing its own
/// `remove` hook is taken to mean the whole application is going away.
/// This is a platform heuristic, not a guarantee.
pub fn removal_tears_down_application(unit_is_leader: bool) -> bool {
    unit_is_leader
}

pub struct ServiceExposer<'a> {
    state: &'a ControllerState,
}

impl<'a> ServiceExposer<'a> {
    pub fn new(state: &'a ControllerState) -> Self {
        Self { state }
    }

    /// Converge the unit ports and the Service to `plan`
    #[instrument(skip(self, plan), fields(unit = %self.state.identity.unit_name))]
    pub async fn reconcile(&self, plan: &ExposurePlan) -> Result<()> {
        self.set_unit_ports(&plan.unit_ports).await?;

        match &plan.service {
            None => self.delete_stale_service().await,
            Some(service) => {
                if !self.state.model.is_leader().await? {
                    debug!("Not leader, leaving Service to the leader");
                    return Ok(());
                }
                self.state
                    .cluster
                    .apply_service(service, &self.state.identity.app_name)
                    .await
            }
        }
    }

    async fn set_unit_ports(&self, desired: &BTreeSet<OpenPort>) -> Result<()> {
        let opened: BTreeSet<OpenPort> =
            self.state.model.opened_ports().await?.into_iter().collect();

        for port in opened.difference(desired) {
            info!("Closing port {}", port);
            self.state.model.close_port(*port).await?;
        }
        for port in desired.difference(&opened) {
            info!("Opening port {}", port);
            self.state.model.open_port(*port).await?;
        }
        Ok(())
    }

    async fn delete_stale_service(&self) -> Result<()> {
        if !self.state.model.is_leader().await? {
            return Ok(());
        }
        let name = self.state.identity.exposure_service_name();
        if self.state.cluster.get_service(&name).await?.is_some() {
            info!("Exposure disabled, removing Service {}", name);
            self.state.cluster.delete_service(&name).await?;
        }
        Ok(())
    }

    /// Handle this unit's removal
    #[instrument(skip(self), fields(unit = %self.state.identity.unit_name))]
    pub async fn remove(&self) -> Result<()> {
        let is_leader = self.state.model.is_leader().await?;
        if !removal_tears_down_application(is_leader) {
            return Ok(());
        }
        let name = self.state.identity.exposure_service_name();
        info!("Removing Service {}", name);
        if !self.state.cluster.delete_service(&name).await? {
            warn!("Service {} was already gone", name);
        }
        Ok(())
    }
}
