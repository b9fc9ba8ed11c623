//! Endpoint resolution for the `consul-cluster` relation
//!
//! Addresses are always `host:port`. In-cluster addresses use the Service
//! DNS name; external ones are derived from the pods' host IPs or the
//! load balancer, depending on the exposure mode.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Service;
use tracing::{debug, instrument};

use super::context::ControllerState;
use crate::config::{ExposeMode, ValidatedConfig};
use crate::consul::PortSet;
use crate::error::Result;
use crate::relation::EndpointSet;

/// Locates externally reachable health-check targets for the gossip port
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthcheckLocator {
    /// Exposure disabled: nothing is reachable from outside
    None,
    /// NodePort: every distinct node hosting a pod answers on the node port
    HostIps(BTreeSet<String>),
    /// LoadBalancer: the assigned ingress IP, if any yet
    LoadBalancer(Option<String>),
}

/// `ip:port` for every IP, in the set's order
fn join_addresses(ips: &BTreeSet<String>, port: i32) -> Vec<String> {
    ips.iter().map(|ip| format!("{ip}:{port}")).collect()
}

impl HealthcheckLocator {
    pub fn endpoints(&self, serf_lan: i32) -> Option<Vec<String>> {
        match self {
            HealthcheckLocator::None => None,
            HealthcheckLocator::HostIps(ips) => Some(join_addresses(ips, serf_lan)),
            HealthcheckLocator::LoadBalancer(ip) => {
                ip.as_ref().map(|ip| vec![format!("{ip}:{serf_lan}")])
            }
        }
    }
}

/// First ingress IP reported in a Service's load balancer status
pub fn load_balancer_ip(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .find_map(|ingress| ingress.ip.clone())
}

pub struct EndpointResolver<'a> {
    state: &'a ControllerState,
    datacenter: &'a str,
    expose_mode: ExposeMode,
    ports: PortSet,
}

impl<'a> EndpointResolver<'a> {
    pub fn new(state: &'a ControllerState, config: &'a ValidatedConfig) -> Self {
        Self {
            state,
            datacenter: &config.datacenter,
            expose_mode: config.expose_mode,
            ports: config.ports(),
        }
    }

    /// In-cluster DNS name of the application Service
    fn service_host(&self) -> String {
        let identity = &self.state.identity;
        format!("{}.{}.svc", identity.app_name, identity.namespace)
    }

    pub fn internal_join_addresses(&self) -> Vec<String> {
        vec![format!("{}:{}", self.service_host(), self.ports.serf_lan)]
    }

    pub fn internal_http_endpoint(&self) -> String {
        format!("{}:{}", self.service_host(), self.ports.http)
    }

    /// Ingress is not managed, so there is never an external HTTP endpoint
    pub fn external_http_endpoint(&self) -> Option<String> {
        None
    }

    /// Distinct host IPs of the application's scheduled pods
    pub async fn host_ips(&self) -> Result<BTreeSet<String>> {
        let pods = self
            .state
            .cluster
            .list_pods(&self.state.identity.pod_selector())
            .await?;
        let ips: BTreeSet<String> = pods
            .into_iter()
            .filter_map(|pod| pod.status.and_then(|s| s.host_ip))
            .filter(|ip| !ip.is_empty())
            .collect();
        debug!("Consul pods are running on host IPs {:?}", ips);
        Ok(ips)
    }

    pub async fn external_join_addresses(&self) -> Result<Option<Vec<String>>> {
        let host_ips = self.exposed_host_ips().await?;
        Ok(self.external_join_addresses_from(host_ips.as_ref()))
    }

    /// Host IPs when exposure is enabled; the cluster is not queried otherwise
    async fn exposed_host_ips(&self) -> Result<Option<BTreeSet<String>>> {
        if !self.expose_mode.is_enabled() {
            return Ok(None);
        }
        Ok(Some(self.host_ips().await?))
    }

    fn external_join_addresses_from(
        &self,
        host_ips: Option<&BTreeSet<String>>,
    ) -> Option<Vec<String>> {
        host_ips.map(|ips| join_addresses(ips, self.ports.serf_lan))
    }

    /// Looked up fresh on every call; never cached across cycles
    pub async fn load_balancer_ip(&self) -> Result<Option<String>> {
        let name = self.state.identity.exposure_service_name();
        Ok(self
            .state
            .cluster
            .get_service(&name)
            .await?
            .as_ref()
            .and_then(load_balancer_ip))
    }

    /// Pick the health-check strategy for the exposure mode
    pub async fn healthcheck_locator(
        &self,
        host_ips: Option<&BTreeSet<String>>,
    ) -> Result<HealthcheckLocator> {
        Ok(match self.expose_mode {
            ExposeMode::Disabled => HealthcheckLocator::None,
            ExposeMode::NodePort => match host_ips {
                Some(ips) => HealthcheckLocator::HostIps(ips.clone()),
                None => HealthcheckLocator::HostIps(self.host_ips().await?),
            },
            ExposeMode::LoadBalancer => {
                HealthcheckLocator::LoadBalancer(self.load_balancer_ip().await?)
            }
        })
    }

    /// Compute the full endpoint set; pods and the load balancer are each
    /// queried at most once.
    #[instrument(skip(self), fields(expose_mode = %self.expose_mode))]
    pub async fn resolve(&self) -> Result<EndpointSet> {
        let host_ips = self.exposed_host_ips().await?;
        let locator = self.healthcheck_locator(host_ips.as_ref()).await?;

        Ok(EndpointSet {
            datacenter: self.datacenter.to_string(),
            internal_gossip_endpoints: self.internal_join_addresses(),
            external_gossip_endpoints: self.external_join_addresses_from(host_ips.as_ref()),
            internal_http_endpoint: self.internal_http_endpoint(),
            external_http_endpoint: self.external_http_endpoint(),
            external_gossip_healthcheck_endpoints: locator.endpoints(self.ports.serf_lan),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CharmConfig;
    use crate::controller::test_support::Harness;

    fn validated(mode: &str) -> ValidatedConfig {
        CharmConfig {
            datacenter: "dc1".to_string(),
            expose_gossip_and_rpc_ports: mode.to_string(),
            serflan_node_port: 30501,
        }
        .validate()
        .unwrap()
    }

    #[tokio::test]
    async fn test_disabled_mode_addresses() {
        let h = Harness::new();
        let config = validated("false");
        let resolver = EndpointResolver::new(&h.state, &config);

        assert_eq!(resolver.internal_join_addresses(), vec!["consul.model.svc:8301"]);
        assert_eq!(resolver.internal_http_endpoint(), "consul.model.svc:8500");
        assert_eq!(resolver.external_join_addresses().await.unwrap(), None);

        let set = resolver.resolve().await.unwrap();
        assert_eq!(set.external_gossip_endpoints, None);
        assert_eq!(set.external_gossip_healthcheck_endpoints, None);
        assert_eq!(set.external_http_endpoint, None);
    }

    #[tokio::test]
    async fn test_disabled_mode_never_touches_cluster() {
        let h = Harness::new();
        h.cluster.set_unavailable(true);
        let config = validated("false");
        assert!(EndpointResolver::new(&h.state, &config)
            .resolve()
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_nodeport_external_addresses() {
        let h = Harness::new();
        h.cluster.add_pod("consul-0", Some("10.10.0.10"));
        let config = validated("nodeport");
        let resolver = EndpointResolver::new(&h.state, &config);

        assert_eq!(
            resolver.external_join_addresses().await.unwrap(),
            Some(vec!["10.10.0.10:30501".to_string()])
        );
        assert_eq!(
            resolver.internal_join_addresses(),
            vec!["consul.model.svc:30501"]
        );
        assert_eq!(resolver.internal_http_endpoint(), "consul.model.svc:8500");
    }

    #[tokio::test]
    async fn test_host_ips_are_deduplicated() {
        let h = Harness::new();
        h.cluster.add_pod("consul-0", Some("10.10.0.10"));
        h.cluster.add_pod("consul-1", Some("10.10.0.10"));
        h.cluster.add_pod("consul-2", Some("10.10.0.11"));
        h.cluster.add_pod("consul-3", None);
        let config = validated("nodeport");

        let set = EndpointResolver::new(&h.state, &config)
            .resolve()
            .await
            .unwrap();
        assert_eq!(
            set.external_gossip_endpoints,
            Some(vec![
                "10.10.0.10:30501".to_string(),
                "10.10.0.11:30501".to_string()
            ])
        );
        assert_eq!(
            set.external_gossip_healthcheck_endpoints,
            set.external_gossip_endpoints
        );
    }

    #[tokio::test]
    async fn test_loadbalancer_healthcheck_uses_ingress_ip() {
        let h = Harness::new();
        h.cluster.add_pod("consul-0", Some("10.10.0.10"));
        h.cluster.insert_service(Service {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("consul-lb".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        let config = validated("loadbalancer");
        let resolver = EndpointResolver::new(&h.state, &config);

        let set = resolver.resolve().await.unwrap();
        assert_eq!(set.external_gossip_healthcheck_endpoints, None);

        h.cluster.assign_load_balancer_ip("203.0.113.10");
        let set = resolver.resolve().await.unwrap();
        assert_eq!(
            set.external_gossip_healthcheck_endpoints,
            Some(vec!["203.0.113.10:30501".to_string()])
        );
        assert_eq!(
            set.external_gossip_endpoints,
            Some(vec!["10.10.0.10:30501".to_string()])
        );
    }

    #[tokio::test]
    async fn test_resolve_publishes_external_join_addresses() {
        let h = Harness::new();
        h.cluster.add_pod("consul-0", Some("10.10.0.11"));
        h.cluster.add_pod("consul-1", Some("10.10.0.10"));
        let config = validated("nodeport");
        let resolver = EndpointResolver::new(&h.state, &config);

        let set = resolver.resolve().await.unwrap();
        assert_eq!(
            set.external_gossip_endpoints,
            resolver.external_join_addresses().await.unwrap()
        );
        assert_eq!(
            set.external_gossip_endpoints,
            Some(vec![
                "10.10.0.10:30501".to_string(),
                "10.10.0.11:30501".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn test_resolve_lists_pods_once() {
        let h = Harness::new();
        h.cluster.add_pod("consul-0", Some("10.10.0.10"));
        let config = validated("nodeport");
        EndpointResolver::new(&h.state, &config)
            .resolve()
            .await
            .unwrap();
        assert_eq!(h.log.count("list_pods"), 1);
    }

    #[test]
    fn test_locator_variants() {
        assert_eq!(HealthcheckLocator::None.endpoints(8301), None);
        assert_eq!(HealthcheckLocator::LoadBalancer(None).endpoints(8301), None);
        let ips: BTreeSet<String> = ["10.0.0.1".to_string()].into_iter().collect();
        assert_eq!(
            HealthcheckLocator::HostIps(ips).endpoints(30501),
            Some(vec!["10.0.0.1:30501".to_string()])
        );
    }
}
