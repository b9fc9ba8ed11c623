//! In-memory fakes for the platform traits

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Pod, PodStatus, Service, ServiceStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::context::{ControllerState, UnitIdentity};
use crate::config::CharmConfig;
use crate::consul::{Layer, Plan};
use crate::error::{Error, Result};
use crate::platform::{
    ClusterApi, Databag, DatabagContent, Model, OpenPort, RelationId, Status, Workload,
};

/// Ordered record of side effects across all fakes
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.starts_with(prefix))
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

#[derive(Default)]
struct WorkloadInner {
    connected: bool,
    files: HashMap<String, String>,
    plan: Plan,
    restart_error: Option<String>,
}

pub struct FakeWorkload {
    inner: Mutex<WorkloadInner>,
    log: CallLog,
}

impl FakeWorkload {
    pub fn new(log: CallLog) -> Self {
        Self {
            inner: Mutex::new(WorkloadInner {
                connected: true,
                ..Default::default()
            }),
            log,
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.lock().unwrap().connected = connected;
    }

    pub fn fail_restart(&self, message: &str) {
        self.inner.lock().unwrap().restart_error = Some(message.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.inner.lock().unwrap().files.get(path).cloned()
    }

    pub fn put_file(&self, path: &str, content: &str) {
        self.inner
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.to_string());
    }

    pub fn plan_services(&self) -> usize {
        self.inner.lock().unwrap().plan.services.len()
    }
}

#[async_trait]
impl Workload for FakeWorkload {
    async fn can_connect(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    async fn pull(&self, path: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(Error::WorkloadError("cannot connect".to_string()));
        }
        Ok(inner.files.get(path).cloned())
    }

    async fn push(&self, path: &str, content: &str) -> Result<()> {
        self.log.push(format!("push {path}"));
        self.put_file(path, content);
        Ok(())
    }

    async fn plan(&self) -> Result<Plan> {
        Ok(self.inner.lock().unwrap().plan.clone())
    }

    async fn add_layer(&self, label: &str, layer: &Layer) -> Result<()> {
        self.log.push(format!("add_layer {label}"));
        let mut inner = self.inner.lock().unwrap();
        for (name, service) in &layer.services {
            inner.plan.services.insert(name.clone(), service.clone());
        }
        Ok(())
    }

    async fn restart(&self, service: &str) -> Result<()> {
        self.log.push(format!("restart {service}"));
        match &self.inner.lock().unwrap().restart_error {
            Some(message) => Err(Error::WorkloadError(message.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Default, Clone)]
pub struct FakeRelation {
    pub local_app: DatabagContent,
    pub local_unit: DatabagContent,
    pub remote_app: DatabagContent,
}

struct ModelInner {
    leader: bool,
    config: CharmConfig,
    planned_units: u32,
    relations: BTreeMap<RelationId, FakeRelation>,
    unit_status: Vec<Status>,
    app_status: Vec<Status>,
    ports: BTreeSet<OpenPort>,
}

pub struct FakeModel {
    inner: Mutex<ModelInner>,
    log: CallLog,
}

impl FakeModel {
    pub fn new(log: CallLog) -> Self {
        Self {
            inner: Mutex::new(ModelInner {
                leader: true,
                config: CharmConfig::default(),
                planned_units: 1,
                relations: BTreeMap::new(),
                unit_status: Vec::new(),
                app_status: Vec::new(),
                ports: BTreeSet::new(),
            }),
            log,
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.inner.lock().unwrap().leader = leader;
    }

    pub fn set_config(&self, config: CharmConfig) {
        self.inner.lock().unwrap().config = config;
    }

    pub fn set_expose(&self, mode: &str, node_port: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.config.expose_gossip_and_rpc_ports = mode.to_string();
        inner.config.serflan_node_port = node_port;
    }

    pub fn set_planned_units(&self, units: u32) {
        self.inner.lock().unwrap().planned_units = units;
    }

    pub fn add_relation(&self, endpoint: &str, id: u32) -> RelationId {
        let relation = RelationId::new(endpoint, id);
        self.inner
            .lock()
            .unwrap()
            .relations
            .insert(relation.clone(), FakeRelation::default());
        relation
    }

    pub fn relation(&self, relation: &RelationId) -> FakeRelation {
        self.inner
            .lock()
            .unwrap()
            .relations
            .get(relation)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_remote_app(&self, relation: &RelationId, data: DatabagContent) {
        if let Some(rel) = self.inner.lock().unwrap().relations.get_mut(relation) {
            rel.remote_app = data;
        }
    }

    pub fn unit_status(&self) -> Option<Status> {
        self.inner.lock().unwrap().unit_status.last().cloned()
    }

    pub fn app_status(&self) -> Option<Status> {
        self.inner.lock().unwrap().app_status.last().cloned()
    }

    pub fn ports(&self) -> BTreeSet<OpenPort> {
        self.inner.lock().unwrap().ports.clone()
    }

    pub fn open(&self, port: OpenPort) {
        self.inner.lock().unwrap().ports.insert(port);
    }
}

#[async_trait]
impl Model for FakeModel {
    async fn is_leader(&self) -> Result<bool> {
        Ok(self.inner.lock().unwrap().leader)
    }

    async fn config(&self) -> Result<CharmConfig> {
        Ok(self.inner.lock().unwrap().config.clone())
    }

    async fn planned_units(&self) -> Result<u32> {
        Ok(self.inner.lock().unwrap().planned_units)
    }

    async fn relation_ids(&self, endpoint: &str) -> Result<Vec<RelationId>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .relations
            .keys()
            .filter(|r| r.endpoint == endpoint)
            .cloned()
            .collect())
    }

    async fn relation_get(&self, relation: &RelationId, bag: Databag) -> Result<DatabagContent> {
        let inner = self.inner.lock().unwrap();
        let rel = inner
            .relations
            .get(relation)
            .ok_or_else(|| Error::HookToolError {
                tool: "relation-get".to_string(),
                message: format!("relation {relation} not found"),
            })?;
        Ok(match bag {
            Databag::LocalApp => rel.local_app.clone(),
            Databag::LocalUnit => rel.local_unit.clone(),
            Databag::RemoteApp => rel.remote_app.clone(),
        })
    }

    async fn relation_set(
        &self,
        relation: &RelationId,
        bag: Databag,
        data: &DatabagContent,
    ) -> Result<()> {
        self.log.push(format!("relation_set {relation}"));
        let mut inner = self.inner.lock().unwrap();
        let leader = inner.leader;
        let rel = inner
            .relations
            .get_mut(relation)
            .ok_or_else(|| Error::HookToolError {
                tool: "relation-set".to_string(),
                message: format!("relation {relation} not found"),
            })?;
        let target = match bag {
            Databag::LocalApp if !leader => {
                return Err(Error::HookToolError {
                    tool: "relation-set".to_string(),
                    message: "cannot write application data: not the leader".to_string(),
                })
            }
            Databag::LocalApp => &mut rel.local_app,
            Databag::LocalUnit => &mut rel.local_unit,
            Databag::RemoteApp => {
                return Err(Error::RelationDataError("remote databag".to_string()))
            }
        };
        for (key, value) in data {
            if value.is_empty() {
                target.remove(key);
            } else {
                target.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn set_unit_status(&self, status: &Status) -> Result<()> {
        self.inner.lock().unwrap().unit_status.push(status.clone());
        Ok(())
    }

    async fn set_app_status(&self, status: &Status) -> Result<()> {
        self.inner.lock().unwrap().app_status.push(status.clone());
        Ok(())
    }

    async fn opened_ports(&self) -> Result<Vec<OpenPort>> {
        Ok(self.inner.lock().unwrap().ports.iter().copied().collect())
    }

    async fn open_port(&self, port: OpenPort) -> Result<()> {
        self.log.push(format!("open_port {port}"));
        self.inner.lock().unwrap().ports.insert(port);
        Ok(())
    }

    async fn close_port(&self, port: OpenPort) -> Result<()> {
        self.log.push(format!("close_port {port}"));
        self.inner.lock().unwrap().ports.remove(&port);
        Ok(())
    }
}

#[derive(Default)]
struct ClusterInner {
    pods: Vec<Pod>,
    services: BTreeMap<String, Service>,
    load_balancer_ip: Option<String>,
    unavailable: bool,
}

pub struct FakeCluster {
    inner: Mutex<ClusterInner>,
    log: CallLog,
}

impl FakeCluster {
    pub fn new(log: CallLog) -> Self {
        Self {
            inner: Mutex::new(ClusterInner::default()),
            log,
        }
    }

    /// Add a pod scheduled on `host_ip` (or not yet scheduled)
    pub fn add_pod(&self, name: &str, host_ip: Option<&str>) {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                host_ip: host_ip.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.inner.lock().unwrap().pods.push(pod);
    }

    /// Ingress IP reported for every Service from now on
    pub fn assign_load_balancer_ip(&self, ip: &str) {
        self.inner.lock().unwrap().load_balancer_ip = Some(ip.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unwrap().unavailable = unavailable;
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.inner.lock().unwrap().services.get(name).cloned()
    }

    pub fn insert_service(&self, service: Service) {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.inner.lock().unwrap().services.insert(name, service);
    }

    fn check(&self) -> Result<()> {
        if self.inner.lock().unwrap().unavailable {
            return Err(Error::ConfigError("cluster unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        self.check()?;
        self.log.push(format!("list_pods {label_selector}"));
        Ok(self.inner.lock().unwrap().pods.clone())
    }

    async fn get_service(&self, name: &str) -> Result<Option<Service>> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.services.get(name).cloned().map(|mut service| {
            if let Some(ip) = &inner.load_balancer_ip {
                service.status = Some(ServiceStatus {
                    load_balancer: Some(LoadBalancerStatus {
                        ingress: Some(vec![LoadBalancerIngress {
                            ip: Some(ip.clone()),
                            ..Default::default()
                        }]),
                    }),
                    ..Default::default()
                });
            }
            service
        }))
    }

    async fn apply_service(&self, service: &Service, field_manager: &str) -> Result<()> {
        self.check()?;
        let name = service.metadata.name.clone().unwrap_or_default();
        self.log.push(format!("apply_service {name} {field_manager}"));
        self.inner
            .lock()
            .unwrap()
            .services
            .insert(name, service.clone());
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<bool> {
        self.check()?;
        self.log.push(format!("delete_service {name}"));
        Ok(self.inner.lock().unwrap().services.remove(name).is_some())
    }
}

/// A wired-up controller over fakes for unit `consul/0` in model `model`
pub struct Harness {
    pub log: CallLog,
    pub workload: Arc<FakeWorkload>,
    pub model: Arc<FakeModel>,
    pub cluster: Arc<FakeCluster>,
    pub state: ControllerState,
}

impl Harness {
    pub fn new() -> Self {
        let log = CallLog::default();
        let workload = Arc::new(FakeWorkload::new(log.clone()));
        let model = Arc::new(FakeModel::new(log.clone()));
        let cluster = Arc::new(FakeCluster::new(log.clone()));
        let state = ControllerState::new(
            UnitIdentity::new("consul/0", "model"),
            workload.clone(),
            model.clone(),
            cluster.clone(),
        );
        Self {
            log,
            workload,
            model,
            cluster,
            state,
        }
    }
}
