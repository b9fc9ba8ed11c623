//! Seams to the outside world
//!
//! The controller never talks to Pebble, the Juju hook tools or the
//! Kubernetes API directly. It goes through the three traits below, which
//! have one production adapter each and in-memory fakes in tests.

pub mod hook_tools;
pub mod k8s;
pub mod pebble;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};

use crate::config::CharmConfig;
use crate::consul::{Layer, Plan};
use crate::error::{Error, Result};

pub use self::hook_tools::HookTools;
pub use self::k8s::KubeClusterApi;
pub use self::pebble::PebbleCli;

/// A relation instance, e.g. `consul-cluster:3`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationId {
    pub endpoint: String,
    pub id: u32,
}

impl RelationId {
    pub fn new(endpoint: impl Into<String>, id: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            id,
        }
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.endpoint, self.id)
    }
}

impl FromStr for RelationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (endpoint, id) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::RelationDataError(format!("malformed relation id '{s}'")))?;
        let id = id
            .parse()
            .map_err(|_| Error::RelationDataError(format!("malformed relation id '{s}'")))?;
        if endpoint.is_empty() {
            return Err(Error::RelationDataError(format!(
                "malformed relation id '{s}'"
            )));
        }
        Ok(Self::new(endpoint, id))
    }
}

/// Which databag of a relation to read or write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Databag {
    /// This application's databag (writable by the leader only)
    LocalApp,
    /// This unit's databag
    LocalUnit,
    /// The remote application's databag (read-only)
    RemoteApp,
}

pub type DatabagContent = BTreeMap<String, String>;

/// Workload status levels understood by `status-set`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusLevel {
    Active,
    Blocked,
    Waiting,
    Maintenance,
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusLevel::Active => "active",
            StatusLevel::Blocked => "blocked",
            StatusLevel::Waiting => "waiting",
            StatusLevel::Maintenance => "maintenance",
        };
        write!(f, "{s}")
    }
}

/// A status level plus its human readable message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub level: StatusLevel,
    pub message: String,
}

impl Status {
    pub fn active() -> Self {
        Self {
            level: StatusLevel::Active,
            message: String::new(),
        }
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Blocked,
            message: message.into(),
        }
    }

    pub fn waiting(message: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Waiting,
            message: message.into(),
        }
    }

    pub fn maintenance(message: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Maintenance,
            message: message.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A port opened on the unit, rendered as `8301/tcp`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpenPort {
    pub protocol: Protocol,
    pub port: i32,
}

impl OpenPort {
    pub fn tcp(port: i32) -> Self {
        Self {
            protocol: Protocol::Tcp,
            port,
        }
    }

    pub fn udp(port: i32) -> Self {
        Self {
            protocol: Protocol::Udp,
            port,
        }
    }
}

impl fmt::Display for OpenPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{}/{}", self.port, proto)
    }
}

impl FromStr for OpenPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::ConfigError(format!("malformed port '{s}'"));
        let (port, proto) = s.split_once('/').ok_or_else(malformed)?;
        let port = port.parse().map_err(|_| malformed())?;
        let protocol = match proto {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            _ => return Err(malformed()),
        };
        Ok(Self { protocol, port })
    }
}

/// The supervised workload container
#[async_trait]
pub trait Workload: Send + Sync {
    /// Whether the supervisor answers at all
    async fn can_connect(&self) -> bool;

    /// Read a file; `None` when it does not exist
    async fn pull(&self, path: &str) -> Result<Option<String>>;

    /// Write a file, creating parent directories
    async fn push(&self, path: &str, content: &str) -> Result<()>;

    /// The currently active supervision plan
    async fn plan(&self) -> Result<Plan>;

    /// Merge `layer` into the plan under `label`
    async fn add_layer(&self, label: &str, layer: &Layer) -> Result<()>;

    async fn restart(&self, service: &str) -> Result<()>;
}

/// The hosting model: leadership, options, relations, status and ports
#[async_trait]
pub trait Model: Send + Sync {
    async fn is_leader(&self) -> Result<bool>;

    async fn config(&self) -> Result<CharmConfig>;

    /// Number of units the application is expected to have
    async fn planned_units(&self) -> Result<u32>;

    async fn relation_ids(&self, endpoint: &str) -> Result<Vec<RelationId>>;

    async fn relation_get(&self, relation: &RelationId, bag: Databag) -> Result<DatabagContent>;

    /// Update keys of a local databag. An empty value removes the key.
    async fn relation_set(
        &self,
        relation: &RelationId,
        bag: Databag,
        data: &DatabagContent,
    ) -> Result<()>;

    async fn set_unit_status(&self, status: &Status) -> Result<()>;

    /// Set the application status; only valid on the leader
    async fn set_app_status(&self, status: &Status) -> Result<()>;

    async fn opened_ports(&self) -> Result<Vec<OpenPort>>;

    async fn open_port(&self, port: OpenPort) -> Result<()>;

    async fn close_port(&self, port: OpenPort) -> Result<()>;
}

/// The slice of the Kubernetes API this operator uses, scoped to the model
/// namespace
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>>;

    async fn get_service(&self, name: &str) -> Result<Option<Service>>;

    /// Server-side apply `service` with `field_manager`
    async fn apply_service(&self, service: &Service, field_manager: &str) -> Result<()>;

    /// Delete a Service; `false` when it did not exist
    async fn delete_service(&self, name: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_id_parse() {
        let id: RelationId = "consul-cluster:3".parse().unwrap();
        assert_eq!(id, RelationId::new("consul-cluster", 3));
        assert_eq!(id.to_string(), "consul-cluster:3");
    }

    #[test]
    fn test_relation_id_rejects_garbage() {
        assert!("consul-cluster".parse::<RelationId>().is_err());
        assert!("consul-cluster:x".parse::<RelationId>().is_err());
        assert!(":4".parse::<RelationId>().is_err());
    }

    #[test]
    fn test_open_port_format() {
        assert_eq!(OpenPort::udp(8301).to_string(), "8301/udp");
        assert_eq!("8500/tcp".parse::<OpenPort>().unwrap(), OpenPort::tcp(8500));
        assert!("8500/sctp".parse::<OpenPort>().is_err());
        assert!("8500".parse::<OpenPort>().is_err());
    }
}
