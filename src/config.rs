//! Charm options and their validation
//!
//! Options arrive as the JSON object printed by `config-get --format=json`.
//! Nothing downstream sees raw options: every cycle first turns them into a
//! [`ValidatedConfig`] or stops with a [`ConfigValidationError`].

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::consul::PortSet;

pub const DATACENTER_KEY: &str = "datacenter";
pub const EXPOSE_KEY: &str = "expose-gossip-and-rpc-ports";
pub const SERFLAN_NODE_PORT_KEY: &str = "serflan-node-port";

/// Kubernetes default NodePort range
pub const NODE_PORT_RANGE: RangeInclusive<i64> = 30000..=32767;

fn default_datacenter() -> String {
    "dc1".to_string()
}

fn default_expose() -> String {
    "false".to_string()
}

fn default_serflan_node_port() -> i64 {
    30501
}

/// Raw charm options
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharmConfig {
    #[serde(default = "default_datacenter")]
    pub datacenter: String,

    #[serde(rename = "expose-gossip-and-rpc-ports", default = "default_expose")]
    pub expose_gossip_and_rpc_ports: String,

    #[serde(rename = "serflan-node-port", default = "default_serflan_node_port")]
    pub serflan_node_port: i64,
}

impl Default for CharmConfig {
    fn default() -> Self {
        Self {
            datacenter: default_datacenter(),
            expose_gossip_and_rpc_ports: default_expose(),
            serflan_node_port: default_serflan_node_port(),
        }
    }
}

/// How the gossip and HTTP ports are reachable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExposeMode {
    /// Cluster-internal only
    Disabled,
    /// Exposed on every node through a NodePort Service
    NodePort,
    /// Exposed through a LoadBalancer Service
    LoadBalancer,
}

impl ExposeMode {
    pub const VALID_VALUES: [&'static str; 3] = ["false", "nodeport", "loadbalancer"];

    pub fn is_enabled(&self) -> bool {
        !matches!(self, ExposeMode::Disabled)
    }
}

impl FromStr for ExposeMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "false" => Ok(ExposeMode::Disabled),
            "nodeport" => Ok(ExposeMode::NodePort),
            "loadbalancer" => Ok(ExposeMode::LoadBalancer),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ExposeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExposeMode::Disabled => "false",
            ExposeMode::NodePort => "nodeport",
            ExposeMode::LoadBalancer => "loadbalancer",
        };
        write!(f, "{}", s)
    }
}

/// Structured validation error for a single charm option
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigValidationError {
    pub field: String,
    pub value: String,
    pub expected: String,
}

impl ConfigValidationError {
    pub fn new(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid value '{}' for {}. {}",
            self.value, self.field, self.expected
        )
    }
}

impl std::error::Error for ConfigValidationError {}

/// Charm options after validation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedConfig {
    pub datacenter: String,
    pub expose_mode: ExposeMode,
    pub serflan_node_port: i32,
}

impl ValidatedConfig {
    /// The Consul port set implied by these options
    pub fn ports(&self) -> PortSet {
        PortSet::resolve(self.expose_mode.is_enabled(), self.serflan_node_port)
    }
}

impl CharmConfig {
    /// Decode the JSON object printed by `config-get`
    pub fn from_json(value: serde_json::Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Validate the options; the first failing field is reported.
    pub fn validate(&self) -> Result<ValidatedConfig, ConfigValidationError> {
        if self.datacenter.trim().is_empty() {
            return Err(ConfigValidationError::new(
                DATACENTER_KEY,
                self.datacenter.clone(),
                "A non-empty datacenter name is required",
            ));
        }

        let expose_mode = ExposeMode::from_str(&self.expose_gossip_and_rpc_ports).map_err(|_| {
            ConfigValidationError::new(
                EXPOSE_KEY,
                self.expose_gossip_and_rpc_ports.clone(),
                format!("Valid values are: {}", ExposeMode::VALID_VALUES.join(", ")),
            )
        })?;

        // The node port only matters when it is actually exposed.
        if expose_mode.is_enabled() && !NODE_PORT_RANGE.contains(&self.serflan_node_port) {
            return Err(ConfigValidationError::new(
                SERFLAN_NODE_PORT_KEY,
                self.serflan_node_port.to_string(),
                format!(
                    "Valid range is {}-{}",
                    NODE_PORT_RANGE.start(),
                    NODE_PORT_RANGE.end()
                ),
            ));
        }

        Ok(ValidatedConfig {
            datacenter: self.datacenter.clone(),
            expose_mode,
            // In range (or unused), so the narrowing cannot truncate a used value.
            serflan_node_port: i32::try_from(self.serflan_node_port)
                .unwrap_or(*NODE_PORT_RANGE.start() as i32),
        })
    }
}
