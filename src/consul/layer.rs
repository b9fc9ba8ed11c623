//! Pebble layer describing the supervised Consul process

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Name of the Pebble service (and of the workload container)
pub const CONSUL_SERVICE_NAME: &str = "consul";

/// Path of the rendered server configuration inside the workload
pub const CONSUL_CONFIG_PATH: &str = "/consul/config/server.json";

/// A Pebble layer. Only the fields this operator sets are modelled.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceEntry>,
}

/// One service entry in a layer or plan
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    #[serde(
        rename = "override",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub override_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<String>,
}

/// The subset of `pebble plan` output compared against the layer
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceEntry>,
}

impl Layer {
    /// The layer that runs `consul agent` against the rendered configuration
    pub fn consul() -> Self {
        let mut services = BTreeMap::new();
        services.insert(
            CONSUL_SERVICE_NAME.to_string(),
            ServiceEntry {
                override_: Some("replace".to_string()),
                summary: Some("consul".to_string()),
                command: Some(format!("consul agent -config-file {}", CONSUL_CONFIG_PATH)),
                startup: Some("enabled".to_string()),
            },
        );

        Self {
            summary: Some("consul layer".to_string()),
            description: Some("pebble config layer for the consul".to_string()),
            services,
        }
    }

    /// Render as the YAML document accepted by `pebble add`
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Whether the active plan already runs exactly these services
    pub fn is_applied(&self, plan: &Plan) -> bool {
        plan.services == self.services
    }
}

impl Plan {
    /// Parse `pebble plan` output
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }
}
