//! Consul server configuration builder
//!
//! Produces the `server.json` document consumed by `consul agent`. Service
//! mesh, UI, DNS, gRPC and Serf WAN are always disabled; only the core
//! server and LAN failure detection are supported.

use serde::{Deserialize, Serialize};

use super::ports::PortSet;
use crate::error::Result;

/// Directory where Consul keeps its raft and serf state
pub const CONSUL_DATA_DIR: &str = "/consul/data";

/// Directory holding the server's TLS material
pub const CONSUL_CERTS_DIR: &str = "/consul/config/certs";

pub const DEFAULT_CA_CERTIFICATE_PATH: &str = "/consul/config/certs/ca.pem";
pub const DEFAULT_SERVER_CERTIFICATE_PATH: &str = "/consul/config/certs/server-cert.pem";
pub const DEFAULT_SERVER_KEY_PATH: &str = "/consul/config/certs/server-key.pem";

/// Locations of the TLS files referenced by the server configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsPaths {
    pub ca_certificate_path: String,
    pub server_certificate_path: String,
    pub server_key_path: String,
}

impl Default for TlsPaths {
    fn default() -> Self {
        Self {
            ca_certificate_path: DEFAULT_CA_CERTIFICATE_PATH.to_string(),
            server_certificate_path: DEFAULT_SERVER_CERTIFICATE_PATH.to_string(),
            server_key_path: DEFAULT_SERVER_KEY_PATH.to_string(),
        }
    }
}

/// The rendered Consul server configuration.
///
/// Field order is the serialisation order, so two equal values always
/// produce byte-identical JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedConfig {
    pub bind_addr: String,
    pub bootstrap_expect: u32,
    pub client_addr: String,
    pub connect: Toggle,
    pub datacenter: String,
    pub data_dir: String,
    pub ports: ListenerPorts,
    pub retry_join: Vec<String>,
    pub server: bool,
    pub tls: TlsSection,
    pub ui_config: Toggle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toggle {
    pub enabled: bool,
}

/// Listener ports as understood by the `ports` stanza
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerPorts {
    pub dns: i32,
    pub http: i32,
    pub https: i32,
    pub grpc: i32,
    pub grpc_tls: i32,
    pub serf_lan: i32,
    pub serf_wan: i32,
    pub server: i32,
}

impl From<&PortSet> for ListenerPorts {
    fn from(ports: &PortSet) -> Self {
        Self {
            dns: ports.dns,
            http: ports.http,
            https: ports.https,
            grpc: ports.grpc,
            grpc_tls: ports.grpc_tls,
            serf_lan: ports.serf_lan,
            serf_wan: ports.serf_wan,
            server: ports.server,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSection {
    pub defaults: TlsDefaults,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsDefaults {
    pub verify_incoming: bool,
    pub verify_outgoing: bool,
    pub ca_file: String,
    pub cert_file: String,
    pub key_file: String,
}

impl RenderedConfig {
    /// Serialise as the on-disk document (2-space indented JSON)
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Structural comparison against a persisted document.
    ///
    /// Any value that does not decode to the same JSON tree counts as a
    /// difference, including documents written by other tools.
    pub fn matches(&self, persisted: &serde_json::Value) -> bool {
        match serde_json::to_value(self) {
            Ok(rendered) => &rendered == persisted,
            Err(_) => false,
        }
    }
}

/// Builder for the Consul server configuration
#[derive(Debug, Clone)]
pub struct ConsulConfigBuilder {
    ports: PortSet,
    datacenter: String,
    number_of_units: u32,
    retry_join: Vec<String>,
    tls_paths: Option<TlsPaths>,
}

impl ConsulConfigBuilder {
    pub fn new(
        ports: PortSet,
        datacenter: impl Into<String>,
        number_of_units: u32,
        retry_join_addresses: Vec<String>,
    ) -> Self {
        Self {
            ports,
            datacenter: datacenter.into(),
            number_of_units,
            retry_join: retry_join_addresses,
            tls_paths: None,
        }
    }

    /// Override the TLS file locations; the defaults under
    /// `/consul/config/certs` are used otherwise.
    pub fn with_tls(mut self, tls_paths: Option<TlsPaths>) -> Self {
        self.tls_paths = tls_paths;
        self
    }

    pub fn build(&self) -> RenderedConfig {
        let tls = self.tls_paths.clone().unwrap_or_default();

        RenderedConfig {
            bind_addr: "0.0.0.0".to_string(),
            bootstrap_expect: self.number_of_units,
            client_addr: "0.0.0.0".to_string(),
            connect: Toggle { enabled: false },
            datacenter: self.datacenter.clone(),
            data_dir: CONSUL_DATA_DIR.to_string(),
            ports: ListenerPorts::from(&self.ports),
            retry_join: self.retry_join.clone(),
            server: true,
            tls: TlsSection {
                defaults: TlsDefaults {
                    verify_incoming: true,
                    verify_outgoing: true,
                    ca_file: tls.ca_certificate_path,
                    cert_file: tls.server_certificate_path,
                    key_file: tls.server_key_path,
                },
            },
            ui_config: Toggle { enabled: false },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> ConsulConfigBuilder {
        ConsulConfigBuilder::new(
            PortSet::default(),
            "dc1",
            3,
            vec!["consul.model.svc:8301".to_string()],
        )
    }

    #[test]
    fn test_build_is_deterministic() {
        let first = builder().build().to_json_pretty().unwrap();
        let second = builder().build().to_json_pretty().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unsupported_features_are_disabled() {
        let config = builder().build();
        assert!(!config.connect.enabled);
        assert!(!config.ui_config.enabled);
        assert_eq!(config.ports.dns, -1);
        assert_eq!(config.ports.grpc, -1);
        assert_eq!(config.ports.grpc_tls, -1);
        assert_eq!(config.ports.serf_wan, -1);
        assert!(config.server);
    }

    #[test]
    fn test_default_tls_paths() {
        let config = builder().build();
        assert_eq!(config.tls.defaults.ca_file, "/consul/config/certs/ca.pem");
        assert_eq!(
            config.tls.defaults.cert_file,
            "/consul/config/certs/server-cert.pem"
        );
        assert_eq!(
            config.tls.defaults.key_file,
            "/consul/config/certs/server-key.pem"
        );
    }

    #[test]
    fn test_custom_tls_paths() {
        let config = builder()
            .with_tls(Some(TlsPaths {
                ca_certificate_path: "/etc/ca.pem".to_string(),
                server_certificate_path: "/etc/cert.pem".to_string(),
                server_key_path: "/etc/key.pem".to_string(),
            }))
            .build();
        assert_eq!(config.tls.defaults.ca_file, "/etc/ca.pem");
        assert_eq!(config.tls.defaults.key_file, "/etc/key.pem");
    }

    #[test]
    fn test_json_layout_matches_consul_schema() {
        let value = serde_json::to_value(builder().build()).unwrap();
        assert_eq!(value["bootstrap_expect"], 3);
        assert_eq!(value["datacenter"], "dc1");
        assert_eq!(value["data_dir"], "/consul/data");
        assert_eq!(value["ports"]["serf_lan"], 8301);
        assert_eq!(value["retry_join"][0], "consul.model.svc:8301");
        assert_eq!(value["tls"]["defaults"]["verify_incoming"], true);
        assert!(value["ports"].get("sidecar_min_port").is_none());
    }

    #[test]
    fn test_matches_persisted_document() {
        let config = builder().build();
        let persisted: serde_json::Value =
            serde_json::from_str(&config.to_json_pretty().unwrap()).unwrap();
        assert!(config.matches(&persisted));

        let other = ConsulConfigBuilder::new(PortSet::default(), "dc2", 3, vec![]).build();
        assert!(!other.matches(&persisted));
        assert!(!config.matches(&serde_json::json!({})));
    }
}
