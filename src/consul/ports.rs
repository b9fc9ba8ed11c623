//! Consul service ports
//!
//! Only the HTTP API, Serf LAN gossip and server RPC ports are supported.
//! Every other listener is switched off with a sentinel value: `-1` for
//! single ports and `0` for the sidecar/expose port ranges.

use serde::{Deserialize, Serialize};

/// Sentinel for a disabled single-port listener
pub const PORT_DISABLED: i32 = -1;

/// Sentinel for a disabled port range bound
pub const RANGE_DISABLED: i32 = 0;

pub const DEFAULT_HTTP_PORT: i32 = 8500;
pub const DEFAULT_SERF_LAN_PORT: i32 = 8301;
pub const DEFAULT_SERVER_PORT: i32 = 8300;

/// The full set of Consul ports after resolving configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSet {
    pub dns: i32,
    pub http: i32,
    pub https: i32,
    pub grpc: i32,
    pub grpc_tls: i32,
    pub serf_lan: i32,
    pub serf_wan: i32,
    pub server: i32,
    pub sidecar_min_port: i32,
    pub sidecar_max_port: i32,
    pub expose_min_port: i32,
    pub expose_max_port: i32,
}

impl Default for PortSet {
    fn default() -> Self {
        Self {
            dns: PORT_DISABLED,
            http: DEFAULT_HTTP_PORT,
            https: PORT_DISABLED,
            grpc: PORT_DISABLED,
            grpc_tls: PORT_DISABLED,
            serf_lan: DEFAULT_SERF_LAN_PORT,
            serf_wan: PORT_DISABLED,
            server: DEFAULT_SERVER_PORT,
            sidecar_min_port: RANGE_DISABLED,
            sidecar_max_port: RANGE_DISABLED,
            expose_min_port: RANGE_DISABLED,
            expose_max_port: RANGE_DISABLED,
        }
    }
}

impl PortSet {
    /// Resolve the ports for the current exposure setting.
    ///
    /// When the gossip port is exposed outside the cluster, Consul must
    /// listen on the node port itself so that the advertised address and
    /// the bound port agree.
    pub fn resolve(expose_enabled: bool, serf_lan_node_port: i32) -> Self {
        let mut ports = Self::default();
        if expose_enabled {
            ports.serf_lan = serf_lan_node_port;
        }
        ports
    }
}
