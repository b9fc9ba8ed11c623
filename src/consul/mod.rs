//! Consul workload model
//!
//! Pure descriptions of what runs in the workload container: the port set,
//! the server configuration document and the Pebble layer.

pub mod config_builder;
pub mod layer;
pub mod ports;

pub use config_builder::{ConsulConfigBuilder, RenderedConfig, TlsPaths};
pub use layer::{Layer, Plan, CONSUL_CONFIG_PATH, CONSUL_SERVICE_NAME};
pub use ports::PortSet;
