//! consul-k8s-operator: runs and configures a Consul server on Kubernetes
//!
//! The binary is invoked once per Juju hook. It maps the hook to a
//! trigger, reconciles the Consul workload through Pebble, manages the
//! exposure Service and publishes cluster endpoints to related
//! applications.

pub mod config;
pub mod consul;
pub mod controller;
pub mod error;
pub mod platform;
pub mod relation;

pub use crate::error::{Error, Result};
