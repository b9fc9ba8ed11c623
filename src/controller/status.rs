//! Status surface shared by all handlers

use tracing::{info, warn};

use super::context::ControllerState;
use crate::error::Result;
use crate::platform::{Status, StatusLevel};

pub const MSG_WAITING_FOR_PEBBLE: &str = "Waiting for Pebble ready";
pub const MSG_WAITING_FOR_RELATION: &str = "Waiting for peer relation to be created";
pub const MSG_WAITING_FOR_CERTIFICATE: &str = "Waiting for new certificate";
pub const MSG_CONFIGURING: &str = "Configuring Consul";

/// Message for a failed workload restart
pub fn restart_failed_message(err: &impl std::fmt::Display) -> String {
    format!("Failed to restart Consul: {err}")
}

/// Where a reconcile cycle ended up
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    WaitingForWorkload,
    Configuring,
    Active,
    Blocked(String),
}

impl Phase {
    pub fn status(&self) -> Status {
        match self {
            Phase::WaitingForWorkload => Status::waiting(MSG_WAITING_FOR_PEBBLE),
            Phase::Configuring => Status::maintenance(MSG_CONFIGURING),
            Phase::Active => Status::active(),
            Phase::Blocked(message) => Status::blocked(message.clone()),
        }
    }
}

/// Set the unit status and, on the leader, the application status
pub async fn update_status(state: &ControllerState, status: &Status) -> Result<()> {
    log_status(status);
    if state.model.is_leader().await? {
        state.model.set_app_status(status).await?;
    }
    state.model.set_unit_status(status).await
}

/// Set only the unit status
pub async fn update_unit_status(state: &ControllerState, status: &Status) -> Result<()> {
    log_status(status);
    state.model.set_unit_status(status).await
}

fn log_status(status: &Status) {
    match status.level {
        StatusLevel::Blocked => warn!("Status blocked: {}", status.message),
        _ => info!("Status {}: {}", status.level, status.message),
    }
}
