//! Hook dispatch
//!
//! Each hook invocation is mapped to a [`Trigger`] and handled by plain
//! function calls. Triggers whose preconditions are not met yet are
//! persisted and replayed, in order, ahead of the next invocation.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::certificates::{CertificateLifecycle, Outcome};
use super::context::ControllerState;
use super::exposure::ServiceExposer;
use super::reconciler::{PublishTarget, ReconcileLoop};
use crate::error::{Error, Result};
use crate::platform::RelationId;
use crate::relation::{CERTIFICATES_RELATION, CLUSTER_RELATION};

pub const DEFERRED_FILE: &str = "deferred.json";

/// What caused this invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    Install,
    WorkloadReady,
    ConfigChanged,
    UpgradeCharm,
    UpdateStatus,
    LeaderElected,
    /// A requirer joined or changed on `consul-cluster`
    ClusterRelationChanged { relation: RelationId },
    CertificatesRelationCreated,
    CertificatesRelationChanged,
    CertificatesRelationBroken,
    Remove,
    Unknown(String),
}

impl Trigger {
    /// Map a hook name and optional `JUJU_RELATION_ID` to a trigger
    pub fn from_hook(hook: &str, relation_id: Option<&str>) -> Result<Self> {
        let cluster_prefix = format!("{CLUSTER_RELATION}-relation-");
        let certificates_prefix = format!("{CERTIFICATES_RELATION}-relation-");

        Ok(match hook {
            "install" => Trigger::Install,
            "consul-pebble-ready" => Trigger::WorkloadReady,
            "config-changed" => Trigger::ConfigChanged,
            "upgrade-charm" => Trigger::UpgradeCharm,
            "update-status" => Trigger::UpdateStatus,
            "leader-elected" => Trigger::LeaderElected,
            "remove" => Trigger::Remove,
            h if h.starts_with(&cluster_prefix) => match &h[cluster_prefix.len()..] {
                "joined" | "changed" => {
                    let raw = relation_id.ok_or_else(|| {
                        Error::ConfigError(format!("{h} requires JUJU_RELATION_ID"))
                    })?;
                    Trigger::ClusterRelationChanged {
                        relation: raw.parse()?,
                    }
                }
                _ => Trigger::Unknown(h.to_string()),
            },
            h if h.starts_with(&certificates_prefix) => match &h[certificates_prefix.len()..] {
                "created" => Trigger::CertificatesRelationCreated,
                "changed" => Trigger::CertificatesRelationChanged,
                "broken" => Trigger::CertificatesRelationBroken,
                _ => Trigger::Unknown(h.to_string()),
            },
            other => Trigger::Unknown(other.to_string()),
        })
    }

    /// Map `JUJU_DISPATCH_PATH` (e.g. `hooks/install`) to a trigger
    pub fn from_dispatch_path(path: &str, relation_id: Option<&str>) -> Result<Self> {
        let hook = path.rsplit('/').next().unwrap_or(path);
        Self::from_hook(hook, relation_id)
    }

    /// The hook name this trigger is replayed as
    pub fn hook_name(&self) -> String {
        match self {
            Trigger::Install => "install".to_string(),
            Trigger::WorkloadReady => "consul-pebble-ready".to_string(),
            Trigger::ConfigChanged => "config-changed".to_string(),
            Trigger::UpgradeCharm => "upgrade-charm".to_string(),
            Trigger::UpdateStatus => "update-status".to_string(),
            Trigger::LeaderElected => "leader-elected".to_string(),
            Trigger::ClusterRelationChanged { .. } => {
                format!("{CLUSTER_RELATION}-relation-changed")
            }
            Trigger::CertificatesRelationCreated => {
                format!("{CERTIFICATES_RELATION}-relation-created")
            }
            Trigger::CertificatesRelationChanged => {
                format!("{CERTIFICATES_RELATION}-relation-changed")
            }
            Trigger::CertificatesRelationBroken => {
                format!("{CERTIFICATES_RELATION}-relation-broken")
            }
            Trigger::Remove => "remove".to_string(),
            Trigger::Unknown(hook) => hook.clone(),
        }
    }

    fn relation(&self) -> Option<&RelationId> {
        match self {
            Trigger::ClusterRelationChanged { relation } => Some(relation),
            _ => None,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relation() {
            Some(relation) => write!(f, "{} ({})", self.hook_name(), relation),
            None => f.write_str(&self.hook_name()),
        }
    }
}

/// On-disk form of a deferred trigger
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct DeferredEntry {
    hook: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    relation_id: Option<String>,
}

impl From<&Trigger> for DeferredEntry {
    fn from(trigger: &Trigger) -> Self {
        Self {
            hook: trigger.hook_name(),
            relation_id: trigger.relation().map(ToString::to_string),
        }
    }
}

/// Deferred triggers persisted across hook invocations
pub struct DeferredStore {
    path: PathBuf,
}

impl DeferredStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(DEFERRED_FILE),
        }
    }

    /// Load the queue; a missing or unreadable file is an empty queue
    pub async fn load(&self) -> Result<Vec<Trigger>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let entries: Vec<DeferredEntry> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Discarding unreadable deferred queue {}: {}", self.path.display(), e);
                return Ok(Vec::new());
            }
        };

        let mut triggers = Vec::with_capacity(entries.len());
        for entry in entries {
            match Trigger::from_hook(&entry.hook, entry.relation_id.as_deref()) {
                Ok(trigger) => triggers.push(trigger),
                Err(e) => warn!("Dropping deferred {}: {}", entry.hook, e),
            }
        }
        Ok(triggers)
    }

    pub async fn save(&self, triggers: &[Trigger]) -> Result<()> {
        if triggers.is_empty() {
            return match tokio::fs::remove_file(&self.path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let entries: Vec<DeferredEntry> = triggers.iter().map(DeferredEntry::from).collect();
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(&entries)?).await?;
        Ok(())
    }
}

pub struct Dispatcher<'a> {
    state: &'a ControllerState,
    store: DeferredStore,
}

impl<'a> Dispatcher<'a> {
    pub fn new(state: &'a ControllerState, store: DeferredStore) -> Self {
        Self { state, store }
    }

    /// Replay deferred triggers, then handle `trigger`.
    ///
    /// A retriable error defers the trigger instead of failing the hook.
    #[instrument(
        skip(self, trigger),
        fields(unit = %self.state.identity.unit_name, trigger = %trigger)
    )]
    pub async fn dispatch(&self, trigger: Trigger) -> Result<Outcome> {
        let mut pending = Vec::new();
        for deferred in self.store.load().await? {
            if deferred == trigger || pending.contains(&deferred) {
                continue;
            }
            debug!("Replaying deferred {}", deferred);
            match self.handle(&deferred).await {
                Ok(Outcome::Done) => info!("Deferred {} completed", deferred),
                Ok(Outcome::Deferred) => pending.push(deferred),
                Err(e) => {
                    warn!("Deferred {} failed again: {}", deferred, e);
                    pending.push(deferred);
                }
            }
        }

        let result = match self.handle(&trigger).await {
            Err(e) if e.is_retriable() => {
                warn!("Deferring {} after retriable error: {}", trigger, e);
                Ok(Outcome::Deferred)
            }
            other => other,
        };
        if matches!(result, Ok(Outcome::Deferred)) {
            pending.push(trigger);
        }

        self.store.save(&pending).await?;
        result
    }

    async fn handle(&self, trigger: &Trigger) -> Result<Outcome> {
        let certificates = CertificateLifecycle::new(self.state);
        match trigger {
            Trigger::Install => certificates.on_install().await,
            Trigger::WorkloadReady
            | Trigger::ConfigChanged
            | Trigger::UpgradeCharm
            | Trigger::LeaderElected => self.reconcile(PublishTarget::All).await,
            Trigger::ClusterRelationChanged { relation } => {
                self.reconcile(PublishTarget::Relation(relation.clone()))
                    .await
            }
            Trigger::UpdateStatus => {
                // Also republishes endpoints once a load balancer IP shows up.
                self.reconcile(PublishTarget::All).await?;
                certificates.check_expiry().await?;
                Ok(Outcome::Done)
            }
            Trigger::CertificatesRelationCreated => certificates.on_relation_created().await,
            Trigger::CertificatesRelationChanged => certificates.on_relation_changed().await,
            Trigger::CertificatesRelationBroken => {
                certificates.on_all_invalidated().await?;
                Ok(Outcome::Done)
            }
            Trigger::Remove => {
                ServiceExposer::new(self.state).remove().await?;
                Ok(Outcome::Done)
            }
            Trigger::Unknown(hook) => {
                debug!("No handler for {}", hook);
                Ok(Outcome::Done)
            }
        }
    }

    async fn reconcile(&self, target: PublishTarget) -> Result<Outcome> {
        ReconcileLoop::new(self.state).run(target).await?;
        Ok(Outcome::Done)
    }
}
