//! [`ClusterApi`] backed by kube-rs
//!
//! The client is created on first use so that hooks which never touch the
//! Kubernetes API (most certificate hooks) do not need in-cluster
//! credentials.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    Client,
};
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

use super::ClusterApi;
use crate::error::{Error, Result};

pub struct KubeClusterApi {
    namespace: String,
    client: OnceCell<Client>,
}

impl KubeClusterApi {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<Client> {
        let client = self
            .client
            .get_or_try_init(|| async { Client::try_default().await.map_err(Error::KubeError) })
            .await?;
        Ok(client.clone())
    }

    async fn services(&self) -> Result<Api<Service>> {
        Ok(Api::namespaced(self.client().await?, &self.namespace))
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client().await?, &self.namespace);
        let pods = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(pods.items)
    }

    async fn get_service(&self, name: &str) -> Result<Option<Service>> {
        Ok(self.services().await?.get_opt(name).await?)
    }

    #[instrument(skip(self, service), fields(namespace = %self.namespace))]
    async fn apply_service(&self, service: &Service, field_manager: &str) -> Result<()> {
        let name = service
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::ConfigError("Service has no name".to_string()))?;

        let patch = Patch::Apply(service);
        self.services()
            .await?
            .patch(&name, &PatchParams::apply(field_manager).force(), &patch)
            .await?;

        info!("Applied Service {}/{}", self.namespace, name);
        Ok(())
    }

    #[instrument(skip(self), fields(namespace = %self.namespace))]
    async fn delete_service(&self, name: &str) -> Result<bool> {
        match self
            .services()
            .await?
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!("Deleted Service {}", name);
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                warn!("Service {} not found", name);
                Ok(false)
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}
