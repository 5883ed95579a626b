use std::fmt::Display;

use async_trait::async_trait;
use gml_core::{ClusterClient, GmlError, ResourceRef};
use kube::{
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams},
    core::GroupVersionKind,
    discovery::{self, Scope},
    Client,
};
use serde_yaml::Value;
use tracing::debug;

/// Applies manifests to a live cluster with server-side apply.
pub struct KubeCluster {
    client: Client,
    namespace: String,
    field_manager: String,
}

impl KubeCluster {
    /// Connect with the ambient kubeconfig or in-cluster credentials.
    pub async fn connect(namespace: Option<&str>, field_manager: &str) -> Result<Self, kube::Error> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace, field_manager))
    }

    pub fn new(client: Client, namespace: Option<&str>, field_manager: &str) -> Self {
        let namespace = namespace
            .map(str::to_string)
            .unwrap_or_else(|| client.default_namespace().to_string());
        KubeCluster {
            client,
            namespace,
            field_manager: field_manager.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Resolve the API for a kind. Namespaced kinds fall back to the
    /// cluster's namespace; the namespace used is returned with the API.
    async fn api_for(
        &self,
        resource: &ResourceRef,
    ) -> Result<(Api<DynamicObject>, Option<String>), kube::Error> {
        let gvk = group_version_kind(&resource.api_version, &resource.kind);
        let (api_resource, capabilities) = discovery::pinned_kind(&self.client, &gvk).await?;
        match capabilities.scope {
            Scope::Namespaced => {
                let namespace = resource
                    .namespace
                    .clone()
                    .unwrap_or_else(|| self.namespace.clone());
                let api = Api::namespaced_with(self.client.clone(), &namespace, &api_resource);
                Ok((api, Some(namespace)))
            }
            Scope::Cluster => Ok((Api::all_with(self.client.clone(), &api_resource), None)),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn apply(&self, document: &Value) -> gml_core::Result<ResourceRef> {
        let declared = declared_identity(document)?;
        let object: DynamicObject =
            serde_yaml::from_value(document.clone()).map_err(|e| apply_failed(&declared, e))?;

        let (api, namespace) = self
            .api_for(&declared)
            .await
            .map_err(|e| apply_failed(&declared, e))?;
        let params = PatchParams::apply(&self.field_manager).force();
        api.patch(&declared.name, &params, &Patch::Apply(&object))
            .await
            .map_err(|e| apply_failed(&declared, e))?;

        let applied = ResourceRef {
            namespace,
            ..declared
        };
        debug!(resource = %applied, "server-side applied");
        Ok(applied)
    }

    async fn delete(&self, resource: &ResourceRef) -> gml_core::Result<()> {
        let (api, _) = self
            .api_for(resource)
            .await
            .map_err(|e| delete_failed(resource, e))?;
        match api.delete(&resource.name, &DeleteParams::background()).await {
            Ok(_) => {
                debug!(resource = %resource, "deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(resource = %resource, "already gone");
                Ok(())
            }
            Err(e) => Err(delete_failed(resource, e)),
        }
    }
}

fn group_version_kind(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

/// The identity a document declares. A document without one is rejected as
/// an apply failure, like any other document the cluster would refuse.
fn declared_identity(document: &Value) -> gml_core::Result<ResourceRef> {
    ResourceRef::from_document(document).map_err(|e| GmlError::Apply {
        resource: ResourceRef::new("", "", "", None),
        cause: e.to_string(),
    })
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

fn apply_failed(resource: &ResourceRef, cause: impl Display) -> GmlError {
    GmlError::Apply {
        resource: resource.clone(),
        cause: cause.to_string(),
    }
}

fn delete_failed(resource: &ResourceRef, cause: impl Display) -> GmlError {
    GmlError::Rollback {
        resource: resource.clone(),
        cause: cause.to_string(),
    }
}
