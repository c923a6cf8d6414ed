//! Cluster API seam
//!
//! The reconciler talks to the Kubernetes API through [`ClusterApi`], a narrow
//! capability covering exactly the calls it makes. [`KubeClusterApi`] is the
//! production implementation over `kube::Client`; tests substitute an
//! in-memory cluster.
//!
//! Methods return raw `kube::Error`s. Callers wrap them with the operation
//! context they were performing.

use crate::crd::{ServiceRole, ServiceRoleStatus};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

/// Field manager recorded on every write the operator makes
pub const FIELD_MANAGER: &str = "iam-operator";

/// Kubernetes operations needed to reconcile a ServiceRole
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Get a ServiceRole, `None` if it does not exist
    async fn get_service_role(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceRole>, kube::Error>;

    /// Get a ServiceAccount, `None` if it does not exist
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, kube::Error>;

    /// Create a ServiceAccount; fails with 409 if the name is taken
    async fn create_service_account(
        &self,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, kube::Error>;

    /// Replace a ServiceAccount; fails with 409 if its resourceVersion is stale
    async fn update_service_account(
        &self,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, kube::Error>;

    /// Write the status subresource of a ServiceRole
    async fn patch_service_role_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ServiceRoleStatus,
    ) -> Result<(), kube::Error>;
}

/// [`ClusterApi`] backed by a live API server
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }
}

/// Build the merge patch for a status write
///
/// Unset fields are sent as explicit nulls so a merge patch clears values
/// left over from an earlier reconcile.
pub fn status_patch(status: &ServiceRoleStatus) -> serde_json::Value {
    serde_json::json!({
        "status": {
            "serviceAccountName": status.service_account_name,
            "observedGeneration": status.observed_generation,
            "conditions": status.conditions,
        }
    })
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_service_role(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceRole>, kube::Error> {
        let api: Api<ServiceRole> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, kube::Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await
    }

    async fn create_service_account(
        &self,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, kube::Error> {
        let namespace = account.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.create(&Self::post_params(), account).await
    }

    async fn update_service_account(
        &self,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, kube::Error> {
        let namespace = account.metadata.namespace.as_deref().unwrap_or("default");
        let name = account.metadata.name.as_deref().unwrap_or_default();
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &Self::post_params(), account).await
    }

    async fn patch_service_role_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ServiceRoleStatus,
    ) -> Result<(), kube::Error> {
        let api: Api<ServiceRole> = Api::namespaced(self.client.clone(), namespace);

        debug!(name = %name, namespace = %namespace, "Updating ServiceRole status");

        let patch_params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        api.patch_status(name, &patch_params, &Patch::Merge(&status_patch(status)))
            .await?;

        Ok(())
    }
}
