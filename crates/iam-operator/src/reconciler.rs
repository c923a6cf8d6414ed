//! ServiceRole reconciler
//!
//! One pass of the control loop for one `{namespace, name}` key. The pass is
//! level-triggered: it reads the ServiceRole and its ServiceAccount from the
//! API every time and never looks at what event caused it to run. Running it
//! again against an unchanged cluster writes nothing.

use crate::client::ClusterApi;
use crate::crd::{ServiceRole, ServiceRoleCondition, ServiceRoleStatus, CONDITION_READY};
use crate::error::{is_not_found, OperatorError, Result};
use crate::service_account::{ensure_service_account, service_account_name, EnsureOutcome};
use chrono::Utc;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Reason on the Ready condition when the account is in place
pub const REASON_READY: &str = "ServiceAccountReady";

/// Reason on the Ready condition when the account name is taken
pub const REASON_CONFLICT: &str = "ServiceAccountConflict";

/// Identifies the ServiceRole a reconcile pass is for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReconcileRequest {
    pub namespace: String,
    pub name: String,
}

impl ReconcileRequest {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a watched object; `None` for objects without a namespace
    pub fn from_object_ref(obj: &ObjectRef<ServiceRole>) -> Option<Self> {
        obj.namespace
            .as_ref()
            .map(|ns| Self::new(ns.clone(), obj.name.clone()))
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Result of a successful reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The ServiceRole no longer exists; garbage collection owns the cleanup
    RoleGone,
    /// The ServiceAccount is in place
    Ensured {
        account: EnsureOutcome,
        status_written: bool,
    },
}

/// Reconciles ServiceRoles into ServiceAccounts through a [`ClusterApi`]
pub struct ServiceRoleReconciler<C: ?Sized> {
    api: Arc<C>,
}

impl<C: ?Sized> Clone for ServiceRoleReconciler<C> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
        }
    }
}

impl<C> ServiceRoleReconciler<C>
where
    C: ClusterApi + ?Sized,
{
    pub fn new(api: Arc<C>) -> Self {
        Self { api }
    }

    /// Run one reconcile pass for `request`
    #[instrument(skip(self), fields(namespace = %request.namespace, name = %request.name))]
    pub async fn reconcile(&self, request: &ReconcileRequest) -> Result<ReconcileOutcome> {
        let role = match self
            .api
            .get_service_role(&request.namespace, &request.name)
            .await
        {
            Ok(Some(role)) => role,
            Ok(None) => {
                debug!("ServiceRole not found, nothing to do");
                return Ok(ReconcileOutcome::RoleGone);
            }
            Err(source) => {
                return Err(OperatorError::ServiceRole {
                    namespace: request.namespace.clone(),
                    name: request.name.clone(),
                    source,
                });
            }
        };

        let account_name = service_account_name(&role.name_any());

        match ensure_service_account(&*self.api, &role, &account_name).await {
            Ok(account) => {
                let status = build_ready_status(&role, &account_name);
                let status_written = self.write_status(&role, status).await?;
                Ok(ReconcileOutcome::Ensured {
                    account,
                    status_written,
                })
            }
            Err(err @ OperatorError::NameCollision { .. }) => {
                let status = build_conflict_status(&role, &err.to_string());
                if let Err(status_err) = self.write_status(&role, status).await {
                    warn!(error = %status_err, "Failed to record collision on ServiceRole status");
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Patch the status subresource when `desired` differs from what the role carries
    async fn write_status(&self, role: &ServiceRole, desired: ServiceRoleStatus) -> Result<bool> {
        if role.status.as_ref() == Some(&desired) {
            return Ok(false);
        }

        let namespace = role.namespace().unwrap_or_default();
        let name = role.name_any();
        match self
            .api
            .patch_service_role_status(&namespace, &name, &desired)
            .await
        {
            Ok(()) => {
                info!(
                    service_account = desired.service_account_name.as_deref().unwrap_or(""),
                    "Updated ServiceRole status"
                );
                Ok(true)
            }
            Err(e) if is_not_found(&e) => {
                debug!("ServiceRole deleted before its status could be written");
                Ok(false)
            }
            Err(source) => Err(OperatorError::Status {
                namespace,
                name,
                source,
            }),
        }
    }
}

/// Build a condition, keeping the previous transition time while the status holds
fn build_condition(
    previous: Option<&ServiceRoleStatus>,
    condition_type: &str,
    status: &str,
    reason: &str,
    message: String,
) -> ServiceRoleCondition {
    let last_transition_time = previous
        .and_then(|s| s.condition(condition_type))
        .filter(|c| c.status == status)
        .and_then(|c| c.last_transition_time.clone())
        .or_else(|| Some(Utc::now().to_rfc3339()));

    ServiceRoleCondition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time,
    }
}

/// Status of a role whose account is in place
fn build_ready_status(role: &ServiceRole, account_name: &str) -> ServiceRoleStatus {
    ServiceRoleStatus {
        service_account_name: Some(account_name.to_string()),
        observed_generation: role.metadata.generation,
        conditions: vec![build_condition(
            role.status.as_ref(),
            CONDITION_READY,
            "True",
            REASON_READY,
            format!("ServiceAccount {} is ready", account_name),
        )],
    }
}

/// Status of a role whose account name is held by a foreign account
fn build_conflict_status(role: &ServiceRole, message: &str) -> ServiceRoleStatus {
    ServiceRoleStatus {
        service_account_name: None,
        observed_generation: role.metadata.generation,
        conditions: vec![build_condition(
            role.status.as_ref(),
            CONDITION_READY,
            "False",
            REASON_CONFLICT,
            message.to_string(),
        )],
    }
}
