//! # IAM Kubernetes Operator
//!
//! Materializes `ServiceRole` custom resources into Kubernetes
//! `ServiceAccount`s.
//!
//! For every `ServiceRole` the operator guarantees that a `ServiceAccount`
//! named `<role>-sa` exists in the same namespace, carries the management
//! labels, and is owned by the role so that deleting the role deletes the
//! account through Kubernetes garbage collection.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use iam_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, ControllerConfig::default(), Readiness::new()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Watch**: ServiceRoles, and ServiceAccounts owned by them
//! 2. **Reconcile**: read the role and its account from the API server
//! 3. **Act**: create the account, or merge drifted labels back
//! 4. **Status**: record the bound account name and a `Ready` condition
//!
//! The reconcile pass is level-triggered and idempotent: a second pass against
//! an unchanged cluster issues no writes. Accounts that exist under the derived
//! name but are not owned by the role are never modified; the pass fails with
//! a name-collision error instead.
//!
//! ## Custom Resource Definition
//!
//! ```yaml
//! apiVersion: iam.craft-conf.com/v1alpha1
//! kind: ServiceRole
//! metadata:
//!   name: billing
//!   namespace: team-a
//! spec: {}
//! ```
//!
//! yields
//!
//! ```yaml
//! apiVersion: v1
//! kind: ServiceAccount
//! metadata:
//!   name: billing-sa
//!   namespace: team-a
//!   labels:
//!     app.kubernetes.io/managed-by: iam-operator
//!     platform.io/servicerole: billing
//!   ownerReferences:
//!     - apiVersion: iam.craft-conf.com/v1alpha1
//!       kind: ServiceRole
//!       name: billing
//!       controller: true
//!       blockOwnerDeletion: true
//! ```
//!
//! ## Permissions
//!
//! `iam-operator --print-rbac` prints the `ClusterRole` the operator needs,
//! see [`rbac::policy_rules`].
//!
//! ## Metrics
//!
//! - `iam_operator_reconciliations_total` - Total reconciliation attempts
//! - `iam_operator_reconciliation_errors_total` - Reconciliation errors
//! - `iam_operator_reconciliation_duration_seconds` - Reconciliation latency
//! - `iam_operator_service_accounts_created_total` - Accounts created
//! - `iam_operator_service_accounts_updated_total` - Label repairs

pub mod client;
pub mod controller;
pub mod crd;
pub mod error;
pub mod health;
pub mod rbac;
pub mod reconciler;
pub mod service_account;

#[cfg(test)]
mod fake;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::client::{ClusterApi, KubeClusterApi};
    pub use crate::controller::{
        run_controller, ControllerConfig, ControllerContext, ControllerMetrics,
    };
    pub use crate::crd::{ServiceRole, ServiceRoleCondition, ServiceRoleSpec, ServiceRoleStatus};
    pub use crate::error::{ErrorKind, OperatorError, Result};
    pub use crate::health::Readiness;
    pub use crate::reconciler::{ReconcileOutcome, ReconcileRequest, ServiceRoleReconciler};
    pub use crate::service_account::{ensure_service_account, EnsureOutcome};
}
