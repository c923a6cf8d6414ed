//! Cluster permissions of the operator
//!
//! The `ClusterRole` printed by `iam-operator --print-rbac`. Bind it to the
//! operator's ServiceAccount with a `ClusterRoleBinding`.

use crate::crd::API_GROUP;
use crate::service_account::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

/// Name of the generated ClusterRole
pub const CLUSTER_ROLE_NAME: &str = "iam-operator-manager";

fn rule(api_group: &str, resource: &str, verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(vec![resource.to_string()]),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// Rules the controller needs on ServiceRoles and ServiceAccounts
///
/// `serviceroles/finalizers` update is required because managed accounts set
/// `blockOwnerDeletion` on their owner reference; API servers that enforce
/// owner-reference permissions reject the create without it.
pub fn policy_rules() -> Vec<PolicyRule> {
    vec![
        rule(
            API_GROUP,
            "serviceroles",
            &["get", "list", "watch", "create", "update", "patch", "delete"],
        ),
        rule(API_GROUP, "serviceroles/status", &["get", "update", "patch"]),
        rule(API_GROUP, "serviceroles/finalizers", &["update"]),
        rule(
            "",
            "serviceaccounts",
            &["get", "list", "watch", "create", "update", "patch"],
        ),
    ]
}

/// ClusterRole granting [`policy_rules`]
pub fn cluster_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_NAME.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        rules: Some(policy_rules()),
        ..Default::default()
    }
}
