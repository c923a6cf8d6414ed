//! Custom Resource Definitions for the IAM operator
//!
//! This module defines the `ServiceRole` CRD, the namespaced identity
//! abstraction that the operator materializes into a `ServiceAccount`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the ServiceRole CRD
pub const API_GROUP: &str = "iam.craft-conf.com";

/// API version of the ServiceRole CRD
pub const API_VERSION: &str = "v1alpha1";

/// Condition type reporting whether the managed ServiceAccount is in place
pub const CONDITION_READY: &str = "Ready";

/// ServiceRole custom resource definition
///
/// Declares that a workload identity should exist in the namespace. The
/// operator answers with a `ServiceAccount` named `<name>-sa`, labeled as
/// managed and owned by this resource.
///
/// # Example
///
/// ```yaml
/// apiVersion: iam.craft-conf.com/v1alpha1
/// kind: ServiceRole
/// metadata:
///   name: billing
///   namespace: team-a
/// spec: {}
/// ```
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "iam.craft-conf.com",
    version = "v1alpha1",
    kind = "ServiceRole",
    plural = "serviceroles",
    shortname = "sr",
    namespaced,
    status = "ServiceRoleStatus",
    printcolumn = r#"{"name":"ServiceAccount","type":"string","jsonPath":".status.serviceAccountName"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRoleSpec {}

/// Observed state of a ServiceRole
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRoleStatus {
    /// Name of the ServiceAccount bound to this role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Generation of the spec this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ServiceRoleCondition>,
}

impl ServiceRoleStatus {
    /// Look up a condition by type
    pub fn condition(&self, condition_type: &str) -> Option<&ServiceRoleCondition> {
        self.conditions
            .iter()
            .find(|c| c.r#type == condition_type)
    }
}

/// Status condition for a ServiceRole
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRoleCondition {
    /// Condition type (e.g. Ready)
    pub r#type: String,

    /// Status: True, False, or Unknown
    pub status: String,

    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// RFC 3339 time of the last status change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}
