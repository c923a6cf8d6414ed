//! ServiceAccount projection
//!
//! Derives the desired `ServiceAccount` for a `ServiceRole` and converges the
//! cluster onto it: create when absent, merge the managed labels when they
//! drifted, leave alone when correct. Accounts that the role does not own
//! are never written.

use crate::client::ClusterApi;
use crate::crd::ServiceRole;
use crate::error::{is_conflict, OperatorError, Result};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

/// Label advertising which controller manages the account
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on managed accounts
pub const MANAGED_BY_VALUE: &str = "iam-operator";

/// Label naming the ServiceRole an account was derived from
pub const SERVICE_ROLE_LABEL: &str = "platform.io/servicerole";

/// Suffix appended to the role name to form the account name
pub const SERVICE_ACCOUNT_SUFFIX: &str = "-sa";

/// Longest value the API server accepts for a label
pub const MAX_LABEL_VALUE_LEN: usize = 63;

/// What [`ensure_service_account`] did to the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The account was absent and has been created
    Created,
    /// The account existed with stale labels and has been updated
    Updated,
    /// The account already matched; nothing was written
    Unchanged,
    /// Create lost a race to a concurrent writer that produced an account owned by this role
    AlreadyCreated,
}

impl EnsureOutcome {
    /// Whether the cluster was written to
    pub fn wrote(self) -> bool {
        matches!(self, EnsureOutcome::Created | EnsureOutcome::Updated)
    }
}

/// Name of the account derived from a role name
pub fn service_account_name(role_name: &str) -> String {
    format!("{}{}", role_name, SERVICE_ACCOUNT_SUFFIX)
}

/// The label set every managed account carries
pub fn managed_labels(role_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (SERVICE_ROLE_LABEL.to_string(), role_name.to_string()),
    ])
}

/// Whether the API server accepts `value` as a label value
///
/// Object names may be up to 253 characters, label values only 63, so a long
/// role name cannot be carried in [`SERVICE_ROLE_LABEL`].
pub fn is_valid_label_value(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    value.len() <= MAX_LABEL_VALUE_LEN
        && value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value.ends_with(|c: char| c.is_ascii_alphanumeric())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Build the account the cluster should hold for `role`
///
/// The account lives in the role's namespace, carries the managed labels and a
/// controller reference to the role with `blockOwnerDeletion` set, so that
/// garbage collection removes it together with the role.
pub fn desired_service_account(role: &ServiceRole, name: &str) -> Result<ServiceAccount> {
    let namespace = role
        .namespace()
        .ok_or(OperatorError::MissingField("metadata.namespace"))?;
    let role_name = role
        .meta()
        .name
        .clone()
        .ok_or(OperatorError::MissingField("metadata.name"))?;
    if !is_valid_label_value(&role_name) {
        return Err(OperatorError::InvalidLabelValue {
            key: SERVICE_ROLE_LABEL,
            value: role_name,
        });
    }
    let owner = role
        .controller_owner_ref(&())
        .ok_or(OperatorError::MissingField("metadata.uid"))?;

    Ok(ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace),
            labels: Some(managed_labels(&role_name)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        ..Default::default()
    })
}

/// Whether `account` carries an owner reference to `role`
///
/// Ownership is decided by uid: a role recreated under the same name does
/// not own accounts left behind by its predecessor.
pub fn is_owned_by(account: &ServiceAccount, role: &ServiceRole) -> bool {
    let Some(uid) = role.meta().uid.as_deref() else {
        return false;
    };
    account
        .owner_references()
        .iter()
        .any(|owner| owner.uid == uid)
}

/// Merge `desired` into `existing`, overwriting managed keys only
///
/// Returns `true` when `existing` changed. Keys not present in `desired` are
/// kept as they are.
pub fn merge_managed_labels(
    existing: &mut BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> bool {
    let mut changed = false;
    for (key, value) in desired {
        if existing.get(key) != Some(value) {
            existing.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

fn collision(role: &ServiceRole, account: &ServiceAccount) -> OperatorError {
    let namespace = account.namespace().unwrap_or_default();
    let name = account.name_any();
    let owners: Vec<String> = account
        .owner_references()
        .iter()
        .map(|o| format!("{}/{}", o.kind, o.name))
        .collect();

    warn!(
        namespace = %namespace,
        service_account = %name,
        service_role = %role.name_any(),
        owners = ?owners,
        "ServiceAccount exists but is not owned by this ServiceRole; leaving it untouched"
    );

    OperatorError::NameCollision {
        namespace,
        name,
        role: role.name_any(),
    }
}

fn account_error(
    op: &'static str,
    namespace: &str,
    name: &str,
    source: kube::Error,
) -> OperatorError {
    OperatorError::ServiceAccount {
        op,
        namespace: namespace.to_string(),
        name: name.to_string(),
        source,
    }
}

/// Make the cluster hold a correctly labeled account `name` owned by `role`
#[instrument(skip(api, role), fields(service_role = %role.name_any()))]
pub async fn ensure_service_account<C>(
    api: &C,
    role: &ServiceRole,
    name: &str,
) -> Result<EnsureOutcome>
where
    C: ClusterApi + ?Sized,
{
    let desired = desired_service_account(role, name)?;
    let namespace = desired.metadata.namespace.clone().unwrap_or_default();

    let existing = api
        .get_service_account(&namespace, name)
        .await
        .map_err(|e| account_error("get", &namespace, name, e))?;

    let Some(mut existing) = existing else {
        return create_service_account(api, role, &desired, &namespace, name).await;
    };

    if !is_owned_by(&existing, role) {
        return Err(collision(role, &existing));
    }

    let desired_labels = desired.metadata.labels.unwrap_or_default();
    let labels = existing.metadata.labels.get_or_insert_with(BTreeMap::new);
    if !merge_managed_labels(labels, &desired_labels) {
        debug!(namespace = %namespace, service_account = %name, "ServiceAccount up to date");
        return Ok(EnsureOutcome::Unchanged);
    }

    api.update_service_account(&existing)
        .await
        .map_err(|e| account_error("update", &namespace, name, e))?;

    info!(namespace = %namespace, service_account = %name, "Updated ServiceAccount labels");
    Ok(EnsureOutcome::Updated)
}

async fn create_service_account<C>(
    api: &C,
    role: &ServiceRole,
    desired: &ServiceAccount,
    namespace: &str,
    name: &str,
) -> Result<EnsureOutcome>
where
    C: ClusterApi + ?Sized,
{
    match api.create_service_account(desired).await {
        Ok(_) => {
            info!(namespace = %namespace, service_account = %name, "Created ServiceAccount");
            Ok(EnsureOutcome::Created)
        }
        Err(e) if is_conflict(&e) => {
            // Someone else created it between our get and create
            let winner = api
                .get_service_account(namespace, name)
                .await
                .map_err(|e| account_error("get", namespace, name, e))?;
            match winner {
                Some(account) if is_owned_by(&account, role) => {
                    debug!(
                        namespace = %namespace,
                        service_account = %name,
                        "ServiceAccount created concurrently by this ServiceRole"
                    );
                    Ok(EnsureOutcome::AlreadyCreated)
                }
                Some(account) => Err(collision(role, &account)),
                None => Err(account_error("create", namespace, name, e)),
            }
        }
        Err(e) => Err(account_error("create", namespace, name, e)),
    }
}
