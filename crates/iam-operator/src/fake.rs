//! In-memory cluster for tests
//!
//! Implements [`ClusterApi`] over maps guarded by a mutex. It records every
//! call, enforces optimistic concurrency on resource versions, can inject
//! one-shot failures and create races, and simulates owner-reference garbage
//! collection when a ServiceRole is deleted.

use crate::client::ClusterApi;
use crate::crd::{ServiceRole, ServiceRoleSpec, ServiceRoleStatus};
use crate::error::api_error;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

type Key = (String, String);

/// A call made through [`ClusterApi`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApiCall {
    GetServiceRole,
    GetServiceAccount,
    CreateServiceAccount,
    UpdateServiceAccount,
    PatchServiceRoleStatus,
}

impl ApiCall {
    fn is_write(self) -> bool {
        matches!(
            self,
            ApiCall::CreateServiceAccount
                | ApiCall::UpdateServiceAccount
                | ApiCall::PatchServiceRoleStatus
        )
    }
}

#[derive(Default)]
struct State {
    roles: BTreeMap<Key, ServiceRole>,
    accounts: BTreeMap<Key, ServiceAccount>,
    calls: Vec<ApiCall>,
    failures: Vec<(ApiCall, kube::Error)>,
    race: Option<ServiceAccount>,
    resource_version: u64,
    uid_seq: u64,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn record(&mut self, call: ApiCall) -> Result<(), kube::Error> {
        self.calls.push(call);
        match self.failures.iter().position(|(c, _)| *c == call) {
            Some(index) => Err(self.failures.remove(index).1),
            None => Ok(()),
        }
    }

    fn collect_garbage(&mut self) {
        let live: HashSet<String> = self
            .roles
            .values()
            .filter_map(|r| r.metadata.uid.clone())
            .collect();
        self.accounts.retain(|_, sa| match &sa.metadata.owner_references {
            Some(owners) if !owners.is_empty() => owners.iter().any(|o| live.contains(&o.uid)),
            _ => true,
        });
    }
}

fn key_of(account: &ServiceAccount) -> Key {
    (
        account.metadata.namespace.clone().unwrap_or_default(),
        account.metadata.name.clone().unwrap_or_default(),
    )
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// Recording in-memory cluster
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Create a ServiceRole, or bump the generation of an existing one
    pub(crate) fn apply_role(&self, namespace: &str, name: &str) -> ServiceRole {
        let mut state = self.state.lock();
        let rv = state.next_resource_version();
        if let Some(existing) = state.roles.get_mut(&key(namespace, name)) {
            existing.metadata.generation = existing.metadata.generation.map(|g| g + 1);
            existing.metadata.resource_version = Some(rv);
            return existing.clone();
        }

        state.uid_seq += 1;
        let mut role = ServiceRole::new(name, ServiceRoleSpec {});
        role.metadata.namespace = Some(namespace.to_string());
        role.metadata.uid = Some(format!("uid-{}", state.uid_seq));
        role.metadata.generation = Some(1);
        role.metadata.resource_version = Some(rv);
        state.roles.insert(key(namespace, name), role.clone());
        role
    }

    /// Delete a ServiceRole and run the garbage collector
    pub(crate) fn delete_role(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock();
        state.roles.remove(&key(namespace, name));
        state.collect_garbage();
    }

    pub(crate) fn role(&self, namespace: &str, name: &str) -> Option<ServiceRole> {
        self.state.lock().roles.get(&key(namespace, name)).cloned()
    }

    /// Store an account as a third party would, bypassing the API
    pub(crate) fn insert_service_account(&self, mut account: ServiceAccount) {
        let mut state = self.state.lock();
        account.metadata.resource_version = Some(state.next_resource_version());
        state.accounts.insert(key_of(&account), account);
    }

    pub(crate) fn service_account(&self, namespace: &str, name: &str) -> Option<ServiceAccount> {
        self.state
            .lock()
            .accounts
            .get(&key(namespace, name))
            .cloned()
    }

    pub(crate) fn service_account_count(&self) -> usize {
        self.state.lock().accounts.len()
    }

    /// Edit a label as a third party would
    pub(crate) fn set_service_account_label(
        &self,
        namespace: &str,
        name: &str,
        label: &str,
        value: &str,
    ) {
        let mut state = self.state.lock();
        let rv = state.next_resource_version();
        if let Some(account) = state.accounts.get_mut(&key(namespace, name)) {
            account
                .metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .insert(label.to_string(), value.to_string());
            account.metadata.resource_version = Some(rv);
        }
    }

    /// Fail the next call of the given kind with `error`
    pub(crate) fn fail_next(&self, call: ApiCall, error: kube::Error) {
        self.state.lock().failures.push((call, error));
    }

    /// Make the next create lose a race: `winner` appears first and the create gets 409
    pub(crate) fn race_next_create(&self, winner: ServiceAccount) {
        self.state.lock().race = Some(winner);
    }

    /// Delay every call by `latency`
    pub(crate) fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub(crate) fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of create, update and status calls recorded
    pub(crate) fn write_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.is_write())
            .count()
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_service_role(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceRole>, kube::Error> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(ApiCall::GetServiceRole)?;
        Ok(state.roles.get(&key(namespace, name)).cloned())
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, kube::Error> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(ApiCall::GetServiceAccount)?;
        Ok(state.accounts.get(&key(namespace, name)).cloned())
    }

    async fn create_service_account(
        &self,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, kube::Error> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(ApiCall::CreateServiceAccount)?;

        if let Some(mut winner) = state.race.take() {
            winner.metadata.resource_version = Some(state.next_resource_version());
            state.accounts.insert(key_of(&winner), winner);
        }

        let account_key = key_of(account);
        if state.accounts.contains_key(&account_key) {
            return Err(api_error(409, "AlreadyExists"));
        }

        let mut created = account.clone();
        created.metadata.resource_version = Some(state.next_resource_version());
        created.metadata.uid = Some(format!("sa-uid-{}", state.resource_version));
        state.accounts.insert(account_key, created.clone());
        Ok(created)
    }

    async fn update_service_account(
        &self,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, kube::Error> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(ApiCall::UpdateServiceAccount)?;

        let account_key = key_of(account);
        let current_rv = match state.accounts.get(&account_key) {
            Some(current) => current.metadata.resource_version.clone(),
            None => return Err(api_error(404, "NotFound")),
        };
        if current_rv != account.metadata.resource_version {
            return Err(api_error(409, "Conflict"));
        }

        let mut updated = account.clone();
        updated.metadata.resource_version = Some(state.next_resource_version());
        state.accounts.insert(account_key, updated.clone());
        Ok(updated)
    }

    async fn patch_service_role_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ServiceRoleStatus,
    ) -> Result<(), kube::Error> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(ApiCall::PatchServiceRoleStatus)?;

        let rv = state.next_resource_version();
        match state.roles.get_mut(&key(namespace, name)) {
            Some(role) => {
                role.status = Some(status.clone());
                role.metadata.resource_version = Some(rv);
                Ok(())
            }
            None => Err(api_error(404, "NotFound")),
        }
    }
}
