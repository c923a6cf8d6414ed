//! ServiceRole Controller
//!
//! Wires the [`ServiceRoleReconciler`] into a kube-rs `Controller`. The
//! controller watches ServiceRoles and the ServiceAccounts they own, runs at
//! most one reconcile per key at a time, and requeues failures with backoff.

use crate::client::{ClusterApi, KubeClusterApi};
use crate::crd::ServiceRole;
use crate::error::{OperatorError, Result};
use crate::health::Readiness;
use crate::reconciler::{ReconcileOutcome, ReconcileRequest, ServiceRoleReconciler};
use crate::service_account::EnsureOutcome;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Config};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};

/// Base delay for exponential backoff on retryable errors
const ERROR_REQUEUE_SECONDS: u64 = 5;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 300;

/// Runtime settings for the controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Maximum number of reconciles running at once, across keys
    pub concurrency: u16,
    /// Deadline for a single reconcile pass
    pub reconcile_timeout: Duration,
    /// Requeue interval after a successful pass; `None` relies on watch events only
    pub resync_interval: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            concurrency: 4,
            reconcile_timeout: Duration::from_secs(30),
            resync_interval: None,
        }
    }
}

impl ControllerConfig {
    fn success_action(&self) -> Action {
        match self.resync_interval {
            Some(interval) => Action::requeue(interval),
            None => Action::await_change(),
        }
    }
}

/// Context passed to the controller
pub struct ControllerContext {
    /// Reconciler over the cluster API
    pub reconciler: ServiceRoleReconciler<dyn ClusterApi>,
    /// Controller settings
    pub config: ControllerConfig,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-key error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
}

impl ControllerContext {
    pub fn new(api: Arc<dyn ClusterApi>, config: ControllerConfig) -> Self {
        Self {
            reconciler: ServiceRoleReconciler::new(api),
            config,
            metrics: Some(ControllerMetrics::new()),
            error_counts: dashmap::DashMap::new(),
        }
    }

    fn reset_backoff(&self, key: &str) {
        self.error_counts.remove(key);
    }
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
    /// Counter for ServiceAccounts created
    pub created: metrics::Counter,
    /// Counter for ServiceAccount label repairs
    pub updated: metrics::Counter,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("iam_operator_reconciliations_total"),
            errors: metrics::counter!("iam_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("iam_operator_reconciliation_duration_seconds"),
            created: metrics::counter!("iam_operator_service_accounts_created_total"),
            updated: metrics::counter!("iam_operator_service_accounts_updated_total"),
        }
    }

    fn record_outcome(&self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Ensured {
                account: EnsureOutcome::Created,
                ..
            } => self.created.increment(1),
            ReconcileOutcome::Ensured {
                account: EnsureOutcome::Updated,
                ..
            } => self.updated.increment(1),
            _ => {}
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn backoff_key(namespace: Option<&str>, name: &str) -> String {
    format!("{}/{}", namespace.unwrap_or_default(), name)
}

type RunResult = std::result::Result<
    (ObjectRef<ServiceRole>, Action),
    controller::Error<OperatorError, watcher::Error>,
>;

/// Start the ServiceRole controller
///
/// Registers the primary watch on ServiceRoles and declares ServiceAccounts as
/// owned, so drift on a managed account re-drives its role. `readiness` is
/// raised once the CRD is confirmed queryable and lowered on shutdown.
/// Returns when the process receives SIGTERM or SIGINT.
pub async fn run_controller(
    client: Client,
    config: ControllerConfig,
    readiness: Readiness,
) -> Result<()> {
    let (roles, accounts): (Api<ServiceRole>, Api<ServiceAccount>) = match &config.namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    // Fail fast with a clear error when the CRD is not installed
    if let Err(e) = roles.list(&ListParams::default().limit(1)).await {
        error!(
            error = %e,
            "ServiceRole CRD is not queryable; install it with `iam-operator --print-crd | kubectl apply -f -`"
        );
        return Err(OperatorError::Kube(e));
    }

    let api: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::new(client));
    let ctx = Arc::new(ControllerContext::new(api, config.clone()));

    info!(
        namespace = config.namespace.as_deref().unwrap_or("all"),
        concurrency = config.concurrency,
        "Starting ServiceRole controller"
    );
    readiness.set_ready(true);

    Controller::new(roles, Config::default())
        .owns(accounts, Config::default())
        .with_config(controller::Config::default().concurrency(config.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::clone(&ctx))
        .for_each(|result| {
            settle(&ctx, result);
            futures::future::ready(())
        })
        .await;

    readiness.set_ready(false);
    info!("ServiceRole controller stopped");
    Ok(())
}

/// Bookkeeping for one item of the controller's result stream
///
/// Reconcile failures were already logged by [`error_policy`]. Backoff state is
/// dropped when a key succeeds or its object is gone.
fn settle(ctx: &ControllerContext, result: RunResult) {
    match result {
        Ok((obj, action)) => {
            ctx.reset_backoff(&backoff_key(obj.namespace.as_deref(), &obj.name));
            debug!(
                name = obj.name,
                namespace = obj.namespace,
                ?action,
                "Reconciliation completed"
            );
        }
        Err(controller::Error::ObjectNotFound(obj)) => {
            ctx.reset_backoff(&backoff_key(obj.namespace.as_deref(), &obj.name));
            debug!(
                name = obj.name,
                namespace = obj.namespace,
                "ServiceRole deleted before its reconcile ran"
            );
        }
        Err(controller::Error::ReconcilerFailed(_, obj)) => {
            debug!(name = obj.name, namespace = obj.namespace, "Reconcile requeued");
        }
        Err(e) => {
            error!(error = %e, "Controller stream error");
        }
    }
}

/// Reconcile entry point handed to the kube-rs runtime
///
/// Only the key of the delivered object is used; the reconciler re-reads
/// the role from the API.
#[instrument(skip(role, ctx), fields(name = %role.name_any(), namespace = role.namespace()))]
async fn reconcile(role: Arc<ServiceRole>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let request = ReconcileRequest::from_object_ref(&ObjectRef::from_obj(role.as_ref()))
        .ok_or(OperatorError::MissingField("metadata.namespace"))?;
    let timeout = ctx.config.reconcile_timeout;

    let result = match tokio::time::timeout(timeout, ctx.reconciler.reconcile(&request)).await {
        Ok(result) => result,
        Err(_) => Err(OperatorError::Timeout {
            key: request.to_string(),
            after: timeout,
        }),
    };

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(outcome) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.record_outcome(&outcome);
            }
            Ok(match outcome {
                ReconcileOutcome::RoleGone => Action::await_change(),
                ReconcileOutcome::Ensured { .. } => ctx.config.success_action(),
            })
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
            Err(e)
        }
    }
}

/// Error policy for the controller: fixed delays where the error suggests one,
/// exponential backoff otherwise.
fn error_policy(
    role: Arc<ServiceRole>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = backoff_key(role.namespace().as_deref(), &role.name_any());
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    };

    // 5s → 10s → 20s → 40s → 80s → 160s → 300s (capped)
    let delay = error.requeue_delay().unwrap_or_else(|| {
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow((retries - 1).min(6));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    });

    error!(
        key = %key,
        error = %error,
        kind = ?error.kind(),
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation failed, will retry"
    );

    Action::requeue(delay)
}
