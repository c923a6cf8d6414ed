//! Error types for the IAM operator

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Reading the parent ServiceRole failed
    #[error("failed to get ServiceRole {namespace}/{name}: {source}")]
    ServiceRole {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    /// A get, create or update of the managed ServiceAccount failed
    #[error("failed to {op} ServiceAccount {namespace}/{name}: {source}")]
    ServiceAccount {
        op: &'static str,
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    /// Writing the ServiceRole status subresource failed
    #[error("failed to update status of ServiceRole {namespace}/{name}: {source}")]
    Status {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    /// The derived account name is taken by an account this role does not own
    #[error(
        "ServiceAccount {namespace}/{name} already exists and is not owned by ServiceRole {role}"
    )]
    NameCollision {
        namespace: String,
        name: String,
        role: String,
    },

    /// The ServiceRole object lacks a field the reconciler depends on
    #[error("ServiceRole is missing {0}")]
    MissingField(&'static str),

    /// A derived label value would be rejected by the API server
    #[error("value {value:?} of label {key} is not a valid label value")]
    InvalidLabelValue { key: &'static str, value: String },

    /// The per-reconcile deadline elapsed
    #[error("reconcile of {key} timed out after {after:?}")]
    Timeout { key: String, after: Duration },

    /// Kubernetes API error outside of a reconcile
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Coarse classification of an [`OperatorError`], used by the error policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The object vanished
    NotFound,
    /// Optimistic concurrency failure or create race
    Conflict,
    /// RBAC denied the request
    Forbidden,
    /// Name collision with an account the controller does not own
    Collision,
    /// The object is malformed and retrying will not help until it changes
    Invalid,
    /// The reconcile deadline elapsed
    Cancelled,
    /// Network, throttling, server errors
    Transient,
}

/// Base delay for conflicts; the next reconcile re-reads and usually wins
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Delay for errors that only resolve when the inputs change
const STALLED_REQUEUE: Duration = Duration::from_secs(300);

/// HTTP status code of a Kubernetes API error, if the error came from the API server
pub fn api_status(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

/// Whether the API server answered 404
pub fn is_not_found(error: &kube::Error) -> bool {
    api_status(error) == Some(404)
}

/// Whether the API server answered 409 (AlreadyExists or a stale resourceVersion)
pub fn is_conflict(error: &kube::Error) -> bool {
    api_status(error) == Some(409)
}

fn classify_kube(error: &kube::Error) -> ErrorKind {
    match api_status(error) {
        Some(404) => ErrorKind::NotFound,
        Some(409) => ErrorKind::Conflict,
        Some(401 | 403) => ErrorKind::Forbidden,
        Some(422) => ErrorKind::Invalid,
        _ => ErrorKind::Transient,
    }
}

impl OperatorError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            OperatorError::ServiceRole { source, .. }
            | OperatorError::ServiceAccount { source, .. }
            | OperatorError::Status { source, .. }
            | OperatorError::Kube(source) => classify_kube(source),
            OperatorError::NameCollision { .. } => ErrorKind::Collision,
            OperatorError::MissingField(_) | OperatorError::InvalidLabelValue { .. } => {
                ErrorKind::Invalid
            }
            OperatorError::Timeout { .. } => ErrorKind::Cancelled,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Collision | ErrorKind::Invalid)
    }

    /// Get a fixed requeue delay, or `None` when the caller should back off exponentially
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self.kind() {
            ErrorKind::Conflict => Some(CONFLICT_REQUEUE),
            ErrorKind::Collision | ErrorKind::Invalid => Some(STALLED_REQUEUE),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} (fake)"),
        reason: reason.to_string(),
        code,
    })
}
