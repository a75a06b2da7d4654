//! Cloud API error taxonomy.

use std::fmt;

use spotter_reconcile::Retryable;
use thiserror::Error;

/// Result type for cloud calls.
pub type CloudResult<T> = Result<T, CloudError>;

/// Kind of resource named in an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    AutoScalingGroup,
    LaunchConfiguration,
    Instance,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::AutoScalingGroup => write!(f, "autoscaling group"),
            ResourceKind::LaunchConfiguration => write!(f, "launch configuration"),
            ResourceKind::Instance => write!(f, "instance"),
        }
    }
}

/// Errors returned by cloud calls.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CloudError {
    /// Request rate exceeded.
    #[error("throttled: {0}")]
    Throttled(String),

    /// A recent write has not propagated yet.
    #[error("not yet propagated: {0}")]
    Propagation(String),

    /// Provider-side failure (5xx, timeout).
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Caller lacks permission for the operation.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Resource does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: ResourceKind, name: String },

    /// Resource already exists.
    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: ResourceKind, name: String },

    /// Resource is still referenced and cannot be deleted.
    #[error("{kind} in use: {name}")]
    InUse { kind: ResourceKind, name: String },

    /// Request was rejected as malformed.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl CloudError {
    pub fn not_found(kind: ResourceKind, name: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    pub fn already_exists(kind: ResourceKind, name: impl fmt::Display) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.to_string(),
        }
    }

    pub fn in_use(kind: ResourceKind, name: impl fmt::Display) -> Self {
        Self::InUse {
            kind,
            name: name.to_string(),
        }
    }

    /// Returns true for authorization failures.
    pub fn is_permission(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }

    /// Returns true if the named resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the named resource already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

impl Retryable for CloudError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Throttled(_) | Self::Propagation(_) | Self::Unavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CloudError::Throttled("Rate exceeded".into()).is_retryable());
        assert!(CloudError::Propagation("lc not visible".into()).is_retryable());
        assert!(CloudError::Unavailable("503".into()).is_retryable());

        assert!(!CloudError::AccessDenied("no".into()).is_retryable());
        assert!(!CloudError::not_found(ResourceKind::Instance, "i-1").is_retryable());
        assert!(!CloudError::Invalid("bad".into()).is_retryable());
    }

    #[test]
    fn test_permission_classification() {
        assert!(CloudError::AccessDenied("autoscaling:UpdateAutoScalingGroup".into()).is_permission());
        assert!(!CloudError::Throttled("x".into()).is_permission());
    }

    #[test]
    fn test_display() {
        let err = CloudError::in_use(ResourceKind::LaunchConfiguration, "nodes-lc");
        assert_eq!(err.to_string(), "launch configuration in use: nodes-lc");
    }
}
