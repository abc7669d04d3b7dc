use cirrus_core::{CirrusError, ResourceError};
use cirrus_platform::PlatformError;
use miette::Diagnostic;
use thiserror::Error;

/// Errors a reconcile pass can end with
#[derive(Error, Debug, Diagnostic)]
pub enum ReconcileError {
    /// Object store failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] CirrusError),

    /// Platform call failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Platform(#[from] PlatformError),

    /// The object is in a state that retrying cannot fix
    #[error("{reason}: {message}")]
    #[diagnostic(
        code(cirrus::reconcile::invariant),
        help("Correct the object or its referenced configuration; it is not retried until it changes")
    )]
    Invariant {
        #[allow(unused)]
        reason: String,
        #[allow(unused)]
        message: String,
    },

    /// Deletion is blocked by objects still referencing this one
    #[error("{resource} is still in use: {message}")]
    #[diagnostic(
        code(cirrus::reconcile::in_use),
        help("Delete or move the referencing objects first")
    )]
    InUse {
        #[allow(unused)]
        resource: String,
        #[allow(unused)]
        message: String,
    },

    /// Several independent steps failed
    #[error("{}", .messages.join("; "))]
    #[diagnostic(code(cirrus::reconcile::aggregate))]
    Aggregate {
        #[allow(unused)]
        messages: Vec<String>,
    },

    /// The final status write failed
    #[error("Failed to patch {resource}: {source}")]
    #[diagnostic(
        code(cirrus::reconcile::patch),
        help("The object changed underneath the reconcile; it will be retried")
    )]
    Patch {
        #[allow(unused)]
        resource: String,
        #[source]
        source: CirrusError,
    },
}

/// Result type alias for reconcile passes
pub type Result<T> = std::result::Result<T, ReconcileError>;

impl ReconcileError {
    pub fn invariant(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invariant {
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn in_use(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InUse {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Collapse several errors; a single one is returned unchanged
    pub fn aggregate(mut errors: Vec<ReconcileError>) -> Self {
        if errors.len() == 1 {
            if let Some(err) = errors.pop() {
                return err;
            }
        }
        Self::Aggregate {
            messages: errors.iter().map(|e| e.to_string()).collect(),
        }
    }

    pub fn patch(resource: impl Into<String>, source: CirrusError) -> Self {
        Self::Patch {
            resource: resource.into(),
            source,
        }
    }

    /// Errors that only a change to the object can resolve. The runner does
    /// not back these off and retry them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Invariant { .. } | Self::InUse { .. })
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Store(e) => e.is_not_found(),
            Self::Platform(e) => e.is_not_found(),
            _ => false,
        }
    }
}

impl From<ResourceError> for ReconcileError {
    fn from(err: ResourceError) -> Self {
        Self::Store(CirrusError::invalid_resource(
            err.to_string(),
            "The object must be persisted before it can be referenced",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_single_passes_through() {
        let err = ReconcileError::aggregate(vec![ReconcileError::invariant("Bad", "broken")]);
        assert!(matches!(err, ReconcileError::Invariant { .. }));
        assert!(err.is_terminal());
    }

    #[test]
    fn test_aggregate_joins_messages() {
        let err = ReconcileError::aggregate(vec![
            PlatformError::operation_failed("remove", "timeout").into(),
            ReconcileError::in_use("zone-a", "machine m-1"),
        ]);
        assert_eq!(
            err.to_string(),
            "Platform operation 'remove' failed: timeout; zone-a is still in use: machine m-1"
        );
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_not_found_classification() {
        let err: ReconcileError = CirrusError::resource_not_found("VSphereVM/default/vm-1").into();
        assert!(err.is_not_found());
        let err: ReconcileError = PlatformError::not_found("Folder", "vms").into();
        assert!(err.is_not_found());
        assert!(!ReconcileError::invariant("x", "y").is_not_found());
    }
}
