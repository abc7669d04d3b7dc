// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for Cirrus object operations
#[derive(Error, Debug, Diagnostic)]
pub enum CirrusError {
    /// Resource not found
    #[error("Resource not found: {resource_key}")]
    #[diagnostic(
        code(cirrus::resource_not_found),
        help("Verify the resource name, namespace, and kind are correct")
    )]
    ResourceNotFound {
        #[allow(unused)]
        resource_key: String,
    },

    /// Resource already exists
    #[error("Resource already exists: {resource_key}")]
    #[diagnostic(
        code(cirrus::resource_already_exists),
        help("Update the existing resource instead, or delete it first")
    )]
    ResourceAlreadyExists {
        #[allow(unused)]
        resource_key: String,
    },

    /// Invalid resource
    #[error("Invalid resource: {reason}")]
    #[diagnostic(code(cirrus::invalid_resource), help("{suggestion}"))]
    InvalidResource {
        #[allow(unused)]
        reason: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Optimistic concurrency check failed
    #[error("Conflict detected for resource {resource_key}: expected version {expected}, found {actual}")]
    #[diagnostic(
        code(cirrus::conflict),
        help("The object was modified concurrently. Re-read it and retry the change")
    )]
    Conflict {
        #[allow(unused)]
        resource_key: String,
        #[allow(unused)]
        expected: String,
        #[allow(unused)]
        actual: String,
    },

    /// Storage error
    #[error("Storage error: {message}")]
    #[diagnostic(
        code(cirrus::storage_error),
        help("Check storage backend logs and ensure the data directory is accessible")
    )]
    StorageError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(cirrus::serialization_error),
        help("Ensure the resource format is valid JSON or YAML")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Unknown kind in an import document
    #[error("Unknown resource kind: {kind}")]
    #[diagnostic(
        code(cirrus::invalid_kind),
        help("Supported kinds: Cluster, VSphereCluster, VSphereVM, IPAddressClaim, IPAddress, VSphereDeploymentZone, VSphereFailureDomain, Machine, KubeadmControlPlane, MachineDeployment, VSphereClusterIdentity, Secret")
    )]
    InvalidKind {
        #[allow(unused)]
        kind: String,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(cirrus::internal_error),
        help("This is likely a bug. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for Cirrus core operations
pub type Result<T> = std::result::Result<T, CirrusError>;

impl CirrusError {
    /// Create a ResourceNotFound error
    pub fn resource_not_found(resource_key: impl Into<String>) -> Self {
        Self::ResourceNotFound {
            resource_key: resource_key.into(),
        }
    }

    /// Create a ResourceAlreadyExists error
    pub fn resource_already_exists(resource_key: impl Into<String>) -> Self {
        Self::ResourceAlreadyExists {
            resource_key: resource_key.into(),
        }
    }

    /// Create an InvalidResource error
    pub fn invalid_resource(reason: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidResource {
            reason: reason.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a Conflict error
    pub fn conflict(
        resource_key: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            resource_key: resource_key.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a StorageError
    pub fn storage_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::StorageError {
            message: message.into(),
            source,
        }
    }

    /// Create a SerializationError
    pub fn serialization_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source,
        }
    }

    /// Create an InvalidKind error
    pub fn invalid_kind(kind: impl Into<String>) -> Self {
        Self::InvalidKind { kind: kind.into() }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// True for errors that mean "the object is already gone"
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ResourceNotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for CirrusError {
    fn from(err: serde_json::Error) -> Self {
        CirrusError::serialization_error(format!("JSON error: {}", err), Some(Box::new(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = CirrusError::resource_not_found(
            "infrastructure.cluster.x-k8s.io/VSphereVM/default/vm-1",
        );
        assert!(err.is_not_found());
        assert!(!err.is_conflict());

        let err = CirrusError::conflict("core/Secret/default/creds", "3", "4");
        assert!(err.is_conflict());
        assert!(err.to_string().contains("expected version 3"));
    }
}
