use miette::Diagnostic;
use thiserror::Error;

/// Errors returned by the virtualization platform and its collaborators
#[derive(Error, Debug, Diagnostic)]
pub enum PlatformError {
    /// The platform could not be reached or rejected the login
    #[error("Failed to connect to vCenter {server}: {message}")]
    #[diagnostic(
        code(cirrus::platform::connection_failed),
        help("Verify the server address and thumbprint, and that the credentials are valid")
    )]
    ConnectionFailed {
        #[allow(unused)]
        server: String,
        #[allow(unused)]
        message: String,
    },

    /// A named inventory object does not exist
    #[error("{kind} not found: {name}")]
    #[diagnostic(
        code(cirrus::platform::not_found),
        help("Check the inventory path. Names are matched exactly")
    )]
    NotFound {
        #[allow(unused)]
        kind: String,
        #[allow(unused)]
        name: String,
    },

    /// The resource pool of a target is not owned by a compute cluster
    #[error("Cannot create cluster module for {target}: {message}")]
    #[diagnostic(
        code(cirrus::platform::cluster_module_incompatible_owner),
        help("Anti-affinity groups require the machines to be placed in a resource pool owned by a compute cluster")
    )]
    ClusterModuleIncompatibleOwner {
        #[allow(unused)]
        target: String,
        #[allow(unused)]
        message: String,
    },

    /// Any other failed platform call
    #[error("Platform operation '{operation}' failed: {message}")]
    #[diagnostic(
        code(cirrus::platform::operation_failed),
        help("The call is retried on the next reconcile")
    )]
    OperationFailed {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        message: String,
    },

    /// Credentials could not be resolved
    #[error("Invalid credentials: {message}")]
    #[diagnostic(
        code(cirrus::platform::invalid_credentials),
        help("The secret must carry non-empty 'username' and 'password' keys")
    )]
    InvalidCredentials {
        #[allow(unused)]
        message: String,
    },

    /// Remote workload cluster call failed
    #[error("Workload cluster request failed: {message}")]
    #[diagnostic(code(cirrus::platform::remote_cluster))]
    RemoteCluster {
        #[allow(unused)]
        message: String,
    },

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    CoreError(#[from] cirrus_core::CirrusError),
}

/// Result type alias for platform operations
pub type Result<T> = std::result::Result<T, PlatformError>;

impl PlatformError {
    pub fn connection_failed(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            server: server.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn incompatible_owner(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ClusterModuleIncompatibleOwner {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn operation_failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Self::InvalidCredentials {
            message: message.into(),
        }
    }

    pub fn remote_cluster(message: impl Into<String>) -> Self {
        Self::RemoteCluster {
            message: message.into(),
        }
    }

    /// True when the error means the object is already gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::CoreError(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_incompatible_owner(&self) -> bool {
        matches!(self, Self::ClusterModuleIncompatibleOwner { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(PlatformError::not_found("ResourcePool", "pool-a").is_not_found());
        assert!(PlatformError::CoreError(cirrus_core::CirrusError::resource_not_found("x"))
            .is_not_found());
        assert!(!PlatformError::operation_failed("createTag", "boom").is_not_found());
        assert!(
            PlatformError::incompatible_owner("md-0", "pool owned by host").is_incompatible_owner()
        );
    }

    #[test]
    fn test_error_messages() {
        let err = PlatformError::not_found("Datastore", "ds-1");
        assert_eq!(err.to_string(), "Datastore not found: ds-1");
    }
}
