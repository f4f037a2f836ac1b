//! Error types for cluster views and services.

use snafu::Snafu;

/// Boxed error produced by a backend while building or starting a view.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors from cluster services and views.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClusterError {
    /// The backend could not build a view for the namespace.
    #[snafu(display("failed to create cluster view for namespace '{namespace}': {source}"))]
    ViewCreation {
        /// Namespace that was requested.
        namespace: String,
        /// The backend failure.
        source: BoxError,
    },

    /// The view was built but refused to start.
    #[snafu(display("failed to start cluster view for namespace '{namespace}': {source}"))]
    ViewStart {
        /// Namespace of the view.
        namespace: String,
        /// The backend failure.
        source: BoxError,
    },

    /// The owning service has been stopped.
    #[snafu(display("cluster service '{cluster_id}' is stopped"))]
    ServiceStopped {
        /// Id of the cluster the service belongs to.
        cluster_id: String,
    },

    /// Namespace cannot be used as a partition key.
    #[snafu(display("invalid namespace '{namespace}': {reason}"))]
    InvalidNamespace {
        /// The rejected namespace.
        namespace: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ClusterError {
    /// Wrap any backend error as a view creation failure.
    pub fn view_creation(namespace: impl Into<String>, source: impl Into<BoxError>) -> Self {
        ClusterError::ViewCreation {
            namespace: namespace.into(),
            source: source.into(),
        }
    }

    /// Wrap any backend error as a view start failure.
    pub fn view_start(namespace: impl Into<String>, source: impl Into<BoxError>) -> Self {
        ClusterError::ViewStart {
            namespace: namespace.into(),
            source: source.into(),
        }
    }
}
