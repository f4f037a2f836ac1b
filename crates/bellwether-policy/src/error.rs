//! Policy errors.

use bellwether_cluster::ClusterError;
use snafu::Snafu;

/// Result alias for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Errors from [`LeaderRoutePolicy`](crate::LeaderRoutePolicy).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PolicyError {
    /// The cluster view for the namespace could not be obtained.
    #[snafu(display("failed to obtain cluster view for namespace '{namespace}': {source}"))]
    View {
        /// Requested namespace.
        namespace: String,
        /// The service error.
        source: ClusterError,
    },

    /// The view is not running, so leadership can never be observed.
    #[snafu(display("cannot join cluster view '{namespace}': view is not running"))]
    Join {
        /// Namespace of the view.
        namespace: String,
    },
}
