//! Error types for coordination clients and groups.

use snafu::Snafu;

/// Result alias for coordination client calls.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Result alias for group operations.
pub type GroupResult<T> = Result<T, GroupError>;

/// Errors reported by a [`CoordinationClient`](crate::CoordinationClient).
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// The node (or its parent, for creates) does not exist.
    #[snafu(display("node '{path}' does not exist"))]
    NoNode {
        /// Path that was missing.
        path: String,
    },

    /// A node already exists at the path.
    #[snafu(display("node '{path}' already exists"))]
    NodeExists {
        /// Conflicting path.
        path: String,
    },

    /// The node still has children and cannot be deleted.
    #[snafu(display("node '{path}' has children"))]
    NotEmpty {
        /// Path of the non-empty node.
        path: String,
    },

    /// The path is malformed.
    #[snafu(display("invalid path '{path}': {reason}"))]
    InvalidPath {
        /// The rejected path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The payload exceeds the node size limit.
    #[snafu(display("payload for '{path}' is {size} bytes, limit is {max}"))]
    PayloadTooLarge {
        /// Target path.
        path: String,
        /// Payload size in bytes.
        size: usize,
        /// Limit in bytes.
        max: usize,
    },

    /// The client is not connected to the coordination service.
    #[snafu(display("connection to coordination service lost"))]
    ConnectionLoss,

    /// The session expired; ephemeral nodes owned by it are gone.
    #[snafu(display("coordination session expired"))]
    SessionExpired,

    /// The client has been closed.
    #[snafu(display("coordination client is closed"))]
    Closed,

    /// Any other backend failure.
    #[snafu(display("coordination backend error: {message}"))]
    Backend {
        /// Backend-specific description.
        message: String,
    },
}

impl CoordinationError {
    /// Whether retrying after the session recovers may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordinationError::ConnectionLoss | CoordinationError::SessionExpired)
    }
}

/// Errors from [`Group`](crate::Group) operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum GroupError {
    /// A coordination call failed.
    #[snafu(display("coordination error on '{path}': {source}"))]
    Coordination {
        /// Path the call targeted.
        path: String,
        /// The client error.
        source: CoordinationError,
    },

    /// The local state could not be serialized.
    #[snafu(display("failed to serialize state for '{path}': {source}"))]
    Serialization {
        /// Group path.
        path: String,
        /// The serializer error.
        source: serde_json::Error,
    },

    /// The group was closed.
    #[snafu(display("group '{path}' is closed"))]
    GroupClosed {
        /// Group path.
        path: String,
    },
}
