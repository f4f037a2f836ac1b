//! Coordination service client abstraction.
//!
//! The group algorithm only needs a small, ZooKeeper-shaped surface:
//! hierarchical nodes, ephemeral and sequential creation, one-shot watches and
//! session state notifications. Watches and session events are delivered on
//! the client's own notification thread, in the order the client observed
//! them.

use std::sync::Arc;

use crate::error::CoordinationError;
use crate::error::CoordinationResult;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Deleted when the creating session ends.
    Ephemeral,
    /// Persistent, with a monotonically increasing suffix appended.
    PersistentSequential,
    /// Ephemeral, with a monotonically increasing suffix appended.
    EphemeralSequential,
}

impl CreateMode {
    /// Whether the node is tied to the creating session.
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    /// Whether the service appends a sequence suffix.
    pub fn is_sequential(self) -> bool {
        matches!(self, CreateMode::PersistentSequential | CreateMode::EphemeralSequential)
    }
}

/// What a triggered watch observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    /// The watched node was created.
    NodeCreated,
    /// The watched node was deleted.
    NodeDeleted,
    /// The watched node's data changed.
    NodeDataChanged,
    /// A child of the watched node was created or deleted.
    NodeChildrenChanged,
}

/// Notification for a one-shot watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    /// What happened.
    pub kind: WatchEventKind,
    /// Path the watch was set on.
    pub path: String,
}

/// Session state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// The session is (re)connected; calls succeed again.
    Connected,
    /// The connection dropped; the session and its ephemeral nodes may survive.
    Disconnected,
    /// The session expired; its ephemeral nodes and watches are gone.
    Expired,
}

/// Callback for a one-shot watch.
pub type WatchCallback = Arc<dyn Fn(WatchedEvent) + Send + Sync>;

/// Callback for session state changes.
pub type SessionCallback = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Synchronous client of a hierarchical coordination service.
pub trait CoordinationClient: Send + Sync {
    /// Whether calls can currently reach the service.
    fn is_connected(&self) -> bool;

    /// Create a node, returning its actual path (with sequence suffix if any).
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordinationResult<String>;

    /// Whether a node exists.
    fn exists(&self, path: &str) -> CoordinationResult<bool>;

    /// Read a node's data, optionally leaving a one-shot data watch.
    fn get_data(&self, path: &str, watch: Option<WatchCallback>) -> CoordinationResult<Vec<u8>>;

    /// Replace a node's data.
    fn set_data(&self, path: &str, data: &[u8]) -> CoordinationResult<()>;

    /// List child names, optionally leaving a one-shot children watch.
    fn get_children(&self, path: &str, watch: Option<WatchCallback>) -> CoordinationResult<Vec<String>>;

    /// Delete a node without children.
    fn delete(&self, path: &str) -> CoordinationResult<()>;

    /// Register a callback for session state changes.
    fn add_session_listener(&self, listener: SessionCallback);

    /// End the session. Ephemeral nodes owned by it are removed.
    fn close(&self);
}

/// Validate an absolute node path.
pub fn validate_path(path: &str) -> CoordinationResult<()> {
    let reason = if !path.starts_with('/') {
        Some("path must start with '/'")
    } else if path.len() > 1 && path.ends_with('/') {
        Some("path must not end with '/'")
    } else if path.contains("//") {
        Some("path must not contain empty segments")
    } else if path.split('/').any(|segment| segment == "." || segment == "..") {
        Some("path must not contain relative segments")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(CoordinationError::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of an absolute path; the root is its own parent.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

/// Last segment of an absolute path.
pub fn node_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(index) => &path[index + 1..],
        None => path,
    }
}

/// Create `path` and any missing ancestors as persistent nodes.
pub fn ensure_path(client: &dyn CoordinationClient, path: &str) -> CoordinationResult<()> {
    validate_path(path)?;

    let mut current = String::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        current.push('/');
        current.push_str(segment);
        match client.create(&current, &[], CreateMode::Persistent) {
            Ok(_) | Err(CoordinationError::NodeExists { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
