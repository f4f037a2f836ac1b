//! Cluster identity and member value types.

use std::fmt;
use std::sync::Arc;

/// The coordination domain a set of processes share.
///
/// Cheap to clone; every view derived from a cluster holds its own handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cluster {
    id: Arc<str>,
}

impl Cluster {
    /// Create a cluster handle with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        let id: String = id.into();
        Self { id: Arc::from(id) }
    }

    /// Id of the cluster.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// A participant in a cluster view.
///
/// Members are created by the election backend as peers join and are never
/// mutated; a change in membership produces new values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterMember {
    id: String,
    local: bool,
}

impl ClusterMember {
    /// Create a member with an explicit locality flag.
    pub fn new(id: impl Into<String>, local: bool) -> Self {
        Self { id: id.into(), local }
    }

    /// Create the member representing this process.
    pub fn local(id: impl Into<String>) -> Self {
        Self::new(id, true)
    }

    /// Create a member representing a peer process.
    pub fn remote(id: impl Into<String>) -> Self {
        Self::new(id, false)
    }

    /// Opaque member identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this member is the current process.
    pub fn is_local(&self) -> bool {
        self.local
    }
}

impl fmt::Display for ClusterMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.local {
            write!(f, "{} (local)", self.id)
        } else {
            f.write_str(&self.id)
        }
    }
}
