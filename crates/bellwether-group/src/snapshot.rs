//! Immutable membership snapshots.
//!
//! A [`GroupData`] is built in full by every refresh and published through an
//! `ArcSwap`, so readers always see one consistent membership list.

use crate::node_state::NodeState;
use crate::pure::MembershipDigest;

/// One member node as read during a refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildData<T> {
    /// Node name, e.g. `member-0000000003`.
    pub node: String,
    /// Absolute node path.
    pub path: String,
    /// Sequence number parsed from the node name.
    pub sequence: u64,
    /// Decoded state published by the member.
    pub state: T,
}

/// Membership of a group at one point in time.
#[derive(Debug, Clone)]
pub struct GroupData<T> {
    members: Vec<ChildData<T>>,
    own_node: Option<String>,
}

impl<T> Default for GroupData<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> GroupData<T> {
    /// A snapshot with no members, used while disconnected.
    pub fn empty() -> Self {
        Self {
            members: Vec::new(),
            own_node: None,
        }
    }

    /// Build a snapshot; members are ordered by sequence number.
    pub fn new(mut members: Vec<ChildData<T>>, own_node: Option<String>) -> Self {
        members.sort_by_key(|child| child.sequence);
        Self { members, own_node }
    }

    /// All members, lowest sequence first.
    pub fn members(&self) -> &[ChildData<T>] {
        &self.members
    }

    /// The member holding the lowest sequence number.
    pub fn master(&self) -> Option<&ChildData<T>> {
        self.members.first()
    }

    /// Every member except the master.
    pub fn slaves(&self) -> &[ChildData<T>] {
        self.members.get(1..).unwrap_or_default()
    }

    /// Name of this process's node, if it has joined.
    pub fn own_node(&self) -> Option<&str> {
        self.own_node.as_deref()
    }

    /// This process's entry, if it is present in the snapshot.
    pub fn own(&self) -> Option<&ChildData<T>> {
        let own = self.own_node.as_deref()?;
        self.members.iter().find(|child| child.node == own)
    }

    /// Whether this process's node is the master node.
    pub fn is_master(&self) -> bool {
        match (self.master(), self.own_node.as_deref()) {
            (Some(master), Some(own)) => master.node == own,
            _ => false,
        }
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the snapshot has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl<T: NodeState> GroupData<T> {
    /// Reduce the snapshot to what event computation compares.
    pub fn digest(&self) -> MembershipDigest {
        MembershipDigest {
            members: self.members.iter().map(|child| (child.node.clone(), child.state.id().to_string())).collect(),
            local_master: self.is_master(),
        }
    }
}
