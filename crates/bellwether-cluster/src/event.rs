//! Events published by a cluster view.

use crate::member::ClusterMember;

/// Payload-free discriminant of a [`ClusterEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterEventKind {
    /// Membership was refreshed without a change of master.
    KeepAlive,
    /// The master of the view changed (possibly to "no master").
    LeadershipChanged,
}

/// Event delivered to the listeners of a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// Membership changed or was re-confirmed; carries the current members.
    KeepAlive {
        /// Members visible to the view, master first.
        members: Vec<ClusterMember>,
    },
    /// Leadership moved.
    LeadershipChanged {
        /// The new master, or `None` while no master is known
        /// (for example while disconnected from the coordination service).
        master: Option<ClusterMember>,
    },
}

impl ClusterEvent {
    /// The discriminant of this event.
    pub fn kind(&self) -> ClusterEventKind {
        match self {
            ClusterEvent::KeepAlive { .. } => ClusterEventKind::KeepAlive,
            ClusterEvent::LeadershipChanged { .. } => ClusterEventKind::LeadershipChanged,
        }
    }

    /// Predicate helper for leadership listeners.
    pub fn is_leadership_changed(&self) -> bool {
        self.kind() == ClusterEventKind::LeadershipChanged
    }

    /// Predicate helper for keep-alive listeners.
    pub fn is_keep_alive(&self) -> bool {
        self.kind() == ClusterEventKind::KeepAlive
    }

    /// The master carried by a leadership event.
    pub fn master(&self) -> Option<&ClusterMember> {
        match self {
            ClusterEvent::LeadershipChanged { master } => master.as_ref(),
            ClusterEvent::KeepAlive { .. } => None,
        }
    }
}
