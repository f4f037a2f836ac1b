//! Pure group computations.
//!
//! Deterministic, side-effect free functions used by [`Group`](crate::Group)
//! refreshes. Keeping them apart from the watch plumbing lets the ordering and
//! event rules be tested without a coordination service.
//!
//! # Tiger Style
//!
//! - Sequence parsing is strict: exactly [`SEQUENCE_WIDTH`] ASCII digits
//! - Event selection is a total function of two digests

use crate::constants::SEQUENCE_WIDTH;
use crate::group::GroupEvent;

/// Parse the sequence suffix of a member node name.
///
/// Returns `None` when the name does not start with `prefix` or the remainder
/// is not exactly [`SEQUENCE_WIDTH`] decimal digits.
///
/// # Example
///
/// ```ignore
/// assert_eq!(parse_sequence("member-0000000042", "member-"), Some(42));
/// assert_eq!(parse_sequence("lock-0000000042", "member-"), None);
/// ```
pub fn parse_sequence(name: &str, prefix: &str) -> Option<u64> {
    let suffix = name.strip_prefix(prefix)?;
    if suffix.len() != SEQUENCE_WIDTH || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Node name the coordination service assigns for `sequence`.
pub fn sequence_node_name(prefix: &str, sequence: u64) -> String {
    format!("{prefix}{sequence:0width$}", width = SEQUENCE_WIDTH)
}

/// Index of the lowest sequence number, i.e. the master.
#[inline]
pub fn master_index(sequences: &[u64]) -> Option<usize> {
    sequences.iter().enumerate().min_by_key(|(_, sequence)| **sequence).map(|(index, _)| index)
}

/// What event computation needs from a snapshot: `(node name, member id)`
/// pairs ordered by sequence, and whether the own node is the master node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDigest {
    /// Members, lowest sequence first.
    pub members: Vec<(String, String)>,
    /// Whether this process's node holds the lowest sequence.
    pub local_master: bool,
}

impl MembershipDigest {
    /// Member id of the master, if any.
    pub fn master_id(&self) -> Option<&str> {
        self.members.first().map(|(_, id)| id.as_str())
    }

    /// Member ids published by more than one node, sorted.
    pub fn duplicate_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.members.iter().map(|(_, id)| id.as_str()).collect();
        ids.sort_unstable();
        let mut duplicates: Vec<&str> = ids.windows(2).filter(|pair| pair[0] == pair[1]).map(|pair| pair[0]).collect();
        duplicates.dedup();
        duplicates
    }
}

/// Decide which event a refresh produces.
///
/// # State Machine
///
/// ```text
/// master id or local mastership differs -> LeadershipChanged { master }
/// same master, nodes differ             -> MembershipChanged
/// otherwise                             -> no event
/// ```
///
/// Local mastership is compared as well so that a handover between two nodes
/// publishing the same member id still reaches the new master.
pub fn compute_group_event(previous: &MembershipDigest, current: &MembershipDigest) -> Option<GroupEvent> {
    if previous.master_id() != current.master_id() || previous.local_master != current.local_master {
        return Some(GroupEvent::LeadershipChanged {
            master: current.master_id().map(str::to_string),
        });
    }
    if previous.members != current.members {
        return Some(GroupEvent::MembershipChanged);
    }
    None
}
