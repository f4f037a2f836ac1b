//! Property-based tests for group election.
//!
//! This module tests properties of:
//! - Master selection over arbitrary sequence sets
//! - Event selection between two membership digests
//! - Election over real sessions for any number of members

use std::sync::Arc;

use bellwether_group::CoordinationClient;
use bellwether_group::Group;
use bellwether_group::GroupEvent;
use bellwether_group::InMemoryEnsemble;
use bellwether_group::MemberState;
use bellwether_group::pure::MembershipDigest;
use bellwether_group::pure::compute_group_event;
use bellwether_group::pure::master_index;
use bellwether_group::pure::parse_sequence;
use bellwether_group::pure::sequence_node_name;
use proptest::prelude::*;

fn digest_strategy() -> impl Strategy<Value = MembershipDigest> {
    (proptest::collection::btree_map(0u64..50, "[a-d]", 0..6), any::<bool>()).prop_map(|(members, local_master)| {
        MembershipDigest {
            members: members.into_iter().map(|(seq, id)| (sequence_node_name("member-", seq), id)).collect(),
            local_master,
        }
    })
}

proptest! {
    // Property: the master index points at the minimum sequence
    #[test]
    fn prop_master_is_lowest_sequence(sequences in proptest::collection::hash_set(0u64..1_000_000, 1..64)) {
        let sequences: Vec<u64> = sequences.into_iter().collect();
        let index = master_index(&sequences).unwrap();
        prop_assert_eq!(Some(&sequences[index]), sequences.iter().min());
    }

    // Property: node names round-trip through the sequence parser
    #[test]
    fn prop_sequence_names_parse(sequence in 0u64..10_000_000_000) {
        prop_assert_eq!(parse_sequence(&sequence_node_name("member-", sequence), "member-"), Some(sequence));
    }

    // Property: a leadership event fires iff the master id or local mastership differs
    #[test]
    fn prop_leadership_event_iff_master_changes(before in digest_strategy(), after in digest_strategy()) {
        let event = compute_group_event(&before, &after);
        let leadership = matches!(event, Some(GroupEvent::LeadershipChanged { .. }));
        let changed = before.master_id() != after.master_id() || before.local_master != after.local_master;
        prop_assert_eq!(leadership, changed);

        if let Some(GroupEvent::LeadershipChanged { master }) = event {
            prop_assert_eq!(master.as_deref(), after.master_id());
        }
        if before == after {
            prop_assert!(compute_group_event(&before, &after).is_none());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    // Property: for any N >= 1 joiners exactly one is master, the first to join
    #[test]
    fn prop_exactly_one_master(count in 1usize..8) {
        let ensemble = InMemoryEnsemble::new();
        let mut groups = Vec::new();
        for i in 0..count {
            let client: Arc<dyn CoordinationClient> = ensemble.connect().unwrap();
            let group: Group<MemberState> = Group::new(client, "/prop/group", "member-").unwrap();
            group.update(MemberState::new(format!("node-{i}"))).unwrap();
            group.start().unwrap();
            groups.push(group);
        }

        // The last joiner read the full membership synchronously during start.
        let last = groups.last().unwrap();
        prop_assert_eq!(last.members().len(), count);
        prop_assert_eq!(last.master().map(|state| state.id), Some("node-0".to_string()));
        prop_assert!(groups[0].is_master());
        prop_assert_eq!(groups.iter().filter(|group| group.own_node() == groups[0].own_node()).count(), 1);
        prop_assert!(groups.iter().skip(1).all(|group| !group.is_master()));
    }
}
