//! Shared helpers for group integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use bellwether_group::CoordinationClient;
use bellwether_group::Group;
use bellwether_group::GroupEvent;
use bellwether_group::InMemoryEnsemble;
use bellwether_group::InMemorySession;
use bellwether_group::MemberState;
use parking_lot::Mutex;

pub const GROUP_PATH: &str = "/bellwether/clusters/test/orders";

/// Generous bound for event-thread driven assertions.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// A started member plus the session it runs on.
pub struct Member {
    pub session: Arc<InMemorySession>,
    pub group: Group<MemberState>,
}

/// Connect a session and join the test group as `id`.
pub fn join(ensemble: &InMemoryEnsemble, id: &str) -> anyhow::Result<Member> {
    let session = ensemble.connect()?;
    let client: Arc<dyn CoordinationClient> = session.clone();
    let group = Group::new(client, GROUP_PATH, "member-")?;
    group.update(MemberState::new(id))?;
    group.start()?;
    Ok(Member { session, group })
}

/// Start a group that reads membership without joining.
pub fn observe(ensemble: &InMemoryEnsemble) -> anyhow::Result<Group<MemberState>> {
    let client: Arc<dyn CoordinationClient> = ensemble.connect()?;
    let group = Group::new(client, GROUP_PATH, "member-")?;
    group.start()?;
    Ok(group)
}

/// Record every event the group emits from now on.
pub fn record(group: &Group<MemberState>) -> Arc<Mutex<Vec<GroupEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    group.add_listener(Arc::new(move |event: &GroupEvent| sink.lock().push(event.clone())));
    events
}

/// Leadership events in a recording.
pub fn leadership_changes(events: &Mutex<Vec<GroupEvent>>) -> Vec<Option<String>> {
    events
        .lock()
        .iter()
        .filter_map(|event| match event {
            GroupEvent::LeadershipChanged { master } => Some(master.clone()),
            _ => None,
        })
        .collect()
}
