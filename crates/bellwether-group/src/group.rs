//! Membership and leader election over ephemeral sequential nodes.
//!
//! Every participant creates one ephemeral sequential child under a shared
//! group path and publishes its [`NodeState`] as the payload. The child with
//! the lowest sequence number is the master.
//!
//! - A children watch on the group path and a data watch on every member node
//!   trigger a full re-read; the result replaces the [`GroupData`] snapshot
//!   wholesale before any event is emitted.
//! - Refreshes and session handling are serialized by one mutex, so events
//!   leave the group in the order the session observed the changes.
//! - Losing the session clears the snapshot (no master is known locally).
//!   Reconnecting re-creates the own node, which puts this process at the
//!   back of the line.
//!
//! # Lock order
//!
//! `tracker` before `local`, never the reverse. Listeners run with `tracker`
//! held and must not block on another refresh of the same group.

use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use parking_lot::RwLock;
use snafu::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::client::CoordinationClient;
use crate::client::CreateMode;
use crate::client::SessionCallback;
use crate::client::SessionEvent;
use crate::client::WatchCallback;
use crate::client::WatchedEvent;
use crate::client::ensure_path;
use crate::client::join_path;
use crate::client::node_name;
use crate::client::validate_path;
use crate::constants::MAX_GROUP_MEMBERS;
use crate::error::CoordinationError;
use crate::error::CoordinationResult;
use crate::error::CoordinationSnafu;
use crate::error::GroupError;
use crate::error::GroupResult;
use crate::error::SerializationSnafu;
use crate::node_state::NodeState;
use crate::node_state::decode_state;
use crate::node_state::encode_state;
use crate::pure::MembershipDigest;
use crate::pure::compute_group_event;
use crate::pure::parse_sequence;
use crate::snapshot::ChildData;
use crate::snapshot::GroupData;

/// Notifications emitted by a [`Group`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// The session (re)connected.
    Connected,
    /// The session was lost; the snapshot is empty until reconnection.
    Disconnected,
    /// Members joined, left or were re-created while the master stayed.
    MembershipChanged,
    /// The master's member id changed. `None` when no master is known.
    LeadershipChanged {
        /// Member id of the new master.
        master: Option<String>,
    },
}

/// Callback for group events.
pub type GroupListener = Arc<dyn Fn(&GroupEvent) + Send + Sync>;

struct LocalState<T> {
    state: Option<T>,
    own_path: Option<String>,
    started: bool,
    closed: bool,
}

struct GroupInner<T: NodeState> {
    client: Arc<dyn CoordinationClient>,
    path: String,
    member_prefix: String,
    snapshot: ArcSwap<GroupData<T>>,
    local: Mutex<LocalState<T>>,
    /// Digest of the last published snapshot. Also the refresh lock.
    tracker: Mutex<MembershipDigest>,
    connected: AtomicBool,
    listeners: RwLock<Vec<GroupListener>>,
    watch: WatchCallback,
}

/// Handle to a group membership. Clones share the same membership.
pub struct Group<T: NodeState> {
    inner: Arc<GroupInner<T>>,
}

impl<T: NodeState> Clone for Group<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: NodeState> std::fmt::Debug for Group<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("path", &self.inner.path)
            .field("members", &self.inner.snapshot.load().len())
            .field("connected", &self.inner.connected.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T: NodeState> Group<T> {
    /// Create a group rooted at `path`. Nothing is written until
    /// [`start`](Self::start).
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        path: impl Into<String>,
        member_prefix: impl Into<String>,
    ) -> GroupResult<Self> {
        let path = path.into();
        validate_path(&path).context(CoordinationSnafu { path: path.clone() })?;

        let inner = Arc::new_cyclic(|weak: &Weak<GroupInner<T>>| {
            let weak = weak.clone();
            let watch: WatchCallback = Arc::new(move |event: WatchedEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_watch(event);
                }
            });

            GroupInner {
                client,
                path,
                member_prefix: member_prefix.into(),
                snapshot: ArcSwap::from_pointee(GroupData::empty()),
                local: Mutex::new(LocalState {
                    state: None,
                    own_path: None,
                    started: false,
                    closed: false,
                }),
                tracker: Mutex::new(MembershipDigest::default()),
                connected: AtomicBool::new(false),
                listeners: RwLock::new(Vec::new()),
                watch,
            }
        });

        Ok(Self { inner })
    }

    /// Begin tracking the group.
    ///
    /// Registers for session events and, when connected, joins with the
    /// current state (if one was set with [`update`](Self::update)) and reads
    /// the membership. Calling `start` again is a no-op.
    pub fn start(&self) -> GroupResult<()> {
        {
            let mut local = self.inner.local.lock();
            if local.closed {
                return Err(GroupError::GroupClosed {
                    path: self.inner.path.clone(),
                });
            }
            if local.started {
                return Ok(());
            }
            local.started = true;
        }

        let weak = Arc::downgrade(&self.inner);
        let listener: SessionCallback = Arc::new(move |event: SessionEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_session_event(event);
            }
        });
        self.inner.client.add_session_listener(listener);

        let connected = self.inner.client.is_connected();
        self.inner.connected.store(connected, Ordering::SeqCst);
        if !connected {
            info!(group = %self.inner.path, "group started while disconnected, joining on connect");
            return Ok(());
        }

        self.inner.join()?;
        self.inner.refresh();
        debug!(group = %self.inner.path, "group started");
        Ok(())
    }

    /// Publish a new local state.
    ///
    /// Before joining the state is only recorded. After joining it is written
    /// to the existing node, keeping the sequence number; if that node is gone
    /// a new one is created. The snapshot catches up through the node's watch.
    pub fn update(&self, state: T) -> GroupResult<()> {
        let inner = &self.inner;
        let mut local = inner.local.lock();
        if local.closed {
            return Err(GroupError::GroupClosed {
                path: inner.path.clone(),
            });
        }
        local.state = Some(state);

        if !local.started || !inner.client.is_connected() {
            return Ok(());
        }

        if let Some(own) = local.own_path.clone() {
            let payload = match local.state.as_ref() {
                Some(state) => encode_state(state).context(SerializationSnafu { path: inner.path.clone() })?,
                None => return Ok(()),
            };
            match inner.client.set_data(&own, &payload) {
                Ok(()) => {
                    debug!(group = %inner.path, node = %own, "updated member state");
                    return Ok(());
                }
                Err(CoordinationError::NoNode { .. }) => {
                    info!(group = %inner.path, node = %own, "own node vanished, re-creating");
                    local.own_path = None;
                }
                Err(source) => return Err(GroupError::Coordination { path: own, source }),
            }
        }

        inner.create_own_node(&mut local)
    }

    /// Leave the group.
    ///
    /// Deletes the own node and stops emitting events. Safe to call before any
    /// watch has fired and more than once. A node created concurrently is
    /// deleted as soon as its creation returns.
    pub fn close(&self) {
        self.inner.leave();
    }

    /// Register a listener for group events.
    pub fn add_listener(&self, listener: GroupListener) {
        self.inner.listeners.write().push(listener);
    }

    /// Remove a listener by identity. Returns whether it was registered.
    pub fn remove_listener(&self, listener: &GroupListener) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|registered| !std::ptr::addr_eq(Arc::as_ptr(registered), Arc::as_ptr(listener)));
        listeners.len() != before
    }

    /// Current membership snapshot.
    pub fn snapshot(&self) -> Arc<GroupData<T>> {
        self.inner.snapshot.load_full()
    }

    /// Whether this process holds the lowest sequence number.
    pub fn is_master(&self) -> bool {
        self.inner.snapshot.load().is_master()
    }

    /// State published by the master.
    pub fn master(&self) -> Option<T> {
        self.inner.snapshot.load().master().map(|child| child.state.clone())
    }

    /// States of all members, master first.
    pub fn members(&self) -> Vec<T> {
        self.inner.snapshot.load().members().iter().map(|child| child.state.clone()).collect()
    }

    /// States of every member except the master.
    pub fn slaves(&self) -> Vec<T> {
        self.inner.snapshot.load().slaves().iter().map(|child| child.state.clone()).collect()
    }

    /// Name of this process's node once joined.
    pub fn own_node(&self) -> Option<String> {
        self.inner.local.lock().own_path.as_deref().map(|path| node_name(path).to_string())
    }

    /// State last passed to [`update`](Self::update).
    pub fn local_state(&self) -> Option<T> {
        self.inner.local.lock().state.clone()
    }

    /// Whether the session is connected as last observed by the group.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.local.lock().closed
    }

    /// Group path.
    pub fn path(&self) -> &str {
        &self.inner.path
    }
}

impl<T: NodeState> GroupInner<T> {
    fn is_closed(&self) -> bool {
        self.local.lock().closed
    }

    fn join(&self) -> GroupResult<()> {
        let mut local = self.local.lock();
        if local.closed || !local.started || local.own_path.is_some() {
            return Ok(());
        }
        self.create_own_node(&mut local)
    }

    /// Delete a stale own node and join again with a fresh sequence number.
    fn rejoin(&self) -> GroupResult<()> {
        let mut local = self.local.lock();
        if local.closed || !local.started {
            return Ok(());
        }
        if let Some(stale) = local.own_path.take() {
            match self.client.delete(&stale) {
                Ok(()) | Err(CoordinationError::NoNode { .. }) => {
                    debug!(group = %self.path, node = %stale, "removed stale member node");
                }
                Err(e) => warn!(group = %self.path, node = %stale, error = %e, "failed to remove stale member node"),
            }
        }
        self.create_own_node(&mut local)
    }

    /// Must be called with `local` locked, so `leave` cannot interleave.
    fn create_own_node(&self, local: &mut LocalState<T>) -> GroupResult<()> {
        let Some(state) = local.state.as_ref() else {
            return Ok(());
        };
        let payload = encode_state(state).context(SerializationSnafu { path: self.path.clone() })?;
        let prefix = join_path(&self.path, &self.member_prefix);

        let created = match self.client.create(&prefix, &payload, CreateMode::EphemeralSequential) {
            Err(CoordinationError::NoNode { .. }) => {
                ensure_path(self.client.as_ref(), &self.path).context(CoordinationSnafu { path: self.path.clone() })?;
                self.client.create(&prefix, &payload, CreateMode::EphemeralSequential)
            }
            other => other,
        }
        .context(CoordinationSnafu { path: prefix.clone() })?;

        info!(group = %self.path, node = %created, member_id = %state.id(), "joined group");
        local.own_path = Some(created);
        Ok(())
    }

    fn leave(&self) {
        let own = {
            let mut local = self.local.lock();
            if local.closed {
                return;
            }
            local.closed = true;
            local.own_path.take()
        };

        if let Some(path) = own {
            match self.client.delete(&path) {
                Ok(()) | Err(CoordinationError::NoNode { .. }) => {}
                Err(e) => warn!(group = %self.path, node = %path, error = %e, "failed to delete own node on close"),
            }
        }

        self.listeners.write().clear();
        self.snapshot.store(Arc::new(GroupData::empty()));
        info!(group = %self.path, "left group");
    }

    fn on_watch(&self, event: WatchedEvent) {
        trace!(group = %self.path, path = %event.path, kind = ?event.kind, "watch triggered");
        self.refresh();
    }

    fn refresh(&self) {
        let mut tracker = self.tracker.lock();
        self.refresh_locked(&mut tracker);
    }

    fn refresh_locked(&self, tracker: &mut MembershipDigest) {
        // A second pass only happens after re-creating a vanished own node.
        for _ in 0..2 {
            if self.is_closed() || !self.connected.load(Ordering::SeqCst) {
                return;
            }

            let own_path = self.local.lock().own_path.clone();
            let (data, own_present) = match self.read_members(own_path.as_deref()) {
                Ok(read) => read,
                Err(e) if e.is_transient() => {
                    debug!(group = %self.path, error = %e, "refresh interrupted by session loss");
                    return;
                }
                Err(e) => {
                    warn!(group = %self.path, error = %e, "failed to refresh group");
                    return;
                }
            };

            if !own_present {
                info!(group = %self.path, node = ?own_path, "own node disappeared, rejoining");
                if let Err(e) = self.rejoin() {
                    warn!(group = %self.path, error = %e, "failed to rejoin group");
                    return;
                }
                continue;
            }

            if self.is_closed() {
                return;
            }
            self.publish(tracker, data);
            return;
        }
    }

    fn read_members(&self, own_path: Option<&str>) -> CoordinationResult<(GroupData<T>, bool)> {
        let children = match self.client.get_children(&self.path, Some(Arc::clone(&self.watch))) {
            Err(CoordinationError::NoNode { .. }) => {
                ensure_path(self.client.as_ref(), &self.path)?;
                self.client.get_children(&self.path, Some(Arc::clone(&self.watch)))?
            }
            other => other?,
        };

        if children.len() > MAX_GROUP_MEMBERS {
            warn!(
                group = %self.path,
                count = children.len(),
                max = MAX_GROUP_MEMBERS,
                "group exceeds member limit, ignoring the excess"
            );
        }

        let mut members = Vec::with_capacity(children.len().min(MAX_GROUP_MEMBERS));
        for name in children.iter().take(MAX_GROUP_MEMBERS) {
            let Some(sequence) = parse_sequence(name, &self.member_prefix) else {
                warn!(group = %self.path, node = %name, "skipping child without sequence suffix");
                continue;
            };
            let path = join_path(&self.path, name);
            let payload = match self.client.get_data(&path, Some(Arc::clone(&self.watch))) {
                Ok(payload) => payload,
                Err(CoordinationError::NoNode { .. }) => {
                    debug!(group = %self.path, node = %name, "member left during refresh");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match decode_state::<T>(&payload) {
                Ok(state) => members.push(ChildData {
                    node: name.clone(),
                    path,
                    sequence,
                    state,
                }),
                Err(e) => warn!(group = %self.path, node = %name, error = %e, "skipping member with invalid state"),
            }
        }

        let own_node = own_path.map(|path| node_name(path).to_string());
        let own_present = own_node.as_ref().is_none_or(|own| children.contains(own));
        Ok((GroupData::new(members, own_node), own_present))
    }

    fn publish(&self, tracker: &mut MembershipDigest, data: GroupData<T>) {
        let digest = data.digest();
        let event = compute_group_event(tracker, &digest);
        let is_master = data.is_master();
        let count = data.len();

        self.snapshot.store(Arc::new(data));
        *tracker = digest;

        match &event {
            Some(GroupEvent::LeadershipChanged { master }) => {
                info!(group = %self.path, master = ?master, is_master, members = count, "group leadership changed");
            }
            Some(_) => debug!(group = %self.path, members = count, "group membership changed"),
            None => trace!(group = %self.path, members = count, "group refreshed without changes"),
        }

        if event.is_some() {
            let duplicates = tracker.duplicate_ids();
            if !duplicates.is_empty() {
                warn!(group = %self.path, duplicates = ?duplicates, "member id published by more than one node");
            }
        }

        if let Some(event) = event {
            self.emit(&event);
        }
    }

    fn on_session_event(&self, event: SessionEvent) {
        let mut tracker = self.tracker.lock();
        if self.is_closed() {
            return;
        }

        match event {
            SessionEvent::Disconnected | SessionEvent::Expired => {
                if event == SessionEvent::Expired {
                    // The service already removed the ephemeral node.
                    self.local.lock().own_path = None;
                }
                if !self.connected.swap(false, Ordering::SeqCst) {
                    return;
                }

                let had_master = tracker.master_id().is_some();
                self.snapshot.store(Arc::new(GroupData::empty()));
                *tracker = MembershipDigest::default();

                warn!(group = %self.path, event = ?event, "lost coordination session");
                self.emit(&GroupEvent::Disconnected);
                if had_master {
                    self.emit(&GroupEvent::LeadershipChanged { master: None });
                }
            }
            SessionEvent::Connected => {
                if self.connected.swap(true, Ordering::SeqCst) {
                    return;
                }

                info!(group = %self.path, "coordination session re-established");
                self.emit(&GroupEvent::Connected);
                if let Err(e) = self.rejoin() {
                    warn!(group = %self.path, error = %e, "failed to rejoin group after reconnect");
                }
                self.refresh_locked(&mut tracker);
            }
        }
    }

    fn emit(&self, event: &GroupEvent) {
        let listeners: Vec<GroupListener> = self.listeners.read().clone();
        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(group = %self.path, event = ?event, "group listener panicked");
            }
        }
    }
}

impl<T: NodeState> Drop for GroupInner<T> {
    fn drop(&mut self) {
        self.leave();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;
    use std::time::Instant;

    use super::*;
    use crate::in_memory::InMemoryEnsemble;
    use crate::node_state::MemberState;

    const GROUP: &str = "/clusters/test/ns";

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn joined(ensemble: &InMemoryEnsemble, id: &str) -> Group<MemberState> {
        let client: Arc<dyn CoordinationClient> = ensemble.connect().unwrap();
        let group = Group::new(client, GROUP, "member-").unwrap();
        group.update(MemberState::new(id)).unwrap();
        group.start().unwrap();
        group
    }

    fn recorder(group: &Group<MemberState>) -> Arc<Mutex<Vec<GroupEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        group.add_listener(Arc::new(move |event: &GroupEvent| sink.lock().push(event.clone())));
        events
    }

    #[test]
    fn test_single_member_is_master() {
        let ensemble = InMemoryEnsemble::new();
        let group = joined(&ensemble, "a");

        assert!(group.is_master());
        assert_eq!(group.master().unwrap().id, "a");
        assert_eq!(group.own_node().as_deref(), Some("member-0000000000"));
        assert!(group.slaves().is_empty());
    }

    #[test]
    fn test_second_member_sees_first_as_master() {
        let ensemble = InMemoryEnsemble::new();
        let first = joined(&ensemble, "a");
        let second = joined(&ensemble, "b");

        assert!(wait_until(|| first.members().len() == 2));
        assert!(first.is_master());
        assert!(!second.is_master());
        assert_eq!(second.master().unwrap().id, "a");
        assert_eq!(second.slaves().len(), 1);
    }

    #[test]
    fn test_update_before_start_is_deferred() {
        let ensemble = InMemoryEnsemble::new();
        let client: Arc<dyn CoordinationClient> = ensemble.connect().unwrap();
        let group: Group<MemberState> = Group::new(client, GROUP, "member-").unwrap();

        group.update(MemberState::new("a")).unwrap();
        assert!(ensemble.children(GROUP).is_empty());

        group.start().unwrap();
        assert_eq!(ensemble.children(GROUP).len(), 1);
    }

    #[test]
    fn test_start_without_state_only_observes() {
        let ensemble = InMemoryEnsemble::new();
        let _member = joined(&ensemble, "a");

        let client: Arc<dyn CoordinationClient> = ensemble.connect().unwrap();
        let observer: Group<MemberState> = Group::new(client, GROUP, "member-").unwrap();
        observer.start().unwrap();

        assert_eq!(observer.master().unwrap().id, "a");
        assert!(!observer.is_master());
        assert_eq!(ensemble.children(GROUP).len(), 1);
    }

    #[test]
    fn test_update_after_join_keeps_node() {
        let ensemble = InMemoryEnsemble::new();
        let group = joined(&ensemble, "a");
        let node = group.own_node().unwrap();

        group.update(MemberState::new("a").with_container("c2")).unwrap();

        assert_eq!(group.own_node().unwrap(), node);
        assert_eq!(ensemble.children(GROUP), vec![node]);
        assert!(wait_until(|| group.snapshot().own().is_some_and(|own| own.state.container.as_deref() == Some("c2"))));
        assert!(group.is_master());
    }

    #[test]
    fn test_close_deletes_node_and_is_idempotent() {
        let ensemble = InMemoryEnsemble::new();
        let group = joined(&ensemble, "a");

        group.close();
        group.close();

        assert!(ensemble.children(GROUP).is_empty());
        assert!(group.is_closed());
        assert!(group.members().is_empty());
        assert!(matches!(group.update(MemberState::new("a")), Err(GroupError::GroupClosed { .. })));
        assert!(matches!(group.start(), Err(GroupError::GroupClosed { .. })));
    }

    #[test]
    fn test_external_delete_triggers_rejoin() {
        let ensemble = InMemoryEnsemble::new();
        let group = joined(&ensemble, "a");
        let node = group.own_node().unwrap();

        ensemble.remove(&join_path(GROUP, &node)).unwrap();

        assert!(wait_until(|| group.own_node().is_some_and(|own| own != node) && group.is_master()));
        assert_eq!(ensemble.children(GROUP).len(), 1);
    }

    #[test]
    fn test_disconnect_clears_snapshot_and_reconnect_rejoins() {
        let ensemble = InMemoryEnsemble::new();
        let session = ensemble.connect().unwrap();
        let client: Arc<dyn CoordinationClient> = session.clone();
        let group: Group<MemberState> = Group::new(client, GROUP, "member-").unwrap();
        group.update(MemberState::new("a")).unwrap();
        group.start().unwrap();
        let events = recorder(&group);
        let first_node = group.own_node().unwrap();

        session.disconnect();
        assert!(wait_until(|| events.lock().len() == 2));
        assert_eq!(events.lock()[..], [GroupEvent::Disconnected, GroupEvent::LeadershipChanged { master: None }]);
        assert!(group.members().is_empty());
        assert!(!group.is_master());

        session.reconnect();
        assert!(wait_until(|| group.is_master()));
        assert_ne!(group.own_node().unwrap(), first_node);
        assert_eq!(ensemble.children(GROUP).len(), 1);
        assert!(events.lock().contains(&GroupEvent::Connected));
    }

    #[test]
    fn test_invalid_children_are_skipped() {
        let ensemble = InMemoryEnsemble::new();
        let group = joined(&ensemble, "a");

        let intruder = ensemble.connect().unwrap();
        intruder.create(&join_path(GROUP, "lock"), b"{}", CreateMode::Ephemeral).unwrap();
        intruder.create(&join_path(GROUP, "member-"), b"garbage", CreateMode::EphemeralSequential).unwrap();

        assert!(wait_until(|| ensemble.children(GROUP).len() == 3));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(group.members().len(), 1);
        assert!(group.is_master());
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let ensemble = InMemoryEnsemble::new();
        let first = joined(&ensemble, "a");
        first.add_listener(Arc::new(exploding_listener));
        let events = recorder(&first);

        let _second = joined(&ensemble, "b");
        assert!(wait_until(|| events.lock().contains(&GroupEvent::MembershipChanged)));
    }

    fn exploding_listener(_event: &GroupEvent) {
        panic!("listener failure");
    }
}
