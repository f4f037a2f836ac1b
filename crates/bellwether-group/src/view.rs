//! [`ClusterView`] backed by a [`Group`].

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use bellwether_cluster::Cluster;
use bellwether_cluster::ClusterError;
use bellwether_cluster::ClusterEvent;
use bellwether_cluster::ClusterMember;
use bellwether_cluster::ClusterResult;
use bellwether_cluster::ClusterView;
use bellwether_cluster::EventListenerRegistry;
use tracing::debug;
use tracing::info;

use crate::client::CoordinationClient;
use crate::client::ensure_path;
use crate::config::GroupConfig;
use crate::error::GroupResult;
use crate::group::Group;
use crate::group::GroupEvent;
use crate::group::GroupListener;
use crate::node_state::MemberState;
use crate::snapshot::ChildData;

/// A namespace view whose membership is a coordination-service group.
///
/// Group leadership changes become [`ClusterEvent::LeadershipChanged`] and
/// membership changes become [`ClusterEvent::KeepAlive`]. A stopped view
/// cannot be started again.
///
/// A member is local when its node is the one this view created, so two
/// processes configured with the same member id never both lead.
pub struct GroupClusterView {
    cluster: Cluster,
    namespace: String,
    local_member_id: String,
    client: Arc<dyn CoordinationClient>,
    group: Group<MemberState>,
    listeners: EventListenerRegistry,
    running: AtomicBool,
}

impl GroupClusterView {
    /// Build the view for `namespace`. The group is not joined until
    /// [`ClusterView::start`].
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        config: &GroupConfig,
        cluster: Cluster,
        namespace: &str,
        local_member_id: &str,
    ) -> GroupResult<Arc<Self>> {
        let path = config.group_path(cluster.id(), namespace);
        let group = Group::new(Arc::clone(&client), path, config.member_prefix.clone())?;

        let view = Arc::new_cyclic(|weak: &Weak<GroupClusterView>| {
            let weak = weak.clone();
            let listener: GroupListener = Arc::new(move |event: &GroupEvent| {
                if let Some(view) = weak.upgrade() {
                    view.on_group_event(event);
                }
            });
            group.add_listener(listener);

            GroupClusterView {
                cluster,
                namespace: namespace.to_string(),
                local_member_id: local_member_id.to_string(),
                client,
                group,
                listeners: EventListenerRegistry::new(),
                running: AtomicBool::new(false),
            }
        });

        Ok(view)
    }

    /// The underlying group.
    pub fn group(&self) -> &Group<MemberState> {
        &self.group
    }

    fn member(child: &ChildData<MemberState>, own_node: Option<&str>) -> ClusterMember {
        ClusterMember::new(child.state.id.clone(), own_node == Some(child.node.as_str()))
    }

    fn on_group_event(&self, event: &GroupEvent) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let cluster_event = match event {
            GroupEvent::LeadershipChanged { master } => ClusterEvent::LeadershipChanged {
                master: master.as_ref().map(|id| ClusterMember::new(id.clone(), self.group.is_master())),
            },
            GroupEvent::MembershipChanged => ClusterEvent::KeepAlive {
                members: self.members(),
            },
            GroupEvent::Connected | GroupEvent::Disconnected => {
                debug!(namespace = %self.namespace, event = ?event, "session state change");
                return;
            }
        };

        self.listeners.fire_event(&cluster_event);
    }
}

impl ClusterView for GroupClusterView {
    fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn master(&self) -> Option<ClusterMember> {
        let snapshot = self.group.snapshot();
        snapshot.master().map(|child| Self::member(child, snapshot.own_node()))
    }

    fn local_member(&self) -> ClusterMember {
        ClusterMember::local(self.local_member_id.clone())
    }

    fn members(&self) -> Vec<ClusterMember> {
        let snapshot = self.group.snapshot();
        snapshot.members().iter().map(|child| Self::member(child, snapshot.own_node())).collect()
    }

    fn listeners(&self) -> &EventListenerRegistry {
        &self.listeners
    }

    fn start(&self) -> ClusterResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = ensure_path(self.client.as_ref(), self.group.path())
            .map_err(|e| ClusterError::view_start(self.namespace.as_str(), e))
            .and_then(|()| {
                self.group
                    .update(MemberState::new(self.local_member_id.clone()))
                    .and_then(|()| self.group.start())
                    .map_err(|e| ClusterError::view_start(self.namespace.as_str(), e))
            });

        match result {
            Ok(()) => {
                info!(
                    cluster = %self.cluster,
                    namespace = %self.namespace,
                    member_id = %self.local_member_id,
                    path = %self.group.path(),
                    "cluster view joined group"
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) && self.group.is_closed() {
            return;
        }
        self.group.close();
        debug!(cluster = %self.cluster, namespace = %self.namespace, "cluster view stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for GroupClusterView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupClusterView")
            .field("cluster", &self.cluster.id())
            .field("namespace", &self.namespace)
            .field("local_member_id", &self.local_member_id)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;
    use std::time::Instant;

    use parking_lot::Mutex;

    use super::*;
    use crate::in_memory::InMemoryEnsemble;

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

    fn view(ensemble: &InMemoryEnsemble, member: &str) -> Arc<GroupClusterView> {
        let client: Arc<dyn CoordinationClient> = ensemble.connect().unwrap();
        GroupClusterView::new(client, &GroupConfig::default(), Cluster::new("test"), "orders", member).unwrap()
    }

    #[test]
    fn test_start_joins_and_reports_local_master() {
        let ensemble = InMemoryEnsemble::new();
        let view = view(&ensemble, "node-1");
        view.start().unwrap();

        assert!(view.is_running());
        assert_eq!(ensemble.children("/bellwether/clusters/test/orders").len(), 1);
        assert_eq!(view.master(), Some(ClusterMember::local("node-1")));
        assert!(view.is_leader());
        assert_eq!(view.members(), vec![ClusterMember::local("node-1")]);
    }

    #[test]
    fn test_events_are_translated() {
        let ensemble = InMemoryEnsemble::new();
        let first = view(&ensemble, "node-1");
        first.start().unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        first.add_event_listener(Arc::new(move |event: &ClusterEvent| sink.lock().push(event.clone())));

        let second = view(&ensemble, "node-2");
        second.start().unwrap();
        assert!(wait_until(|| events.lock().iter().any(ClusterEvent::is_keep_alive)));

        second.stop();
        first.stop();
        second.start().unwrap_err();

        let log = events.lock();
        let ClusterEvent::KeepAlive { members } = &log[0] else {
            panic!("expected keep-alive, got {:?}", log[0]);
        };
        assert_eq!(members, &vec![ClusterMember::local("node-1"), ClusterMember::remote("node-2")]);
    }

    #[test]
    fn test_failover_to_remote_member() {
        let ensemble = InMemoryEnsemble::new();
        let first = view(&ensemble, "node-1");
        first.start().unwrap();
        let second = view(&ensemble, "node-2");
        second.start().unwrap();

        let masters = Arc::new(Mutex::new(Vec::new()));
        let sink = masters.clone();
        second.add_filtered_event_listener(
            Arc::new(ClusterEvent::is_leadership_changed),
            Arc::new(move |event: &ClusterEvent| sink.lock().push(event.master().cloned())),
        );

        first.stop();

        assert!(wait_until(|| masters.lock().len() == 1));
        assert_eq!(masters.lock()[0], Some(ClusterMember::local("node-2")));
        assert!(second.is_leader());
    }

    #[test]
    fn test_no_dispatch_after_stop() {
        let ensemble = InMemoryEnsemble::new();
        let first = view(&ensemble, "node-1");
        first.start().unwrap();

        let count = Arc::new(Mutex::new(0usize));
        let sink = count.clone();
        first.add_event_listener(Arc::new(move |_event: &ClusterEvent| *sink.lock() += 1));
        first.stop();

        let second = view(&ensemble, "node-2");
        second.start().unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(*count.lock(), 0);
        assert!(!first.is_running());
    }

    #[test]
    fn test_start_fails_when_disconnected() {
        let ensemble = InMemoryEnsemble::new();
        let session = ensemble.connect().unwrap();
        session.disconnect();
        let client: Arc<dyn CoordinationClient> = session;
        let view = GroupClusterView::new(client, &GroupConfig::default(), Cluster::new("test"), "orders", "n").unwrap();

        let err = view.start().unwrap_err();
        assert!(matches!(err, ClusterError::ViewStart { .. }));
        assert!(!view.is_running());
    }

    #[test]
    fn test_duplicate_member_ids_elect_one_leader() {
        let ensemble = InMemoryEnsemble::new();
        let first = view(&ensemble, "node-1");
        first.start().unwrap();
        let second = view(&ensemble, "node-1");
        second.start().unwrap();

        assert!(first.is_leader());
        assert!(!second.is_leader());
        assert_eq!(second.members(), vec![ClusterMember::remote("node-1"), ClusterMember::local("node-1")]);

        let masters = Arc::new(Mutex::new(Vec::new()));
        let sink = masters.clone();
        second.add_filtered_event_listener(
            Arc::new(ClusterEvent::is_leadership_changed),
            Arc::new(move |event: &ClusterEvent| sink.lock().push(event.master().cloned())),
        );

        first.stop();

        assert!(wait_until(|| masters.lock().len() == 1));
        assert_eq!(masters.lock()[0], Some(ClusterMember::local("node-1")));
        assert!(second.is_leader());
    }
}
