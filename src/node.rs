//! One participating process: a cluster service, a leadership policy for the
//! configured namespace, and the workload that policy gates.
//!
//! The demo runs several of these against an in-process ensemble; `run`
//! runs one against the configured coordination service.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use bellwether_cluster::Cluster;
use bellwether_cluster::ClusterService;
use bellwether_group::CoordinationClient;
use bellwether_group::GroupClusterService;
use bellwether_group::group_cluster_service;
use bellwether_policy::LeaderRoutePolicy;
use bellwether_policy::Workload;
use tracing::debug;
use tracing::info;

use crate::config::NodeConfig;

/// Workload that only records whether it is running.
#[derive(Debug)]
pub struct TrackedWorkload {
    id: String,
    member_id: String,
    running: AtomicBool,
}

impl TrackedWorkload {
    /// Create a stopped workload owned by `member_id`.
    pub fn new(id: impl Into<String>, member_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            member_id: member_id.into(),
            running: AtomicBool::new(false),
        }
    }

    /// Whether the workload is currently started.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Workload for TrackedWorkload {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_auto_startup(&self, auto_startup: bool) {
        debug!(workload = %self.id, member = %self.member_id, auto_startup, "auto startup set");
    }

    fn start(&self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(workload = %self.id, member = %self.member_id, "workload started");
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        info!(workload = %self.id, member = %self.member_id, "workload stopped");
        Ok(())
    }
}

/// A joined member running a leadership-gated workload.
pub struct Node {
    member_id: String,
    service: GroupClusterService,
    policy: LeaderRoutePolicy,
    workload: Arc<TrackedWorkload>,
}

impl Node {
    /// Join `config.namespace` over `client` as `member_id` and register the
    /// workload with the namespace's leadership policy.
    pub fn start(
        client: Arc<dyn CoordinationClient>,
        config: &NodeConfig,
        member_id: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let member_id = member_id.into();
        let service = group_cluster_service(
            Cluster::new(config.cluster_id.clone()),
            client,
            config.group.clone(),
            member_id.clone(),
        )?;
        let policy = LeaderRoutePolicy::for_namespace(&service, &config.namespace)
            .with_context(|| format!("failed to join namespace '{}'", config.namespace))?;
        let workload = Arc::new(TrackedWorkload::new(format!("{}-worker", config.namespace), member_id.clone()));
        policy.on_init(workload.clone())?;

        info!(member = %member_id, cluster = %config.cluster_id, namespace = %config.namespace, "node joined");
        Ok(Self {
            member_id,
            service,
            policy,
            workload,
        })
    }

    /// Member identity advertised in the group.
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// The service handing out this node's views.
    pub fn service(&self) -> &GroupClusterService {
        &self.service
    }

    /// Whether this node is master of its namespace.
    pub fn is_leader(&self) -> bool {
        self.policy.is_leader()
    }

    /// Whether this node leads and its workload runs.
    pub fn is_active_leader(&self) -> bool {
        self.is_leader() && self.workload.is_running()
    }

    /// Stop the workload and leave every group.
    pub fn shutdown(&self) {
        self.policy.shutdown();
        self.service.stop();
        info!(member = %self.member_id, "node left");
    }
}

/// What a [`run_node`] loop observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Leadership transitions seen by the loop.
    pub leadership_changes: usize,
    /// Whether the node led when the loop ended.
    pub leader_at_exit: bool,
}

/// Watch `node` until `duration` passes (forever when `None`), logging each
/// leadership transition seen at `poll` granularity.
pub fn run_node(node: &Node, duration: Option<Duration>, poll: Duration) -> RunReport {
    let deadline = duration.map(|duration| Instant::now() + duration);
    let mut leader = node.is_active_leader();
    let mut leadership_changes = 0;
    info!(member = %node.member_id(), leader, "node running");

    while deadline.is_none_or(|deadline| Instant::now() < deadline) {
        thread::sleep(poll);
        let now = node.is_active_leader();
        if now != leader {
            leader = now;
            leadership_changes += 1;
            info!(member = %node.member_id(), leader, "leadership changed");
        }
    }

    RunReport {
        leadership_changes,
        leader_at_exit: leader,
    }
}

/// Connect to the coordination service named by `config.group`.
#[cfg(feature = "zookeeper")]
pub fn connect_backend(config: &NodeConfig) -> anyhow::Result<Arc<dyn CoordinationClient>> {
    let client = bellwether_group::ZooKeeperClient::connect(&config.group)
        .with_context(|| format!("failed to connect to '{}'", config.group.connect_string))?;
    Ok(client)
}

/// Connect to the coordination service named by `config.group`.
#[cfg(not(feature = "zookeeper"))]
pub fn connect_backend(config: &NodeConfig) -> anyhow::Result<Arc<dyn CoordinationClient>> {
    anyhow::bail!(
        "cannot connect to '{}': built without the `zookeeper` feature",
        config.group.connect_string
    )
}

#[cfg(test)]
mod tests {
    use bellwether_group::InMemoryEnsemble;

    use super::*;

    fn config() -> NodeConfig {
        NodeConfig {
            cluster_id: "shop".into(),
            namespace: "jobs".into(),
            ..NodeConfig::default()
        }
    }

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

    #[test]
    fn test_leadership_moves_when_leader_leaves() {
        let ensemble = InMemoryEnsemble::new();
        let first = Node::start(ensemble.connect().unwrap(), &config(), "node-a").unwrap();
        let second = Node::start(ensemble.connect().unwrap(), &config(), "node-b").unwrap();

        assert!(first.is_active_leader());
        assert!(!second.is_leader());
        assert!(first.service().is_leader("jobs").unwrap());

        first.shutdown();
        assert!(wait_until(|| second.is_active_leader()));
        second.shutdown();
    }

    #[test]
    fn test_run_node_reports_leadership() {
        let ensemble = InMemoryEnsemble::new();
        let node = Node::start(ensemble.connect().unwrap(), &config(), "node-a").unwrap();

        let report = run_node(&node, Some(Duration::from_millis(30)), Duration::from_millis(5));
        assert_eq!(report, RunReport {
            leadership_changes: 0,
            leader_at_exit: true,
        });
        node.shutdown();
    }

    #[test]
    fn test_workload_tracks_state() {
        let workload = TrackedWorkload::new("w", "node-0");
        assert!(!workload.is_running());
        workload.start().unwrap();
        assert!(workload.is_running());
        workload.stop().unwrap();
        assert!(!workload.is_running());
    }

    #[cfg(not(feature = "zookeeper"))]
    #[test]
    fn test_connect_backend_needs_feature() {
        let err = connect_backend(&config()).err().unwrap();
        assert!(err.to_string().contains("zookeeper"));
    }
}
