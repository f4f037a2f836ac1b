//! End-to-end failover: group-backed views driving leader route policies.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use bellwether_cluster::Cluster;
use bellwether_cluster::ClusterService;
use bellwether_group::GroupClusterService;
use bellwether_group::GroupConfig;
use bellwether_group::InMemoryEnsemble;
use bellwether_group::InMemorySession;
use bellwether_group::group_cluster_service;
use bellwether_policy::LeaderRoutePolicy;
use bellwether_policy::Workload;

const NAMESPACE: &str = "orders";

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

#[derive(Default)]
struct FlagWorkload {
    id: String,
    running: AtomicBool,
    starts: AtomicUsize,
}

impl Workload for FlagWorkload {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_auto_startup(&self, _auto_startup: bool) {}

    fn start(&self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct Node {
    session: Arc<InMemorySession>,
    service: GroupClusterService,
    policy: LeaderRoutePolicy,
    workloads: Vec<Arc<FlagWorkload>>,
}

impl Node {
    fn running(&self) -> bool {
        self.workloads.iter().all(|w| w.running.load(Ordering::SeqCst))
    }

    fn idle(&self) -> bool {
        self.workloads.iter().all(|w| !w.running.load(Ordering::SeqCst))
    }
}

fn node(ensemble: &InMemoryEnsemble, member_id: &str) -> anyhow::Result<Node> {
    let session = ensemble.connect()?;
    let service = group_cluster_service(Cluster::new("shop"), session.clone(), GroupConfig::default(), member_id)?;
    let policy = LeaderRoutePolicy::for_namespace(&service, NAMESPACE)?;

    let workloads: Vec<Arc<FlagWorkload>> = ["consumer", "scheduler", "reporter"]
        .into_iter()
        .map(|id| {
            Arc::new(FlagWorkload {
                id: id.to_string(),
                ..FlagWorkload::default()
            })
        })
        .collect();
    for workload in &workloads {
        policy.on_init(workload.clone())?;
    }

    Ok(Node {
        session,
        service,
        policy,
        workloads,
    })
}

fn leaders(nodes: &[&Node]) -> usize {
    nodes.iter().filter(|node| node.policy.is_leader()).count()
}

#[test]
fn test_first_member_runs_workloads() -> anyhow::Result<()> {
    let ensemble = InMemoryEnsemble::new();
    let a = node(&ensemble, "node-a")?;
    let b = node(&ensemble, "node-b")?;

    assert!(a.policy.is_leader());
    assert!(a.running());
    assert!(!b.policy.is_leader());
    assert!(b.idle());
    assert_eq!(b.policy.stopped_workloads(), vec!["consumer", "reporter", "scheduler"]);
    assert!(a.service.is_leader(NAMESPACE)?);
    Ok(())
}

#[test]
fn test_session_expiry_moves_workloads() -> anyhow::Result<()> {
    let ensemble = InMemoryEnsemble::new();
    let a = node(&ensemble, "node-a")?;
    let b = node(&ensemble, "node-b")?;
    let c = node(&ensemble, "node-c")?;
    assert!(wait_until(|| leaders(&[&a, &b, &c]) == 1 && a.running()));

    a.session.expire();

    assert!(wait_until(|| b.policy.is_leader() && b.running()));
    assert!(wait_until(|| !a.policy.is_leader() && a.idle()));
    assert!(c.idle());
    assert_eq!(leaders(&[&a, &b, &c]), 1);
    assert!(b.workloads.iter().all(|w| w.starts.load(Ordering::SeqCst) == 1));
    Ok(())
}

#[test]
fn test_leader_departure_hands_over_to_next_in_line() -> anyhow::Result<()> {
    let ensemble = InMemoryEnsemble::new();
    let a = node(&ensemble, "node-a")?;
    let b = node(&ensemble, "node-b")?;
    let c = node(&ensemble, "node-c")?;

    a.policy.shutdown();
    a.service.stop();

    assert!(wait_until(|| b.policy.is_leader() && b.running()));
    assert!(!c.policy.is_leader());
    assert!(c.idle());

    b.policy.shutdown();
    b.service.stop();

    assert!(wait_until(|| c.policy.is_leader() && c.running()));
    Ok(())
}

#[test]
fn test_disconnect_stops_workloads_until_reconnect() -> anyhow::Result<()> {
    let ensemble = InMemoryEnsemble::new();
    let a = node(&ensemble, "node-a")?;
    let b = node(&ensemble, "node-b")?;

    a.session.disconnect();
    assert!(wait_until(|| !a.policy.is_leader() && a.idle()));

    // Reconnecting re-creates a's node behind b's.
    a.session.reconnect();
    assert!(wait_until(|| b.policy.is_leader() && b.running()));
    assert!(!a.policy.is_leader());
    assert!(a.idle());
    Ok(())
}
