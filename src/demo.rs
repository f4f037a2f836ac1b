//! In-process failover demonstration.
//!
//! Starts several nodes against one [`InMemoryEnsemble`], each running the
//! same leadership-gated workload, then expires the leader's session and
//! waits for the next member in line to take the workload over.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::bail;
use bellwether_cluster::ClusterService;
use bellwether_group::InMemoryEnsemble;
use bellwether_group::InMemorySession;
use tracing::debug;
use tracing::info;

use crate::config::NodeConfig;
use crate::node::Node;

/// Upper bound on in-process demo nodes.
pub const MAX_DEMO_NODES: usize = 16;

/// How long the demo waits for leadership to settle.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of a demo run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoReport {
    /// Member that held leadership first.
    pub initial_leader: String,
    /// Member that took over after the initial leader's session expired.
    pub final_leader: String,
    /// Time from session expiry until the new leader ran the workload.
    pub failover: Duration,
}

struct DemoNode {
    session: Arc<InMemorySession>,
    node: Node,
}

impl DemoNode {
    fn start(ensemble: &InMemoryEnsemble, config: &NodeConfig, member_id: String) -> anyhow::Result<Self> {
        let session = ensemble.connect().context("failed to open coordination session")?;
        let node = Node::start(session.clone(), config, member_id)?;
        debug!(member = %node.member_id(), session = session.session_id(), "demo node started");
        Ok(Self { session, node })
    }
}

/// Run `nodes` in-process members and fail the first leader over.
pub fn run_demo(config: &NodeConfig, nodes: usize) -> anyhow::Result<DemoReport> {
    if !(2..=MAX_DEMO_NODES).contains(&nodes) {
        bail!("demo needs between 2 and {MAX_DEMO_NODES} nodes, got {nodes}");
    }
    config.validate()?;

    let ensemble = InMemoryEnsemble::new();
    let members = (0..nodes)
        .map(|index| DemoNode::start(&ensemble, config, format!("{}-{index}", config.member_id)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let result = fail_over(&members);

    for member in &members {
        member.node.shutdown();
    }
    result
}

fn fail_over(members: &[DemoNode]) -> anyhow::Result<DemoReport> {
    let initial = wait_for_leader(members, None)?;
    let initial_leader = members[initial].node.member_id().to_string();
    info!(leader = %initial_leader, cluster = %members[initial].node.service().cluster().id(), "initial leader elected");

    let expired_at = Instant::now();
    members[initial].session.expire();
    info!(member = %initial_leader, "expired leader session");

    let next = wait_for_leader(members, Some(initial))?;
    let failover = expired_at.elapsed();
    let final_leader = members[next].node.member_id().to_string();
    info!(leader = %final_leader, failover_ms = failover.as_millis() as u64, "leadership moved");

    Ok(DemoReport {
        initial_leader,
        final_leader,
        failover,
    })
}

/// Wait until exactly one member other than `excluding` leads and runs its
/// workload.
fn wait_for_leader(members: &[DemoNode], excluding: Option<usize>) -> anyhow::Result<usize> {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        let leaders: Vec<usize> = members
            .iter()
            .enumerate()
            .filter(|(_, member)| member.node.is_active_leader())
            .map(|(index, _)| index)
            .collect();

        if let [leader] = leaders[..]
            && Some(leader) != excluding
        {
            return Ok(leader);
        }

        if Instant::now() >= deadline {
            bail!("leadership did not settle within {SETTLE_TIMEOUT:?} (active leaders: {leaders:?})");
        }
        thread::sleep(POLL_INTERVAL);
    }
}
