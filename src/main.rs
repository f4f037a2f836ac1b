//! bellwether command-line entry point.
//!
//! - `bellwether demo` runs an in-process failover demonstration
//! - `bellwether run` joins the configured group (needs the `zookeeper` feature)
//! - `bellwether check-config` resolves and validates a node configuration

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use bellwether::config::NodeConfig;
use bellwether::demo::run_demo;
use bellwether::node::Node;
use bellwether::node::connect_backend;
use bellwether::node::run_node;
use clap::Parser;
use clap::Subcommand;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bellwether")]
#[command(about = "Cluster membership, leader election and leadership-gated workloads")]
struct Args {
    /// Path to TOML configuration file.
    #[arg(long, global = true, env = "BELLWETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Election namespace (overrides config and environment).
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// Member identity (overrides config and environment).
    #[arg(long, global = true)]
    member_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Elect a leader among in-process nodes, then expire its session.
    Demo {
        /// Number of in-process nodes.
        #[arg(long, default_value_t = 3)]
        nodes: usize,
    },

    /// Join the configured group and run the namespace's workload while leader.
    Run {
        /// Stop after this many seconds; runs until killed when omitted.
        #[arg(long)]
        duration_secs: Option<u64>,

        /// How often leadership is sampled for logging, in milliseconds.
        #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
        poll_ms: u64,
    },

    /// Print the resolved configuration after validating it.
    CheckConfig,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = build_config(&args)?;

    match args.command {
        Command::Demo { nodes } => {
            let report = run_demo(&config, nodes)?;
            info!(
                initial_leader = %report.initial_leader,
                final_leader = %report.final_leader,
                failover_ms = report.failover.as_millis() as u64,
                "demo complete"
            );
        }
        Command::Run { duration_secs, poll_ms } => {
            let client = connect_backend(&config)?;
            let node = Node::start(client, &config, config.member_id.clone())?;
            let report = run_node(&node, duration_secs.map(Duration::from_secs), Duration::from_millis(poll_ms));
            node.shutdown();
            info!(
                member = %node.member_id(),
                leadership_changes = report.leadership_changes,
                leader_at_exit = report.leader_at_exit,
                "run complete"
            );
        }
        Command::CheckConfig => {
            let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;
            println!("{rendered}");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

/// Layer CLI arguments over file and environment configuration.
fn build_config(args: &Args) -> anyhow::Result<NodeConfig> {
    let mut config = NodeConfig::load(args.config.as_deref())?;

    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(member_id) = &args.member_id {
        config.member_id = member_id.clone();
    }

    config.validate()?;
    Ok(config)
}
