//! Cluster membership, leader election and leadership-gated workloads.
//!
//! The work is split across three crates, re-exported here:
//!
//! - [`cluster`] - Backend-neutral views, events, listeners and services
//! - [`group`] - Election over a hierarchical coordination service
//! - [`policy`] - Starting and stopping workloads as leadership moves
//!
//! This crate adds node configuration, the per-process node runtime and an
//! in-process failover demo.

pub mod config;
pub mod demo;
pub mod node;

pub use bellwether_cluster as cluster;
pub use bellwether_group as group;
pub use bellwether_policy as policy;
pub use config::NodeConfig;
