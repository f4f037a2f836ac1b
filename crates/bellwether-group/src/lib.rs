//! Leader election and membership over a hierarchical coordination service.
//!
//! Each participant joins a group by creating one ephemeral sequential node
//! under a shared path; the lowest sequence number is the master. This crate
//! provides:
//!
//! - `CoordinationClient` - The small ZooKeeper-shaped client surface the algorithm needs
//! - `InMemoryEnsemble` - An in-process coordination service with sessions and fault hooks
//! - `Group` - Membership tracking, leader election, rejoin after session loss
//! - `GroupClusterView` - A `ClusterView` whose events come from a `Group`
//! - `GroupClusterService` - One group-backed view per namespace
//! - `ZooKeeperClient` - A `CoordinationClient` over a ZooKeeper ensemble (feature `zookeeper`)
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use bellwether_cluster::{Cluster, ClusterService};
//! use bellwether_group::{GroupConfig, InMemoryEnsemble, group_cluster_service};
//!
//! let ensemble = InMemoryEnsemble::new();
//! let service = group_cluster_service(
//!     Cluster::new("payments"),
//!     ensemble.connect()?,
//!     GroupConfig::default(),
//!     "node-1",
//! )?;
//!
//! let view = service.view("orders")?;
//! assert!(view.is_leader());
//! ```

pub mod client;
pub mod config;
pub mod constants;
mod error;
mod group;
mod in_memory;
mod node_state;
pub mod pure;
mod service;
mod snapshot;
mod view;
#[cfg(feature = "zookeeper")]
pub mod zookeeper_client;

pub use client::CoordinationClient;
pub use client::CreateMode;
pub use client::SessionCallback;
pub use client::SessionEvent;
pub use client::WatchCallback;
pub use client::WatchEventKind;
pub use client::WatchedEvent;
pub use config::ConfigError;
pub use config::GroupConfig;
pub use error::CoordinationError;
pub use error::CoordinationResult;
pub use error::GroupError;
pub use error::GroupResult;
pub use group::Group;
pub use group::GroupEvent;
pub use group::GroupListener;
pub use in_memory::InMemoryEnsemble;
pub use in_memory::InMemorySession;
pub use node_state::MemberState;
pub use node_state::NodeState;
pub use node_state::decode_state;
pub use node_state::encode_state;
pub use service::GroupClusterService;
pub use service::GroupViewFactory;
pub use service::group_cluster_service;
pub use snapshot::ChildData;
pub use snapshot::GroupData;
pub use view::GroupClusterView;
#[cfg(feature = "zookeeper")]
pub use zookeeper_client::ZooKeeperClient;
