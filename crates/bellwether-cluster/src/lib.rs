//! Cluster coordination contracts.
//!
//! This crate provides the backend-independent half of cluster coordination:
//!
//! - `ReferenceCount` - Run an action on the first retain and another on the last release
//! - `ClusterMember` - Identity of a peer plus whether it is this process
//! - `ClusterEvent` - Closed set of events a view publishes to its listeners
//! - `ClusterView` - Per-namespace event bus with membership and leadership snapshot
//! - `ClusterService` - Memoizing registry handing out one view per namespace
//!
//! Concrete backends (see `bellwether-group`) implement [`ClusterView`] and a
//! [`ClusterViewFactory`]; applications only ever talk to the traits.
//!
//! ## Listener Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use bellwether_cluster::{ClusterEvent, ClusterView};
//!
//! let view = service.view("orders")?;
//!
//! let listener: Arc<dyn ClusterEventListener> = Arc::new(|event: &ClusterEvent| {
//!     if let ClusterEvent::LeadershipChanged { master } = event {
//!         println!("new master: {:?}", master);
//!     }
//! });
//! view.add_filtered_event_listener(Arc::new(ClusterEvent::is_leadership_changed), listener.clone());
//!
//! // Later
//! view.remove_event_listener(&listener);
//! ```

mod error;
mod event;
mod member;
mod reference_count;
mod service;
mod view;

pub use error::BoxError;
pub use error::ClusterError;
pub use error::ClusterResult;
pub use event::ClusterEvent;
pub use event::ClusterEventKind;
pub use member::Cluster;
pub use member::ClusterMember;
pub use reference_count::ReferenceCount;
pub use service::ClusterService;
pub use service::ClusterServiceSupport;
pub use service::ClusterViewFactory;
pub use service::validate_namespace;
pub use view::ClusterEventListener;
pub use view::ClusterView;
pub use view::EventListenerRegistry;
pub use view::EventPredicate;
