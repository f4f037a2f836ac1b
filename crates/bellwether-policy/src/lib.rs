//! Leadership-gated workload lifecycle.
//!
//! A [`LeaderRoutePolicy`] follows one cluster view and keeps its workloads
//! running only on the member the view reports as master:
//!
//! - `Workload` - What the host hands over: an id plus start/stop
//! - `ExceptionHandler` - Where failed transitions are reported
//! - `LeaderRoutePolicy` - The leader/not-leader state machine
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use bellwether_policy::LeaderRoutePolicy;
//!
//! let policy = LeaderRoutePolicy::for_namespace(&service, "orders")?;
//! policy.on_init(Arc::new(order_consumer))?;
//!
//! // Later, from the management surface
//! if policy.is_leader() {
//!     println!("running: {:?}", policy.started_workloads());
//! }
//! ```

mod error;
mod leader_route_policy;
mod workload;

pub use error::PolicyError;
pub use error::PolicyResult;
pub use leader_route_policy::LeaderRoutePolicy;
pub use workload::ExceptionHandler;
pub use workload::LoggingExceptionHandler;
pub use workload::Workload;
pub use workload::WorkloadAction;
