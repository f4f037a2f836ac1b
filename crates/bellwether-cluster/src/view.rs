//! Per-namespace cluster views and their listener registry.
//!
//! A [`ClusterView`] is the only surface other subsystems use to react to
//! cluster state. Backends own an [`EventListenerRegistry`] and call
//! [`EventListenerRegistry::fire_event`] after updating the snapshot that
//! `master()`/`members()` return, so a listener that queries the view from its
//! callback already observes the new state.
//!
//! # Locking
//!
//! Registrations live behind a single read/write lock. Adding or removing a
//! listener takes the write lock; dispatch takes the read lock for the whole
//! loop, so several event sources may dispatch concurrently while mutation
//! waits. The lock is not re-entrant: a listener must not add or remove
//! registrations on the same view from inside its callback.

use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;
use tracing::trace;

use crate::error::ClusterResult;
use crate::event::ClusterEvent;
use crate::member::Cluster;
use crate::member::ClusterMember;

/// Receives events published by a view.
///
/// Implemented for every `Fn(&ClusterEvent)` closure. Listener identity for
/// removal is the `Arc` allocation, so keep the `Arc` you registered.
pub trait ClusterEventListener: Send + Sync {
    /// Handle one event. Called on the backend's notification thread.
    fn on_event(&self, event: &ClusterEvent);
}

impl<F> ClusterEventListener for F
where
    F: Fn(&ClusterEvent) + Send + Sync,
{
    fn on_event(&self, event: &ClusterEvent) {
        self(event)
    }
}

/// Filter deciding whether a registration receives an event.
pub type EventPredicate = Arc<dyn Fn(&ClusterEvent) -> bool + Send + Sync>;

struct Registration {
    predicate: EventPredicate,
    listener: Arc<dyn ClusterEventListener>,
}

fn same_listener(a: &Arc<dyn ClusterEventListener>, b: &Arc<dyn ClusterEventListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Ordered `(predicate, listener)` registrations with isolated dispatch.
#[derive(Default)]
pub struct EventListenerRegistry {
    registrations: RwLock<Vec<Registration>>,
}

impl EventListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener that receives every event.
    pub fn add(&self, listener: Arc<dyn ClusterEventListener>) {
        self.add_filtered(Arc::new(|_: &ClusterEvent| true), listener);
    }

    /// Register a listener that receives events accepted by `predicate`.
    pub fn add_filtered(&self, predicate: EventPredicate, listener: Arc<dyn ClusterEventListener>) {
        self.registrations.write().push(Registration { predicate, listener });
    }

    /// Remove every registration of `listener`, whatever its predicate.
    ///
    /// Returns the number of registrations removed.
    pub fn remove(&self, listener: &Arc<dyn ClusterEventListener>) -> usize {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|registration| !same_listener(&registration.listener, listener));
        before - registrations.len()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every registration whose predicate accepts it, in
    /// insertion order.
    ///
    /// A panicking predicate or listener is reported and skipped; the
    /// remaining registrations still receive the event. Returns the number of
    /// listeners that were invoked.
    pub fn fire_event(&self, event: &ClusterEvent) -> usize {
        let registrations = self.registrations.read();
        let mut delivered = 0;

        for (index, registration) in registrations.iter().enumerate() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                if (registration.predicate)(event) {
                    registration.listener.on_event(event);
                    true
                } else {
                    false
                }
            }));

            match outcome {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(payload) => {
                    delivered += 1;
                    error!(
                        listener = index,
                        event = ?event.kind(),
                        panic = panic_message(payload.as_ref()),
                        "cluster event listener panicked"
                    );
                }
            }
        }

        trace!(event = ?event.kind(), delivered, "cluster event dispatched");
        delivered
    }
}

impl std::fmt::Debug for EventListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListenerRegistry").field("registrations", &self.len()).finish()
    }
}

/// Membership and leadership of one namespace within a cluster.
///
/// Exactly one view exists per (cluster, namespace) for the lifetime of the
/// owning [`ClusterService`](crate::ClusterService).
pub trait ClusterView: Send + Sync {
    /// The cluster this view belongs to.
    fn cluster(&self) -> &Cluster;

    /// The namespace partitioning this view's election.
    fn namespace(&self) -> &str;

    /// Current master, `None` while unknown.
    fn master(&self) -> Option<ClusterMember>;

    /// The member representing this process.
    fn local_member(&self) -> ClusterMember;

    /// Current members, master first.
    fn members(&self) -> Vec<ClusterMember>;

    /// Listener registry backing the event methods.
    fn listeners(&self) -> &EventListenerRegistry;

    /// Join the backend. Called once by the owning service.
    fn start(&self) -> ClusterResult<()>;

    /// Leave the backend. Idempotent; no dispatch happens afterwards.
    fn stop(&self);

    /// Whether the view has been started and not stopped.
    fn is_running(&self) -> bool;

    /// Register a listener for every event.
    fn add_event_listener(&self, listener: Arc<dyn ClusterEventListener>) {
        self.listeners().add(listener);
    }

    /// Register a listener for events accepted by `predicate`.
    fn add_filtered_event_listener(&self, predicate: EventPredicate, listener: Arc<dyn ClusterEventListener>) {
        self.listeners().add_filtered(predicate, listener);
    }

    /// Remove all registrations of `listener`.
    fn remove_event_listener(&self, listener: &Arc<dyn ClusterEventListener>) {
        self.listeners().remove(listener);
    }

    /// Number of registered listeners.
    fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    /// Whether the local member is the current master.
    ///
    /// Decided by the master's `local` flag, which backends set from their
    /// own-node identity rather than from member ids.
    fn is_leader(&self) -> bool {
        self.master().is_some_and(|master| master.is_local())
    }
}
