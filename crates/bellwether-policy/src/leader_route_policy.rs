//! Leadership-gated workload lifecycle.
//!
//! A [`LeaderRoutePolicy`] keeps every workload registered with it stopped
//! unless the local member is the master of the policy's cluster view.
//!
//! # State
//!
//! - `leader`: atomic flag, flipped by compare-and-swap so a re-delivered
//!   leadership state causes no transition
//! - `started` / `stopped`: disjoint sets whose union is every registered
//!   workload, guarded by one mutex
//!
//! Reconciliation re-reads `leader` under the set mutex and applies whatever
//! the flag says at that moment. A flip that races an earlier transition is
//! therefore corrected by the reconciliation the flip itself triggers.
//!
//! Joining the view seeds `leader` from the view's current master. The seed
//! is dropped if a leadership event was delivered while the view was being
//! read: that event is at least as recent as the read.
//!
//! # Failures
//!
//! A workload whose `start` or `stop` fails is reported to the
//! [`ExceptionHandler`] and stays in the set it was in; the rest of the batch
//! proceeds. The next reconciliation (a leadership change, a new registration
//! or an explicit [`LeaderRoutePolicy::reconcile`]) retries it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use bellwether_cluster::ClusterEvent;
use bellwether_cluster::ClusterEventListener;
use bellwether_cluster::ClusterMember;
use bellwether_cluster::ClusterService;
use bellwether_cluster::ClusterView;
use bellwether_cluster::ReferenceCount;
use parking_lot::Mutex;
use snafu::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::PolicyError;
use crate::error::PolicyResult;
use crate::error::ViewSnafu;
use crate::workload::ExceptionHandler;
use crate::workload::LoggingExceptionHandler;
use crate::workload::Workload;
use crate::workload::WorkloadAction;

type Workloads = BTreeMap<String, Arc<dyn Workload>>;

#[derive(Default)]
struct WorkloadSets {
    started: Workloads,
    stopped: Workloads,
}

struct PolicyInner {
    this: Weak<PolicyInner>,
    view: Arc<dyn ClusterView>,
    leader: AtomicBool,
    /// Leadership events delivered so far. Serializes event flips with seeding.
    leadership_events: Mutex<u64>,
    workloads: Mutex<WorkloadSets>,
    ref_count: ReferenceCount<PolicyError>,
    listener: Mutex<Option<Arc<dyn ClusterEventListener>>>,
    exception_handler: Arc<dyn ExceptionHandler>,
}

/// Starts managed workloads only while the local member leads the view.
///
/// Cheap to clone; clones share state. Call [`shutdown`](Self::shutdown) to
/// detach from the view. Neither `shutdown` nor the policy's own callbacks may
/// run inside a listener of the same view.
#[derive(Clone)]
pub struct LeaderRoutePolicy {
    inner: Arc<PolicyInner>,
}

impl LeaderRoutePolicy {
    /// Policy over `view`, logging workload failures.
    pub fn new(view: Arc<dyn ClusterView>) -> Self {
        Self::with_exception_handler(view, Arc::new(LoggingExceptionHandler))
    }

    /// Policy over `view` reporting workload failures to `exception_handler`.
    pub fn with_exception_handler(view: Arc<dyn ClusterView>, exception_handler: Arc<dyn ExceptionHandler>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<PolicyInner>| {
            let on_first = weak.clone();
            let on_last = weak.clone();
            let ref_count = ReferenceCount::on(
                move || match on_first.upgrade() {
                    Some(inner) => inner.join_view(),
                    None => Ok(()),
                },
                move || {
                    if let Some(inner) = on_last.upgrade() {
                        inner.leave_view();
                    }
                    Ok(())
                },
            );

            PolicyInner {
                this: weak.clone(),
                view,
                leader: AtomicBool::new(false),
                leadership_events: Mutex::new(0),
                workloads: Mutex::new(WorkloadSets::default()),
                ref_count,
                listener: Mutex::new(None),
                exception_handler,
            }
        });

        Self { inner }
    }

    /// Policy over the view `service` holds for `namespace`.
    pub fn for_namespace(service: &dyn ClusterService, namespace: &str) -> PolicyResult<Self> {
        let view = service.view(namespace).context(ViewSnafu { namespace })?;
        Ok(Self::new(view))
    }

    /// Take over a workload.
    ///
    /// Disables its auto-startup, records it as stopped, joins the view on the
    /// first registration and reconciles. A second workload with an id that
    /// is already managed is ignored.
    ///
    /// # Errors
    ///
    /// [`PolicyError::Join`] if the view is not running; the workload is not
    /// registered in that case.
    pub fn on_init(&self, workload: Arc<dyn Workload>) -> PolicyResult<()> {
        let inner = &self.inner;
        let id = workload.id().to_string();
        workload.set_auto_startup(false);

        {
            let mut sets = inner.workloads.lock();
            if sets.started.contains_key(&id) || sets.stopped.contains_key(&id) {
                warn!(namespace = %inner.view.namespace(), workload = %id, "workload already managed, ignoring");
                return Ok(());
            }
            sets.stopped.insert(id.clone(), workload);
        }

        // A join that failed still holds a count, so a later retain can
        // succeed without a listener behind it.
        let joined = inner.ref_count.retain().and_then(|()| {
            if inner.listener.lock().is_some() {
                Ok(())
            } else {
                Err(PolicyError::Join {
                    namespace: inner.view.namespace().to_string(),
                })
            }
        });
        if let Err(e) = joined {
            inner.workloads.lock().stopped.remove(&id);
            if let Err(release_err) = inner.ref_count.release() {
                warn!(workload = %id, error = %release_err, "failed to undo registration");
            }
            return Err(e);
        }

        debug!(namespace = %inner.view.namespace(), workload = %id, "workload registered");
        inner.reconcile();
        Ok(())
    }

    /// Stop managing a workload, returning it as-is (it is not stopped).
    ///
    /// Leaves the view when the last workload is removed.
    pub fn on_remove(&self, workload_id: &str) -> Option<Arc<dyn Workload>> {
        let inner = &self.inner;
        let removed = {
            let mut sets = inner.workloads.lock();
            sets.started.remove(workload_id).or_else(|| sets.stopped.remove(workload_id))
        };

        if removed.is_some() {
            debug!(namespace = %inner.view.namespace(), workload = %workload_id, "workload removed");
            if let Err(e) = inner.ref_count.release() {
                warn!(workload = %workload_id, error = %e, "failed to release view registration");
            }
        }
        removed
    }

    /// Forget every workload and leave the view.
    ///
    /// Workloads keep whatever state they are in; the host owns shutting
    /// them down.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let released = {
            let mut sets = inner.workloads.lock();
            let count = sets.started.len() + sets.stopped.len();
            sets.started.clear();
            sets.stopped.clear();
            count
        };

        for _ in 0..released {
            if let Err(e) = inner.ref_count.release() {
                warn!(namespace = %inner.view.namespace(), error = %e, "failed to release view registration");
            }
        }
        info!(namespace = %inner.view.namespace(), workloads = released, "leader route policy shut down");
    }

    /// Apply the current leadership flag to every managed workload.
    pub fn reconcile(&self) {
        self.inner.reconcile();
    }

    /// Whether this policy currently considers the local member the leader.
    pub fn is_leader(&self) -> bool {
        self.inner.leader.load(Ordering::SeqCst)
    }

    /// Ids of started workloads, sorted.
    pub fn started_workloads(&self) -> Vec<String> {
        self.inner.workloads.lock().started.keys().cloned().collect()
    }

    /// Ids of stopped workloads, sorted.
    pub fn stopped_workloads(&self) -> Vec<String> {
        self.inner.workloads.lock().stopped.keys().cloned().collect()
    }

    /// The view this policy follows.
    pub fn view(&self) -> &Arc<dyn ClusterView> {
        &self.inner.view
    }
}

impl std::fmt::Debug for LeaderRoutePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderRoutePolicy")
            .field("namespace", &self.inner.view.namespace())
            .field("leader", &self.is_leader())
            .field("started", &self.started_workloads())
            .field("stopped", &self.stopped_workloads())
            .finish()
    }
}

impl PolicyInner {
    fn join_view(&self) -> PolicyResult<()> {
        let namespace = self.view.namespace();
        if !self.view.is_running() {
            return Err(PolicyError::Join {
                namespace: namespace.to_string(),
            });
        }

        let weak = self.this.clone();
        let listener: Arc<dyn ClusterEventListener> = Arc::new(move |event: &ClusterEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_leadership_changed(event);
            }
        });
        let delivered = *self.leadership_events.lock();
        self.view.add_filtered_event_listener(Arc::new(ClusterEvent::is_leadership_changed), Arc::clone(&listener));
        *self.listener.lock() = Some(listener);

        let leader = self.view.is_leader();
        let seeded = {
            let events = self.leadership_events.lock();
            if *events == delivered {
                self.leader.store(leader, Ordering::SeqCst);
                true
            } else {
                false
            }
        };

        if seeded {
            info!(namespace = %namespace, leader, "leader route policy joined cluster view");
        } else {
            info!(
                namespace = %namespace,
                leader = self.leader.load(Ordering::SeqCst),
                "leader route policy joined cluster view, leadership taken from concurrent event"
            );
        }
        Ok(())
    }

    fn leave_view(&self) {
        if let Some(listener) = self.listener.lock().take() {
            self.view.remove_event_listener(&listener);
        }
        self.leader.store(false, Ordering::SeqCst);
        info!(namespace = %self.view.namespace(), "leader route policy left cluster view");
    }

    fn on_leadership_changed(&self, event: &ClusterEvent) {
        let ClusterEvent::LeadershipChanged { master } = event else {
            return;
        };

        let leader = master.as_ref().is_some_and(ClusterMember::is_local);
        let flipped = {
            let mut events = self.leadership_events.lock();
            *events += 1;
            self.leader.compare_exchange(!leader, leader, Ordering::SeqCst, Ordering::SeqCst).is_ok()
        };
        if !flipped {
            debug!(namespace = %self.view.namespace(), leader, "leadership unchanged");
            return;
        }

        info!(
            namespace = %self.view.namespace(),
            master = ?master.as_ref().map(|master| master.id()),
            leader,
            "leadership changed"
        );
        self.reconcile();
    }

    fn reconcile(&self) {
        let mut sets = self.workloads.lock();
        let WorkloadSets { started, stopped } = &mut *sets;
        // Read under the set mutex: the flag may have flipped since the caller looked.
        if self.leader.load(Ordering::SeqCst) {
            self.transition(WorkloadAction::Start, stopped, started);
        } else {
            self.transition(WorkloadAction::Stop, started, stopped);
        }
    }

    fn transition(&self, action: WorkloadAction, from: &mut Workloads, to: &mut Workloads) {
        let pending: Vec<String> = from.keys().cloned().collect();
        for id in pending {
            let Some(workload) = from.get(&id).map(Arc::clone) else {
                continue;
            };

            let result = match action {
                WorkloadAction::Start => workload.start(),
                WorkloadAction::Stop => workload.stop(),
            };

            match result {
                Ok(()) => {
                    from.remove(&id);
                    info!(namespace = %self.view.namespace(), workload = %id, action = %action, "workload transitioned");
                    to.insert(id, workload);
                }
                Err(e) => self.exception_handler.handle_exception(action, &id, &e),
            }
        }
    }
}
