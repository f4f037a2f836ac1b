//! Cluster services: the entry point handing out one view per namespace.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::ClusterError;
use crate::error::ClusterResult;
use crate::member::Cluster;
use crate::view::ClusterView;

/// Maximum namespace length in bytes.
const MAX_NAMESPACE_LEN: usize = 255;

/// Check that `namespace` can partition an election.
///
/// Namespaces become a single path segment in coordination backends, so they
/// must be non-empty, bounded, and free of `/` and whitespace.
pub fn validate_namespace(namespace: &str) -> ClusterResult<()> {
    let reason = if namespace.is_empty() {
        Some("namespace must not be empty")
    } else if namespace.len() > MAX_NAMESPACE_LEN {
        Some("namespace is longer than 255 bytes")
    } else if namespace.contains('/') {
        Some("namespace must not contain '/'")
    } else if namespace.chars().any(char::is_whitespace) {
        Some("namespace must not contain whitespace")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ClusterError::InvalidNamespace {
            namespace: namespace.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Builds backend-specific views for a [`ClusterServiceSupport`].
pub trait ClusterViewFactory: Send + Sync {
    /// Create (but do not start) the view for `namespace`.
    fn create_view(&self, cluster: &Cluster, namespace: &str) -> ClusterResult<Arc<dyn ClusterView>>;
}

/// Registry of cluster views, one per namespace.
pub trait ClusterService: Send + Sync {
    /// The cluster served.
    fn cluster(&self) -> &Cluster;

    /// Return the view for `namespace`, creating and starting it on first use.
    ///
    /// Repeated calls with the same namespace return the same `Arc`.
    ///
    /// # Errors
    ///
    /// Fails when the namespace is invalid, the service is stopped, or the
    /// backend cannot create or start the view.
    fn view(&self, namespace: &str) -> ClusterResult<Arc<dyn ClusterView>>;

    /// The started view for `namespace`, without creating one.
    fn find_view(&self, namespace: &str) -> Option<Arc<dyn ClusterView>>;

    /// Namespaces with a live view.
    fn namespaces(&self) -> Vec<String>;

    /// Stop every view. Later lookups fail with [`ClusterError::ServiceStopped`].
    fn stop(&self);

    /// Whether the local member is master of `namespace`.
    ///
    /// A namespace without a started view has no local member in its
    /// election, so the answer is `false` and nothing is joined.
    fn is_leader(&self, namespace: &str) -> ClusterResult<bool> {
        validate_namespace(namespace)?;
        Ok(self.find_view(namespace).is_some_and(|view| view.is_leader()))
    }
}

/// Serializes creation of one namespace's view.
type CreationSlot = Arc<Mutex<()>>;

enum Lookup {
    Started(Arc<dyn ClusterView>),
    Create(CreationSlot),
}

struct Views {
    by_namespace: BTreeMap<String, Arc<dyn ClusterView>>,
    creating: BTreeMap<String, CreationSlot>,
    stopped: bool,
}

/// Memoizing [`ClusterService`] over a [`ClusterViewFactory`].
///
/// Creation of a namespace runs under that namespace's slot, so two
/// concurrent first lookups build exactly one view and join the backend
/// once. The registry lock is only held for map access, so a slow join in
/// one namespace does not block lookups of another.
pub struct ClusterServiceSupport<F> {
    cluster: Cluster,
    factory: F,
    views: Mutex<Views>,
}

impl<F: ClusterViewFactory> ClusterServiceSupport<F> {
    /// Create a service for `cluster` backed by `factory`.
    pub fn new(cluster: Cluster, factory: F) -> Self {
        Self {
            cluster,
            factory,
            views: Mutex::new(Views {
                by_namespace: BTreeMap::new(),
                creating: BTreeMap::new(),
                stopped: false,
            }),
        }
    }

    /// The factory building views.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Whether [`ClusterService::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.views.lock().stopped
    }

    fn stopped_error(&self) -> ClusterError {
        ClusterError::ServiceStopped {
            cluster_id: self.cluster.id().to_string(),
        }
    }

    /// The started view, or the slot to create it under.
    fn lookup(&self, namespace: &str) -> ClusterResult<Lookup> {
        let mut views = self.views.lock();
        if views.stopped {
            return Err(self.stopped_error());
        }
        if let Some(view) = views.by_namespace.get(namespace) {
            return Ok(Lookup::Started(Arc::clone(view)));
        }
        Ok(Lookup::Create(Arc::clone(views.creating.entry(namespace.to_string()).or_default())))
    }
}

impl<F: ClusterViewFactory> ClusterService for ClusterServiceSupport<F> {
    fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    fn view(&self, namespace: &str) -> ClusterResult<Arc<dyn ClusterView>> {
        validate_namespace(namespace)?;

        let slot = match self.lookup(namespace)? {
            Lookup::Started(view) => return Ok(view),
            Lookup::Create(slot) => slot,
        };

        let _creating = slot.lock();
        // Another caller may have finished while this one waited on the slot.
        if let Lookup::Started(view) = self.lookup(namespace)? {
            return Ok(view);
        }

        debug!(cluster = %self.cluster, namespace, "creating cluster view");
        let view = self.factory.create_view(&self.cluster, namespace)?;

        if let Err(e) = view.start() {
            warn!(cluster = %self.cluster, namespace, error = %e, "cluster view failed to start");
            view.stop();
            return Err(e);
        }

        let mut views = self.views.lock();
        if views.stopped {
            drop(views);
            debug!(cluster = %self.cluster, namespace, "service stopped while view was starting");
            view.stop();
            return Err(self.stopped_error());
        }
        views.creating.remove(namespace);
        views.by_namespace.insert(namespace.to_string(), Arc::clone(&view));
        drop(views);

        info!(cluster = %self.cluster, namespace, "cluster view started");
        Ok(view)
    }

    fn find_view(&self, namespace: &str) -> Option<Arc<dyn ClusterView>> {
        self.views.lock().by_namespace.get(namespace).cloned()
    }

    fn namespaces(&self) -> Vec<String> {
        self.views.lock().by_namespace.keys().cloned().collect()
    }

    fn stop(&self) {
        let drained: Vec<(String, Arc<dyn ClusterView>)> = {
            let mut views = self.views.lock();
            if views.stopped {
                return;
            }
            views.stopped = true;
            views.creating.clear();
            std::mem::take(&mut views.by_namespace).into_iter().collect()
        };

        for (namespace, view) in drained {
            debug!(cluster = %self.cluster, namespace = %namespace, "stopping cluster view");
            view.stop();
        }
        info!(cluster = %self.cluster, "cluster service stopped");
    }
}

impl<F> Drop for ClusterServiceSupport<F> {
    fn drop(&mut self) {
        let views = self.views.get_mut();
        for view in views.by_namespace.values() {
            view.stop();
        }
    }
}
