//! In-process coordination service.
//!
//! [`InMemoryEnsemble`] implements the ZooKeeper data model closely enough to
//! run the group algorithm without an external service: a node tree with
//! persistent, ephemeral and sequential nodes, one-shot data and children
//! watches, and sessions whose expiry removes their ephemeral nodes.
//!
//! Each [`InMemorySession`] owns a notification thread. Watches and session
//! events for that session are queued while the tree lock is held and run on
//! that thread in order, so callbacks never run under the tree lock and may
//! call back into the session freely.
//!
//! Fault hooks on the session (`disconnect`, `reconnect`, `expire`) let tests
//! drive the reconnect paths deterministically.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::client::CoordinationClient;
use crate::client::CreateMode;
use crate::client::SessionCallback;
use crate::client::SessionEvent;
use crate::client::WatchCallback;
use crate::client::WatchEventKind;
use crate::client::WatchedEvent;
use crate::client::parent_path;
use crate::client::validate_path;
use crate::constants::MAX_NODE_DATA_SIZE;
use crate::constants::SEQUENCE_WIDTH;
use crate::error::CoordinationError;
use crate::error::CoordinationResult;

struct Node {
    data: Vec<u8>,
    ephemeral_owner: Option<u64>,
    next_sequence: u64,
}

struct Watch {
    session: u64,
    callback: WatchCallback,
}

type Fired = Vec<(Watch, WatchedEvent)>;

struct Tree {
    nodes: BTreeMap<String, Node>,
    child_watches: HashMap<String, Vec<Watch>>,
    data_watches: HashMap<String, Vec<Watch>>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node {
            data: Vec::new(),
            ephemeral_owner: None,
            next_sequence: 0,
        });
        Self {
            nodes,
            child_watches: HashMap::new(),
            data_watches: HashMap::new(),
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn add_watch(watches: &mut HashMap<String, Vec<Watch>>, path: &str, session: u64, callback: WatchCallback) {
        let registered = watches.entry(path.to_string()).or_default();
        let duplicate = registered.iter().any(|watch| {
            watch.session == session && std::ptr::addr_eq(Arc::as_ptr(&watch.callback), Arc::as_ptr(&callback))
        });
        if !duplicate {
            registered.push(Watch { session, callback });
        }
    }

    fn trigger(watches: &mut HashMap<String, Vec<Watch>>, path: &str, kind: WatchEventKind, fired: &mut Fired) {
        if let Some(triggered) = watches.remove(path) {
            for watch in triggered {
                fired.push((watch, WatchedEvent {
                    kind,
                    path: path.to_string(),
                }));
            }
        }
    }

    fn check_size(path: &str, data: &[u8]) -> CoordinationResult<()> {
        if data.len() > MAX_NODE_DATA_SIZE {
            return Err(CoordinationError::PayloadTooLarge {
                path: path.to_string(),
                size: data.len(),
                max: MAX_NODE_DATA_SIZE,
            });
        }
        Ok(())
    }

    fn create(
        &mut self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        session: u64,
    ) -> CoordinationResult<(String, Fired)> {
        validate_path(path)?;
        Self::check_size(path, data)?;
        if path == "/" {
            return Err(CoordinationError::NodeExists { path: path.to_string() });
        }

        let parent = parent_path(path).to_string();
        let Some(parent_node) = self.nodes.get_mut(&parent) else {
            return Err(CoordinationError::NoNode { path: parent });
        };
        if parent_node.ephemeral_owner.is_some() {
            return Err(CoordinationError::Backend {
                message: format!("ephemeral node '{parent}' cannot have children"),
            });
        }

        let actual = if mode.is_sequential() {
            let sequence = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{path}{sequence:0width$}", width = SEQUENCE_WIDTH)
        } else {
            path.to_string()
        };

        if self.nodes.contains_key(&actual) {
            return Err(CoordinationError::NodeExists { path: actual });
        }

        self.nodes.insert(actual.clone(), Node {
            data: data.to_vec(),
            ephemeral_owner: mode.is_ephemeral().then_some(session),
            next_sequence: 0,
        });

        let mut fired = Vec::new();
        Self::trigger(&mut self.child_watches, &parent, WatchEventKind::NodeChildrenChanged, &mut fired);
        Ok((actual, fired))
    }

    fn delete(&mut self, path: &str) -> CoordinationResult<Fired> {
        validate_path(path)?;
        if path == "/" {
            return Err(CoordinationError::InvalidPath {
                path: path.to_string(),
                reason: "the root cannot be deleted".to_string(),
            });
        }
        if !self.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode { path: path.to_string() });
        }
        if !self.children(path).is_empty() {
            return Err(CoordinationError::NotEmpty { path: path.to_string() });
        }

        self.nodes.remove(path);

        let mut fired = Vec::new();
        Self::trigger(&mut self.data_watches, path, WatchEventKind::NodeDeleted, &mut fired);
        Self::trigger(&mut self.child_watches, path, WatchEventKind::NodeDeleted, &mut fired);
        Self::trigger(&mut self.child_watches, parent_path(path), WatchEventKind::NodeChildrenChanged, &mut fired);
        Ok(fired)
    }

    fn set_data(&mut self, path: &str, data: &[u8]) -> CoordinationResult<Fired> {
        validate_path(path)?;
        Self::check_size(path, data)?;
        let Some(node) = self.nodes.get_mut(path) else {
            return Err(CoordinationError::NoNode { path: path.to_string() });
        };
        node.data = data.to_vec();

        let mut fired = Vec::new();
        Self::trigger(&mut self.data_watches, path, WatchEventKind::NodeDataChanged, &mut fired);
        Ok(fired)
    }

    fn get_data(&mut self, path: &str, session: u64, watch: Option<WatchCallback>) -> CoordinationResult<Vec<u8>> {
        validate_path(path)?;
        let Some(node) = self.nodes.get(path) else {
            return Err(CoordinationError::NoNode { path: path.to_string() });
        };
        let data = node.data.clone();
        if let Some(callback) = watch {
            Self::add_watch(&mut self.data_watches, path, session, callback);
        }
        Ok(data)
    }

    fn get_children(
        &mut self,
        path: &str,
        session: u64,
        watch: Option<WatchCallback>,
    ) -> CoordinationResult<Vec<String>> {
        validate_path(path)?;
        if !self.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode { path: path.to_string() });
        }
        let children = self.children(path);
        if let Some(callback) = watch {
            Self::add_watch(&mut self.child_watches, path, session, callback);
        }
        Ok(children)
    }

    /// Drop a session's watches, then delete its ephemeral nodes.
    fn remove_session(&mut self, session: u64) -> Fired {
        for watches in self.child_watches.values_mut() {
            watches.retain(|watch| watch.session != session);
        }
        for watches in self.data_watches.values_mut() {
            watches.retain(|watch| watch.session != session);
        }

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();

        let mut fired = Vec::new();
        for path in owned {
            match self.delete(&path) {
                Ok(mut triggered) => fired.append(&mut triggered),
                Err(e) => warn!(path = %path, error = %e, "failed to remove ephemeral node"),
            }
        }
        fired
    }
}

pub(crate) enum Delivery {
    Watch(WatchCallback, WatchedEvent),
    Session(SessionEvent),
}

type Routes = HashMap<u64, mpsc::Sender<Delivery>>;

struct EnsembleShared {
    tree: Mutex<Tree>,
    routes: Mutex<Routes>,
    next_session_id: AtomicU64,
}

impl EnsembleShared {
    fn deliver(routes: &Routes, fired: Fired) {
        for (watch, event) in fired {
            match routes.get(&watch.session) {
                Some(sender) => {
                    let _ = sender.send(Delivery::Watch(watch.callback, event));
                }
                None => trace!(session = watch.session, "dropping watch of ended session"),
            }
        }
    }
}

/// An in-process coordination service shared by any number of sessions.
#[derive(Clone)]
pub struct InMemoryEnsemble {
    shared: Arc<EnsembleShared>,
}

impl Default for InMemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEnsemble {
    /// Create an empty ensemble containing only the root node.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(EnsembleShared {
                tree: Mutex::new(Tree::new()),
                routes: Mutex::new(HashMap::new()),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new connected session.
    ///
    /// # Errors
    ///
    /// Fails if the session's notification thread cannot be spawned.
    pub fn connect(&self) -> CoordinationResult<Arc<InMemorySession>> {
        let (sender, receiver) = mpsc::channel();
        let listeners: Arc<RwLock<Vec<SessionCallback>>> = Arc::new(RwLock::new(Vec::new()));
        let session_id = self.shared.next_session_id.fetch_add(1, Ordering::SeqCst);

        let worker_listeners = Arc::clone(&listeners);
        let worker = thread::Builder::new()
            .name(format!("coordination-session-{session_id}"))
            .spawn(move || run_notifications(receiver, worker_listeners))
            .map_err(|e| CoordinationError::Backend {
                message: format!("failed to spawn session thread: {e}"),
            })?;

        self.shared.routes.lock().insert(session_id, sender.clone());
        debug!(session = session_id, "in-memory session opened");

        Ok(Arc::new(InMemorySession {
            shared: Arc::clone(&self.shared),
            session_id: AtomicU64::new(session_id),
            status: Mutex::new(SessionStatus::Connected),
            listeners,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// Child names of `path`, sorted; empty if the node does not exist.
    pub fn children(&self, path: &str) -> Vec<String> {
        let tree = self.shared.tree.lock();
        if tree.nodes.contains_key(path) { tree.children(path) } else { Vec::new() }
    }

    /// Whether a node exists.
    pub fn exists(&self, path: &str) -> bool {
        self.shared.tree.lock().nodes.contains_key(path)
    }

    /// Data of a node, if it exists.
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.shared.tree.lock().nodes.get(path).map(|node| node.data.clone())
    }

    /// Overwrite a node's data as an out-of-band writer would.
    pub fn write(&self, path: &str, data: &[u8]) -> CoordinationResult<()> {
        let mut tree = self.shared.tree.lock();
        let fired = tree.set_data(path, data)?;
        EnsembleShared::deliver(&self.shared.routes.lock(), fired);
        Ok(())
    }

    /// Delete a node as an out-of-band writer would.
    pub fn remove(&self, path: &str) -> CoordinationResult<()> {
        let mut tree = self.shared.tree.lock();
        let fired = tree.delete(path)?;
        EnsembleShared::deliver(&self.shared.routes.lock(), fired);
        Ok(())
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.shared.routes.lock().len()
    }
}

fn invoke(what: &'static str, callback: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        warn!(callback = what, "coordination callback panicked");
    }
}

pub(crate) fn run_notifications(receiver: mpsc::Receiver<Delivery>, listeners: Arc<RwLock<Vec<SessionCallback>>>) {
    for delivery in receiver {
        match delivery {
            Delivery::Watch(callback, event) => {
                trace!(path = %event.path, kind = ?event.kind, "delivering watch");
                invoke("watch", || callback(event));
            }
            Delivery::Session(event) => {
                let snapshot: Vec<SessionCallback> = listeners.read().clone();
                for listener in snapshot {
                    invoke("session listener", || listener(event));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Connected,
    Disconnected,
    Closed,
}

/// A client session of an [`InMemoryEnsemble`].
pub struct InMemorySession {
    shared: Arc<EnsembleShared>,
    session_id: AtomicU64,
    status: Mutex<SessionStatus>,
    listeners: Arc<RwLock<Vec<SessionCallback>>>,
    sender: Mutex<Option<mpsc::Sender<Delivery>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InMemorySession {
    /// Current session id. Changes after [`expire`](Self::expire).
    pub fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::SeqCst)
    }

    fn notify(&self, event: SessionEvent) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(Delivery::Session(event));
        }
    }

    /// Must be called with the tree lock held.
    fn check_open(&self) -> CoordinationResult<u64> {
        match *self.status.lock() {
            SessionStatus::Connected => Ok(self.session_id()),
            SessionStatus::Disconnected => Err(CoordinationError::ConnectionLoss),
            SessionStatus::Closed => Err(CoordinationError::Closed),
        }
    }

    fn mutate<R>(&self, op: impl FnOnce(&mut Tree, u64) -> CoordinationResult<(R, Fired)>) -> CoordinationResult<R> {
        let mut tree = self.shared.tree.lock();
        let session = self.check_open()?;
        let (result, fired) = op(&mut tree, session)?;
        if !fired.is_empty() {
            EnsembleShared::deliver(&self.shared.routes.lock(), fired);
        }
        Ok(result)
    }

    /// Drop the connection without ending the session.
    ///
    /// Ephemeral nodes survive; calls fail with `ConnectionLoss` until
    /// [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        {
            let mut status = self.status.lock();
            if *status != SessionStatus::Connected {
                return;
            }
            *status = SessionStatus::Disconnected;
        }
        info!(session = self.session_id(), "in-memory session disconnected");
        self.notify(SessionEvent::Disconnected);
    }

    /// Restore a dropped connection within the session timeout.
    pub fn reconnect(&self) {
        {
            let mut status = self.status.lock();
            if *status != SessionStatus::Disconnected {
                return;
            }
            *status = SessionStatus::Connected;
        }
        info!(session = self.session_id(), "in-memory session reconnected");
        self.notify(SessionEvent::Connected);
    }

    /// Expire the session and immediately establish a fresh one.
    ///
    /// The old session's ephemeral nodes and watches are removed, then
    /// listeners observe `Expired` followed by `Connected`.
    pub fn expire(&self) {
        let (old, new) = {
            let mut tree = self.shared.tree.lock();
            let mut status = self.status.lock();
            if *status == SessionStatus::Closed {
                return;
            }

            let old = self.session_id();
            let fired = tree.remove_session(old);
            let new = self.shared.next_session_id.fetch_add(1, Ordering::SeqCst);

            let mut routes = self.shared.routes.lock();
            routes.remove(&old);
            if let Some(sender) = self.sender.lock().as_ref() {
                routes.insert(new, sender.clone());
            }
            EnsembleShared::deliver(&routes, fired);

            self.session_id.store(new, Ordering::SeqCst);
            *status = SessionStatus::Connected;
            (old, new)
        };

        info!(old_session = old, new_session = new, "in-memory session expired and re-established");
        self.notify(SessionEvent::Expired);
        self.notify(SessionEvent::Connected);
    }
}

impl CoordinationClient for InMemorySession {
    fn is_connected(&self) -> bool {
        *self.status.lock() == SessionStatus::Connected
    }

    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordinationResult<String> {
        self.mutate(|tree, session| tree.create(path, data, mode, session))
    }

    fn exists(&self, path: &str) -> CoordinationResult<bool> {
        let tree = self.shared.tree.lock();
        self.check_open()?;
        validate_path(path)?;
        Ok(tree.nodes.contains_key(path))
    }

    fn get_data(&self, path: &str, watch: Option<WatchCallback>) -> CoordinationResult<Vec<u8>> {
        self.mutate(|tree, session| Ok((tree.get_data(path, session, watch)?, Vec::new())))
    }

    fn set_data(&self, path: &str, data: &[u8]) -> CoordinationResult<()> {
        self.mutate(|tree, _| Ok(((), tree.set_data(path, data)?)))
    }

    fn get_children(&self, path: &str, watch: Option<WatchCallback>) -> CoordinationResult<Vec<String>> {
        self.mutate(|tree, session| Ok((tree.get_children(path, session, watch)?, Vec::new())))
    }

    fn delete(&self, path: &str) -> CoordinationResult<()> {
        self.mutate(|tree, _| Ok(((), tree.delete(path)?)))
    }

    fn add_session_listener(&self, listener: SessionCallback) {
        self.listeners.write().push(listener);
    }

    fn close(&self) {
        let worker = {
            let mut tree = self.shared.tree.lock();
            let mut status = self.status.lock();
            if *status == SessionStatus::Closed {
                return;
            }
            *status = SessionStatus::Closed;

            let session = self.session_id();
            let fired = tree.remove_session(session);
            let mut routes = self.shared.routes.lock();
            routes.remove(&session);
            EnsembleShared::deliver(&routes, fired);

            self.sender.lock().take();
            self.worker.lock().take()
        };

        debug!(session = self.session_id(), "in-memory session closed");
        if let Some(handle) = worker
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.close();
    }
}
