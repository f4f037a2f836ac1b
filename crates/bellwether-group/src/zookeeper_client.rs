//! [`CoordinationClient`] over a ZooKeeper ensemble.
//!
//! Built on the synchronous `zookeeper` crate. Watches and session changes
//! are re-delivered on this client's own notification thread, so callbacks
//! may call back into the client without blocking the connection's threads.
//!
//! An expired session cannot be revived. The client opens a replacement
//! session in the background, retrying with exponential backoff, and reports
//! `Expired` followed by `Connected` once the new session is usable.
//!
//! # Tiger Style
//!
//! - Payloads are bounded by [`MAX_NODE_DATA_SIZE`] before they are sent
//! - Reconnect delays are bounded by [`RECONNECT_BACKOFF_MAX_MS`]
//! - Events of replaced sessions are dropped by generation

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;
use zookeeper::Acl;
use zookeeper::KeeperState;
use zookeeper::WatchedEventType;
use zookeeper::Watcher;
use zookeeper::ZkError;
use zookeeper::ZooKeeper;

use crate::client::CoordinationClient;
use crate::client::CreateMode;
use crate::client::SessionCallback;
use crate::client::SessionEvent;
use crate::client::WatchCallback;
use crate::client::WatchEventKind;
use crate::client::WatchedEvent;
use crate::client::validate_path;
use crate::config::GroupConfig;
use crate::constants::MAX_NODE_DATA_SIZE;
use crate::constants::RECONNECT_BACKOFF_MAX_MS;
use crate::constants::RECONNECT_BACKOFF_MIN_MS;
use crate::error::CoordinationError;
use crate::error::CoordinationResult;
use crate::in_memory::Delivery;
use crate::in_memory::run_notifications;

/// Map a backend error on `path` to the client error model.
pub fn coordination_error(error: ZkError, path: &str) -> CoordinationError {
    match error {
        ZkError::NoNode => CoordinationError::NoNode { path: path.to_string() },
        ZkError::NodeExists => CoordinationError::NodeExists { path: path.to_string() },
        ZkError::NotEmpty => CoordinationError::NotEmpty { path: path.to_string() },
        ZkError::ConnectionLoss | ZkError::OperationTimeout => CoordinationError::ConnectionLoss,
        ZkError::SessionExpired => CoordinationError::SessionExpired,
        other => CoordinationError::Backend {
            message: format!("{other:?} on '{path}'"),
        },
    }
}

/// Map a creation mode to the backend's.
pub fn backend_create_mode(mode: CreateMode) -> zookeeper::CreateMode {
    match mode {
        CreateMode::Persistent => zookeeper::CreateMode::Persistent,
        CreateMode::Ephemeral => zookeeper::CreateMode::Ephemeral,
        CreateMode::PersistentSequential => zookeeper::CreateMode::PersistentSequential,
        CreateMode::EphemeralSequential => zookeeper::CreateMode::EphemeralSequential,
    }
}

/// The node event a triggered watch reports; session-only events have none.
pub fn watch_event_kind(event_type: WatchedEventType) -> Option<WatchEventKind> {
    match event_type {
        WatchedEventType::NodeCreated => Some(WatchEventKind::NodeCreated),
        WatchedEventType::NodeDeleted => Some(WatchEventKind::NodeDeleted),
        WatchedEventType::NodeDataChanged => Some(WatchEventKind::NodeDataChanged),
        WatchedEventType::NodeChildrenChanged => Some(WatchEventKind::NodeChildrenChanged),
        _ => None,
    }
}

/// Delay before reconnect attempt `attempt` (zero-based).
pub fn reconnect_backoff(attempt: u32) -> Duration {
    let millis = RECONNECT_BACKOFF_MIN_MS.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(millis.min(RECONNECT_BACKOFF_MAX_MS))
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

/// Receives session state changes of one backend session.
struct SessionWatcher {
    inner: Weak<Inner>,
    generation: u64,
    synced: mpsc::Sender<()>,
}

impl Watcher for SessionWatcher {
    fn handle(&self, event: zookeeper::WatchedEvent) {
        if matches!(event.keeper_state, KeeperState::SyncConnected) {
            let _ = self.synced.send(());
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.on_keeper_state(self.generation, event.keeper_state);
        }
    }
}

struct Inner {
    connect_string: String,
    session_timeout: Duration,
    handle: RwLock<Option<Arc<ZooKeeper>>>,
    /// Generation of the most recently opened session.
    opened: AtomicU64,
    /// Generation of the session behind `handle`; zero before the first.
    installed: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    reconnecting: AtomicBool,
    sender: Mutex<Option<mpsc::Sender<Delivery>>>,
}

impl Inner {
    fn notify(&self, delivery: Delivery) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(delivery);
        }
    }

    fn handle(&self) -> CoordinationResult<Arc<ZooKeeper>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinationError::Closed);
        }
        self.handle.read().clone().ok_or(CoordinationError::ConnectionLoss)
    }

    /// Open a session and wait for the ensemble to accept it.
    fn open_session(self: &Arc<Self>) -> CoordinationResult<(ZooKeeper, u64)> {
        let generation = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let (synced, on_synced) = mpsc::channel();
        let watcher = SessionWatcher {
            inner: Arc::downgrade(self),
            generation,
            synced,
        };

        let zk = ZooKeeper::connect(&self.connect_string, self.session_timeout, watcher)
            .map_err(|e| coordination_error(e, "/"))?;

        if on_synced.recv_timeout(self.session_timeout).is_err() {
            let _ = zk.close();
            return Err(CoordinationError::ConnectionLoss);
        }

        debug!(connect_string = %self.connect_string, generation, "zookeeper session established");
        Ok((zk, generation))
    }

    /// Make `zk` the active session and report it connected.
    fn install(&self, zk: ZooKeeper, generation: u64) {
        let previous = self.handle.write().replace(Arc::new(zk));
        self.installed.store(generation, Ordering::SeqCst);
        if let Some(previous) = previous
            && let Err(e) = previous.close()
        {
            debug!(error = ?e, "closing replaced zookeeper session failed");
        }

        if !self.connected.swap(true, Ordering::SeqCst) {
            self.notify(Delivery::Session(SessionEvent::Connected));
        }
    }

    fn on_keeper_state(self: &Arc<Self>, generation: u64, state: KeeperState) {
        if self.closed.load(Ordering::SeqCst) || generation != self.installed.load(Ordering::SeqCst) {
            trace!(generation, state = ?state, "ignoring state of inactive session");
            return;
        }

        match state {
            KeeperState::SyncConnected => {
                if !self.connected.swap(true, Ordering::SeqCst) {
                    info!(connect_string = %self.connect_string, "zookeeper connection restored");
                    self.notify(Delivery::Session(SessionEvent::Connected));
                }
            }
            KeeperState::Disconnected => {
                if self.connected.swap(false, Ordering::SeqCst) {
                    warn!(connect_string = %self.connect_string, "zookeeper connection lost");
                    self.notify(Delivery::Session(SessionEvent::Disconnected));
                }
            }
            KeeperState::Expired => {
                self.connected.store(false, Ordering::SeqCst);
                warn!(connect_string = %self.connect_string, "zookeeper session expired");
                self.notify(Delivery::Session(SessionEvent::Expired));
                self.spawn_reconnect();
            }
            other => debug!(state = ?other, "zookeeper session state"),
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(self);
        let spawned = thread::Builder::new().name("zookeeper-reconnect".into()).spawn(move || {
            inner.reconnect();
            inner.reconnecting.store(false, Ordering::SeqCst);
        });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn zookeeper reconnect thread");
            self.reconnecting.store(false, Ordering::SeqCst);
        }
    }

    fn reconnect(self: &Arc<Self>) {
        let mut attempt = 0u32;
        while !self.closed.load(Ordering::SeqCst) {
            match self.open_session() {
                Ok((zk, generation)) => {
                    if self.closed.load(Ordering::SeqCst) {
                        let _ = zk.close();
                        return;
                    }
                    info!(connect_string = %self.connect_string, attempt, "replaced expired zookeeper session");
                    self.install(zk, generation);
                    return;
                }
                Err(e) => {
                    let delay = reconnect_backoff(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "zookeeper reconnect failed");
                    thread::sleep(delay);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

/// A [`CoordinationClient`] connected to a ZooKeeper ensemble.
pub struct ZooKeeperClient {
    inner: Arc<Inner>,
    listeners: Arc<RwLock<Vec<SessionCallback>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ZooKeeperClient {
    /// Connect to `config.connect_string`, requesting a session of
    /// `config.session_timeout_ms`. Blocks until the ensemble accepts the
    /// session or the timeout passes.
    ///
    /// # Errors
    ///
    /// Fails with [`CoordinationError::ConnectionLoss`] when no server answers
    /// in time, or [`CoordinationError::Backend`] when the address list is
    /// unusable or the notification thread cannot be spawned.
    pub fn connect(config: &GroupConfig) -> CoordinationResult<Arc<Self>> {
        let (sender, receiver) = mpsc::channel();
        let listeners: Arc<RwLock<Vec<SessionCallback>>> = Arc::new(RwLock::new(Vec::new()));

        let worker_listeners = Arc::clone(&listeners);
        let worker = thread::Builder::new()
            .name("zookeeper-notify".into())
            .spawn(move || run_notifications(receiver, worker_listeners))
            .map_err(|e| CoordinationError::Backend {
                message: format!("failed to spawn notification thread: {e}"),
            })?;

        let inner = Arc::new(Inner {
            connect_string: config.connect_string.clone(),
            session_timeout: Duration::from_millis(config.session_timeout_ms),
            handle: RwLock::new(None),
            opened: AtomicU64::new(0),
            installed: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
        });
        let client = Arc::new(Self {
            inner,
            listeners,
            worker: Mutex::new(Some(worker)),
        });

        let (zk, generation) = client.inner.open_session().inspect_err(|_| client.close())?;
        client.inner.install(zk, generation);
        info!(
            connect_string = %config.connect_string,
            session_timeout_ms = config.session_timeout_ms,
            "connected to zookeeper"
        );
        Ok(client)
    }

    /// The address list this client connects to.
    pub fn connect_string(&self) -> &str {
        &self.inner.connect_string
    }

    /// The session timeout requested from the ensemble.
    pub fn session_timeout(&self) -> Duration {
        self.inner.session_timeout
    }

    fn watcher(&self, path: &str, callback: WatchCallback) -> impl Fn(zookeeper::WatchedEvent) + Send + 'static {
        let inner = Arc::downgrade(&self.inner);
        let watched = path.to_string();
        move |event: zookeeper::WatchedEvent| {
            let Some(kind) = watch_event_kind(event.event_type) else {
                trace!(path = %watched, state = ?event.keeper_state, "watch cleared by session change");
                return;
            };
            if let Some(inner) = inner.upgrade() {
                inner.notify(Delivery::Watch(callback.clone(), WatchedEvent {
                    kind,
                    path: event.path.unwrap_or_else(|| watched.clone()),
                }));
            }
        }
    }
}

impl CoordinationClient for ZooKeeperClient {
    fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst) && self.inner.connected.load(Ordering::SeqCst)
    }

    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordinationResult<String> {
        validate_path(path)?;
        check_size(path, data)?;
        self.inner
            .handle()?
            .create(path, data.to_vec(), Acl::open_unsafe().clone(), backend_create_mode(mode))
            .map_err(|e| coordination_error(e, path))
    }

    fn exists(&self, path: &str) -> CoordinationResult<bool> {
        validate_path(path)?;
        let stat = self.inner.handle()?.exists(path, false).map_err(|e| coordination_error(e, path))?;
        Ok(stat.is_some())
    }

    fn get_data(&self, path: &str, watch: Option<WatchCallback>) -> CoordinationResult<Vec<u8>> {
        validate_path(path)?;
        let zk = self.inner.handle()?;
        let result = match watch {
            Some(callback) => zk.get_data_w(path, self.watcher(path, callback)),
            None => zk.get_data(path, false),
        };
        result.map(|(data, _stat)| data).map_err(|e| coordination_error(e, path))
    }

    fn set_data(&self, path: &str, data: &[u8]) -> CoordinationResult<()> {
        validate_path(path)?;
        check_size(path, data)?;
        self.inner
            .handle()?
            .set_data(path, data.to_vec(), None)
            .map(|_stat| ())
            .map_err(|e| coordination_error(e, path))
    }

    fn get_children(&self, path: &str, watch: Option<WatchCallback>) -> CoordinationResult<Vec<String>> {
        validate_path(path)?;
        let zk = self.inner.handle()?;
        let result = match watch {
            Some(callback) => zk.get_children_w(path, self.watcher(path, callback)),
            None => zk.get_children(path, false),
        };
        result.map_err(|e| coordination_error(e, path))
    }

    fn delete(&self, path: &str) -> CoordinationResult<()> {
        validate_path(path)?;
        self.inner.handle()?.delete(path, None).map_err(|e| coordination_error(e, path))
    }

    fn add_session_listener(&self, listener: SessionCallback) {
        self.listeners.write().push(listener);
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.connected.store(false, Ordering::SeqCst);

        if let Some(zk) = self.inner.handle.write().take()
            && let Err(e) = zk.close()
        {
            warn!(error = ?e, "closing zookeeper session failed");
        }

        self.inner.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
        debug!(connect_string = %self.inner.connect_string, "zookeeper client closed");
    }
}

impl Drop for ZooKeeperClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ZooKeeperClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZooKeeperClient")
            .field("connect_string", &self.inner.connect_string)
            .field("session_timeout", &self.inner.session_timeout)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping_keeps_path() {
        assert_eq!(coordination_error(ZkError::NoNode, "/a"), CoordinationError::NoNode { path: "/a".into() });
        assert_eq!(coordination_error(ZkError::NodeExists, "/a"), CoordinationError::NodeExists {
            path: "/a".into()
        });
        assert_eq!(coordination_error(ZkError::NotEmpty, "/a"), CoordinationError::NotEmpty { path: "/a".into() });
    }

    #[test]
    fn test_session_errors_are_transient() {
        assert!(coordination_error(ZkError::ConnectionLoss, "/a").is_transient());
        assert!(coordination_error(ZkError::OperationTimeout, "/a").is_transient());
        assert!(coordination_error(ZkError::SessionExpired, "/a").is_transient());

        let other = coordination_error(ZkError::NoAuth, "/a");
        assert!(!other.is_transient());
        assert!(matches!(other, CoordinationError::Backend { .. }));
        assert!(other.to_string().contains("/a"));
    }

    #[test]
    fn test_create_modes() {
        assert!(matches!(backend_create_mode(CreateMode::Persistent), zookeeper::CreateMode::Persistent));
        assert!(matches!(backend_create_mode(CreateMode::Ephemeral), zookeeper::CreateMode::Ephemeral));
        assert!(matches!(
            backend_create_mode(CreateMode::PersistentSequential),
            zookeeper::CreateMode::PersistentSequential
        ));
        assert!(matches!(
            backend_create_mode(CreateMode::EphemeralSequential),
            zookeeper::CreateMode::EphemeralSequential
        ));
    }

    #[test]
    fn test_watch_event_kinds() {
        assert_eq!(watch_event_kind(WatchedEventType::NodeChildrenChanged), Some(WatchEventKind::NodeChildrenChanged));
        assert_eq!(watch_event_kind(WatchedEventType::NodeDeleted), Some(WatchEventKind::NodeDeleted));
        assert_eq!(watch_event_kind(WatchedEventType::None), None);
    }

    #[test]
    fn test_reconnect_backoff_is_bounded() {
        assert_eq!(reconnect_backoff(0), Duration::from_millis(RECONNECT_BACKOFF_MIN_MS));
        assert_eq!(reconnect_backoff(1), Duration::from_millis(RECONNECT_BACKOFF_MIN_MS * 2));
        assert_eq!(reconnect_backoff(u32::MAX), Duration::from_millis(RECONNECT_BACKOFF_MAX_MS));
    }

    #[test]
    #[ignore = "Requires a ZooKeeper server at BELLWETHER_ZOOKEEPER_CONNECT"]
    fn test_live_group_election() {
        use bellwether_cluster::Cluster;
        use bellwether_cluster::ClusterService;

        use crate::service::group_cluster_service;

        let connect_string = std::env::var("BELLWETHER_ZOOKEEPER_CONNECT").unwrap();
        let config = GroupConfig {
            connect_string,
            root_path: format!("/bellwether-test/{}", std::process::id()),
            ..GroupConfig::default()
        };

        let first: Arc<dyn CoordinationClient> = ZooKeeperClient::connect(&config).unwrap();
        let second: Arc<dyn CoordinationClient> = ZooKeeperClient::connect(&config).unwrap();
        let a = group_cluster_service(Cluster::new("live"), first, config.clone(), "node-a").unwrap();
        let b = group_cluster_service(Cluster::new("live"), second, config, "node-b").unwrap();

        a.view("orders").unwrap();
        b.view("orders").unwrap();
        assert!(a.is_leader("orders").unwrap());
        assert!(!b.is_leader("orders").unwrap());

        a.stop();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !b.is_leader("orders").unwrap() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(b.is_leader("orders").unwrap());
    }
}
