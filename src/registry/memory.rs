//! In-process registry for local and dev mode.
//!
//! A [`MemoryStore`] holds the node map; each [`MemoryRegistry`] is one client
//! session over it. Notifications are delivered synchronously, inside the
//! write call that caused them. Sessions can be taken offline to exercise
//! reconnect handling: an offline session loses its ephemeral nodes, misses
//! notifications and fails operations with `ConnectionLost` until
//! [`MemoryRegistry::reconnect`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::registry::hub::WatchHub;
use crate::registry::{
    name, parent, validate_path, ConnectionEvent, EventKind, Registry, RegistryError,
    Subscription, WatchEvent, WatchKind,
};

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    version: i64,
    /// Owning session for ephemeral nodes.
    owner: Option<u64>,
}

/// Shared node map backing any number of [`MemoryRegistry`] sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: RwLock<BTreeMap<String, Entry>>,
    hub: WatchHub,
    next_session: AtomicU64,
}

type Pending = Vec<(WatchKind, WatchEvent)>;

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn new_session(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn flush(&self, events: Pending) {
        for (kind, event) in events {
            self.hub.dispatch(kind, event);
        }
    }

    fn get(&self, path: &str) -> Result<(Vec<u8>, i64), RegistryError> {
        if path == "/" {
            return Ok((Vec::new(), 0));
        }
        self.nodes
            .read()
            .get(path)
            .map(|e| (e.data.clone(), e.version))
            .ok_or_else(|| RegistryError::NodeNotFound(path.to_string()))
    }

    /// Whether `path` exists, bypassing any session.
    pub fn contains(&self, path: &str) -> bool {
        path == "/" || self.nodes.read().contains_key(path)
    }

    /// Number of stored nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    fn children(&self, path: &str) -> Result<Vec<String>, RegistryError> {
        let nodes = self.nodes.read();
        if path != "/" && !nodes.contains_key(path) {
            return Err(RegistryError::NodeNotFound(path.to_string()));
        }
        Ok(children_of(&nodes, path))
    }

    fn create(&self, path: &str, data: &[u8], owner: Option<u64>) -> Result<(), RegistryError> {
        if path == "/" {
            return Err(RegistryError::NodeExists(path.to_string()));
        }
        let mut events = Pending::new();
        {
            let mut nodes = self.nodes.write();
            if nodes.contains_key(path) {
                return Err(RegistryError::NodeExists(path.to_string()));
            }

            let mut missing = Vec::new();
            let mut cursor = parent(path);
            while let Some(p) = cursor {
                if p == "/" || nodes.contains_key(p) {
                    break;
                }
                missing.push(p.to_string());
                cursor = parent(p);
            }

            for ancestor in missing.iter().rev() {
                nodes.insert(ancestor.clone(), Entry { data: Vec::new(), version: 0, owner: None });
                push_created(&mut events, ancestor);
            }
            nodes.insert(path.to_string(), Entry { data: data.to_vec(), version: 0, owner });
            push_created(&mut events, path);
        }
        self.flush(events);
        Ok(())
    }

    fn set(&self, path: &str, data: &[u8], expected: Option<i64>) -> Result<i64, RegistryError> {
        let version = {
            let mut nodes = self.nodes.write();
            let entry = nodes
                .get_mut(path)
                .ok_or_else(|| RegistryError::NodeNotFound(path.to_string()))?;
            if let Some(expected) = expected {
                if entry.version != expected {
                    return Err(RegistryError::VersionConflict { path: path.to_string(), expected });
                }
            }
            entry.data = data.to_vec();
            entry.version += 1;
            entry.version
        };
        self.hub.dispatch(WatchKind::Value, WatchEvent::value(path, EventKind::ValueChanged));
        Ok(version)
    }

    fn delete(&self, path: &str) -> Result<(), RegistryError> {
        if path == "/" {
            return Err(RegistryError::InvalidPath(path.to_string()));
        }
        let mut events = Pending::new();
        {
            let mut nodes = self.nodes.write();
            if nodes.remove(path).is_none() {
                return Err(RegistryError::NodeNotFound(path.to_string()));
            }
            let prefix = format!("{}/", path);
            let doomed: Vec<String> = nodes
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed.iter().rev() {
                nodes.remove(key);
                events.push((WatchKind::Value, WatchEvent::value(key, EventKind::Deleted)));
                events.push((WatchKind::Children, WatchEvent::value(key, EventKind::Deleted)));
            }
            events.push((WatchKind::Value, WatchEvent::value(path, EventKind::Deleted)));
            events.push((WatchKind::Children, WatchEvent::value(path, EventKind::Deleted)));
            if let Some(p) = parent(path) {
                events.push((WatchKind::Children, WatchEvent::child(p, EventKind::ChildRemoved, name(path))));
            }
        }
        self.flush(events);
        Ok(())
    }

    /// Remove every ephemeral node owned by `session`.
    fn expire_session(&self, session: u64) {
        let owned: Vec<String> = self
            .nodes
            .read()
            .iter()
            .filter(|(_, e)| e.owner == Some(session))
            .map(|(k, _)| k.clone())
            .collect();
        for path in owned {
            if let Err(e) = self.delete(&path) {
                tracing::debug!(path = %path, error = %e, "Ephemeral node already gone");
            }
        }
    }
}

fn push_created(events: &mut Pending, path: &str) {
    events.push((WatchKind::Value, WatchEvent::value(path, EventKind::ValueChanged)));
    if let Some(p) = parent(path) {
        events.push((WatchKind::Children, WatchEvent::child(p, EventKind::ChildAdded, name(path))));
    }
}

fn children_of(nodes: &BTreeMap<String, Entry>, path: &str) -> Vec<String> {
    let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
    nodes
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .map(|(k, _)| &k[prefix.len()..])
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
        .map(str::to_string)
        .collect()
}

/// One client session over a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryRegistry {
    store: Arc<MemoryStore>,
    session: AtomicU64,
    online: Arc<AtomicBool>,
    closed: AtomicBool,
    conn_tx: broadcast::Sender<ConnectionEvent>,
}

impl MemoryRegistry {
    /// A session over a fresh, private store.
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    /// A new session over a shared store.
    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        let (conn_tx, _) = broadcast::channel(16);
        let session = store.new_session();
        Self {
            store,
            session: AtomicU64::new(session),
            online: Arc::new(AtomicBool::new(true)),
            closed: AtomicBool::new(false),
            conn_tx,
        }
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    /// Simulate losing the session: ephemeral nodes vanish and
    /// notifications are missed until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        if !self.online.swap(false, Ordering::AcqRel) {
            return;
        }
        self.store.expire_session(self.session.load(Ordering::Acquire));
        tracing::warn!("Memory registry session lost");
        let _ = self.conn_tx.send(ConnectionEvent::Disconnected);
    }

    /// Re-establish a new session. Existing watch registrations resume.
    pub fn reconnect(&self) {
        if self.online.load(Ordering::Acquire) {
            return;
        }
        self.session.store(self.store.new_session(), Ordering::Release);
        self.online.store(true, Ordering::Release);
        metrics::counter!("conf_runtime_registry_reconnects_total").increment(1);
        tracing::info!("Memory registry session re-established");
        let _ = self.conn_tx.send(ConnectionEvent::Reconnected);
    }

    fn check(&self, path: &str) -> Result<(), RegistryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }
        if !self.online.load(Ordering::Acquire) {
            return Err(RegistryError::ConnectionLost);
        }
        validate_path(path)
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, i64), RegistryError> {
        self.check(path)?;
        self.store.get(path)
    }

    async fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> Result<(), RegistryError> {
        self.check(path)?;
        let owner = ephemeral.then(|| self.session.load(Ordering::Acquire));
        self.store.create(path, data, owner)
    }

    async fn set(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<i64>,
    ) -> Result<i64, RegistryError> {
        self.check(path)?;
        self.store.set(path, data, expected_version)
    }

    async fn delete(&self, path: &str) -> Result<(), RegistryError> {
        self.check(path)?;
        self.store.delete(path)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, RegistryError> {
        self.check(path)?;
        self.store.children(path)
    }

    async fn exists(&self, path: &str) -> Result<bool, RegistryError> {
        self.check(path)?;
        Ok(self.store.contains(path))
    }

    async fn watch_value(&self, path: &str) -> Result<Subscription, RegistryError> {
        self.check(path)?;
        Ok(self.store.hub.subscribe(WatchKind::Value, path, self.online.clone()))
    }

    async fn watch_children(&self, path: &str) -> Result<Subscription, RegistryError> {
        self.check(path)?;
        Ok(self.store.hub.subscribe(WatchKind::Children, path, self.online.clone()))
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.conn_tx.subscribe()
    }

    async fn close(&self) -> Result<(), RegistryError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store.expire_session(self.session.load(Ordering::Acquire));
        self.store.hub.remove_session(&self.online);
        tracing::info!("Memory registry closed");
        Ok(())
    }
}
