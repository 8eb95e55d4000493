//! ZooKeeper-backed registry.
//!
//! # Sessions
//! The client library keeps one session alive across transient connection
//! drops on its own. When the session expires, the supervisor task builds a
//! new client with bounded exponential backoff, swaps it in, bumps the
//! session generation and broadcasts `Reconnected`. Ephemeral nodes of the
//! old session are gone by then; that is the liveness signal of record.
//!
//! # Watches
//! ZooKeeper watches are one-shot. Each [`Subscription`] owns one task that
//! re-arms its watch after every trigger, and re-arms it exactly once more
//! against each new session, so no registration is ever duplicated. The
//! triggering event is forwarded only after the watch is re-armed, which
//! leaves no window where a change can slip through unobserved.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use zookeeper_client as zk;

use crate::registry::{
    parent, validate_path, ConnectionEvent, EventKind, Registry, RegistryError, Subscription,
    WatchEvent, WatchKind,
};
use crate::resilience::backoff::BackoffPolicy;

const INITIAL_CONNECT_ATTEMPTS: u32 = 5;

struct Inner {
    cluster: String,
    client: ArcSwapOption<zk::Client>,
    generation: watch::Sender<u64>,
    conn_tx: broadcast::Sender<ConnectionEvent>,
    closed: AtomicBool,
    backoff: BackoffPolicy,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct ZkRegistry {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ZkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZkRegistry").field("cluster", &self.inner.cluster).finish()
    }
}

fn map_err(path: &str, err: zk::Error) -> RegistryError {
    match err {
        zk::Error::NoNode => RegistryError::NodeNotFound(path.to_string()),
        zk::Error::NodeExists => RegistryError::NodeExists(path.to_string()),
        zk::Error::ConnectionLoss | zk::Error::SessionExpired => RegistryError::ConnectionLost,
        zk::Error::ClientClosed => RegistryError::Closed,
        other => RegistryError::Backend(other.to_string()),
    }
}

fn zk_version(version: i64) -> i32 {
    i32::try_from(version).unwrap_or(i32::MAX)
}

impl ZkRegistry {
    /// Connect to the ensemble. `chroot` is appended to the connect string.
    pub async fn connect(
        servers: Vec<String>,
        chroot: Option<String>,
        backoff: BackoffPolicy,
    ) -> Result<Self, RegistryError> {
        let cluster = format!("{}{}", servers.join(","), chroot.as_deref().unwrap_or(""));

        let mut attempt = 0;
        let client = loop {
            attempt += 1;
            match zk::Client::connect(&cluster).await {
                Ok(client) => break client,
                Err(e) if attempt < INITIAL_CONNECT_ATTEMPTS => {
                    let delay = backoff.delay(attempt);
                    tracing::warn!(cluster = %cluster, attempt, delay = ?delay, error = %e, "ZooKeeper connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(map_err("/", e)),
            }
        };
        tracing::info!(cluster = %cluster, "ZooKeeper session established");

        let (generation, _) = watch::channel(0);
        let (conn_tx, _) = broadcast::channel(16);
        let inner = Arc::new(Inner {
            cluster,
            client: ArcSwapOption::from_pointee(client),
            generation,
            conn_tx,
            closed: AtomicBool::new(false),
            backoff,
            tasks: Mutex::new(Vec::new()),
        });

        let supervisor = tokio::spawn(supervise(inner.clone()));
        Ok(Self { inner, supervisor: Mutex::new(Some(supervisor)) })
    }

    fn client(&self) -> Result<Arc<zk::Client>, RegistryError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }
        self.inner.client.load_full().ok_or(RegistryError::Closed)
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    async fn ensure_parents(client: &zk::Client, path: &str) -> Result<(), RegistryError> {
        let mut ancestors = Vec::new();
        let mut cursor = parent(path);
        while let Some(p) = cursor {
            if p == "/" {
                break;
            }
            ancestors.push(p.to_string());
            cursor = parent(p);
        }
        let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        for ancestor in ancestors.iter().rev() {
            match client.create(ancestor, &[], &options).await {
                Ok(_) | Err(zk::Error::NodeExists) => {}
                Err(e) => return Err(map_err(ancestor, e)),
            }
        }
        Ok(())
    }
}

/// Watch the session and replace the client when it expires.
async fn supervise(inner: Arc<Inner>) {
    loop {
        let Some(client) = inner.client.load_full() else {
            return;
        };
        let mut states = client.state_watcher();
        drop(client);

        loop {
            match states.changed().await {
                zk::SessionState::Disconnected => {
                    tracing::warn!(cluster = %inner.cluster, "ZooKeeper connection lost, client reconnecting");
                    let _ = inner.conn_tx.send(ConnectionEvent::Disconnected);
                }
                zk::SessionState::SyncConnected => {
                    tracing::info!(cluster = %inner.cluster, "ZooKeeper connection restored");
                    let _ = inner.conn_tx.send(ConnectionEvent::Reconnected);
                }
                zk::SessionState::Expired | zk::SessionState::AuthFailed | zk::SessionState::Closed => break,
                _ => {}
            }
        }

        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        tracing::warn!(cluster = %inner.cluster, "ZooKeeper session expired, creating a new session");
        let _ = inner.conn_tx.send(ConnectionEvent::Disconnected);

        let mut attempt = 0;
        loop {
            if inner.closed.load(Ordering::Acquire) {
                return;
            }
            attempt += 1;
            match zk::Client::connect(&inner.cluster).await {
                Ok(client) => {
                    inner.client.store(Some(Arc::new(client)));
                    inner.generation.send_modify(|g| *g += 1);
                    metrics::counter!("conf_runtime_registry_reconnects_total").increment(1);
                    tracing::info!(cluster = %inner.cluster, attempt, "ZooKeeper session re-established");
                    let _ = inner.conn_tx.send(ConnectionEvent::Reconnected);
                    break;
                }
                Err(e) => {
                    let delay = inner.backoff.delay(attempt);
                    tracing::warn!(cluster = %inner.cluster, attempt, delay = ?delay, error = %e, "ZooKeeper reconnect failed");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Sleep for `delay`, returning early on a new session. Returns false when
/// the subscriber or the registry went away.
async fn pause(
    delay: Duration,
    generation: &mut watch::Receiver<u64>,
    tx: &mpsc::UnboundedSender<WatchEvent>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = generation.changed() => changed.is_ok(),
        _ = tx.closed() => false,
    }
}

async fn watch_value_loop(inner: Arc<Inner>, path: String, tx: mpsc::UnboundedSender<WatchEvent>) {
    let mut generation = inner.generation.subscribe();
    let mut pending: Option<EventKind> = None;
    let mut attempt = 0;

    loop {
        if inner.closed.load(Ordering::Acquire) || tx.is_closed() {
            return;
        }
        let Some(client) = inner.client.load_full() else {
            return;
        };
        let watcher = match client.check_and_watch_stat(&path).await {
            Ok((_, watcher)) => watcher,
            Err(e) => {
                attempt += 1;
                tracing::debug!(path = %path, error = %e, "Failed to arm value watch");
                // Changes made while unarmed are caught by the consumer's re-read.
                pending.get_or_insert(EventKind::ValueChanged);
                if !pause(inner.backoff.delay(attempt), &mut generation, &tx).await {
                    return;
                }
                continue;
            }
        };
        attempt = 0;
        drop(client);

        if let Some(kind) = pending.take() {
            if tx.send(WatchEvent::value(&path, kind)).is_err() {
                return;
            }
        }

        tokio::select! {
            event = watcher.changed() => {
                match event.event_type {
                    zk::EventType::NodeCreated | zk::EventType::NodeDataChanged => {
                        pending = Some(EventKind::ValueChanged);
                    }
                    zk::EventType::NodeDeleted => pending = Some(EventKind::Deleted),
                    zk::EventType::Session => {
                        if !pause(inner.backoff.delay(1), &mut generation, &tx).await {
                            return;
                        }
                    }
                    _ => {}
                }
            }
            _ = tx.closed() => return,
        }
    }
}

async fn watch_children_loop(inner: Arc<Inner>, path: String, tx: mpsc::UnboundedSender<WatchEvent>) {
    let mut generation = inner.generation.subscribe();
    let mut known: Option<BTreeSet<String>> = None;
    let mut deleted = false;
    let mut attempt = 0;

    loop {
        if inner.closed.load(Ordering::Acquire) || tx.is_closed() {
            return;
        }
        let Some(client) = inner.client.load_full() else {
            return;
        };

        let armed = match client.list_and_watch_children(&path).await {
            Ok((children, watcher)) => Ok((children.into_iter().collect::<BTreeSet<_>>(), watcher)),
            Err(zk::Error::NoNode) => match client.check_and_watch_stat(&path).await {
                // Wait for the node to appear, then list again.
                Ok((None, watcher)) => Ok((BTreeSet::new(), watcher)),
                Ok((Some(_), _)) => continue,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        drop(client);

        let (current, watcher) = match armed {
            Ok(armed) => armed,
            Err(e) => {
                attempt += 1;
                tracing::debug!(path = %path, error = %e, "Failed to arm children watch");
                if !pause(inner.backoff.delay(attempt), &mut generation, &tx).await {
                    return;
                }
                continue;
            }
        };
        attempt = 0;

        if let Some(previous) = known.as_ref() {
            for added in current.difference(previous) {
                let _ = tx.send(WatchEvent::child(&path, EventKind::ChildAdded, added));
            }
            for removed in previous.difference(&current) {
                let _ = tx.send(WatchEvent::child(&path, EventKind::ChildRemoved, removed));
            }
        }
        if deleted {
            deleted = false;
            let _ = tx.send(WatchEvent::value(&path, EventKind::Deleted));
        }
        known = Some(current);

        tokio::select! {
            event = watcher.changed() => {
                match event.event_type {
                    zk::EventType::NodeDeleted => deleted = true,
                    zk::EventType::Session => {
                        if !pause(inner.backoff.delay(1), &mut generation, &tx).await {
                            return;
                        }
                    }
                    _ => {}
                }
            }
            _ = tx.closed() => return,
        }
    }
}

#[async_trait]
impl Registry for ZkRegistry {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, i64), RegistryError> {
        validate_path(path)?;
        let (data, stat) = self.client()?.get_data(path).await.map_err(|e| map_err(path, e))?;
        Ok((data, i64::from(stat.version)))
    }

    async fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> Result<(), RegistryError> {
        validate_path(path)?;
        let client = self.client()?;
        Self::ensure_parents(&client, path).await?;
        let mode = if ephemeral { zk::CreateMode::Ephemeral } else { zk::CreateMode::Persistent };
        let options = mode.with_acls(zk::Acls::anyone_all());
        client
            .create(path, data, &options)
            .await
            .map(|_| ())
            .map_err(|e| map_err(path, e))
    }

    async fn set(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<i64>,
    ) -> Result<i64, RegistryError> {
        validate_path(path)?;
        let client = self.client()?;
        match client.set_data(path, data, expected_version.map(zk_version)).await {
            Ok(stat) => Ok(i64::from(stat.version)),
            Err(zk::Error::BadVersion) => Err(RegistryError::VersionConflict {
                path: path.to_string(),
                expected: expected_version.unwrap_or_default(),
            }),
            Err(e) => Err(map_err(path, e)),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), RegistryError> {
        validate_path(path)?;
        let client = self.client()?;

        // Depth-first: ZooKeeper refuses to delete nodes with children.
        let mut stack = vec![(path.to_string(), false)];
        while let Some((node, expanded)) = stack.pop() {
            if !expanded {
                let children = match client.list_children(&node).await {
                    Ok(children) => children,
                    Err(zk::Error::NoNode) if node != path => continue,
                    Err(e) => return Err(map_err(&node, e)),
                };
                stack.push((node.clone(), true));
                for child in children {
                    stack.push((format!("{}/{}", node.trim_end_matches('/'), child), false));
                }
                continue;
            }
            match client.delete(&node, None).await {
                Ok(()) => {}
                Err(zk::Error::NoNode) if node != path => {}
                Err(e) => return Err(map_err(&node, e)),
            }
        }
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, RegistryError> {
        validate_path(path)?;
        let mut children = self
            .client()?
            .list_children(path)
            .await
            .map_err(|e| map_err(path, e))?;
        children.sort();
        Ok(children)
    }

    async fn exists(&self, path: &str) -> Result<bool, RegistryError> {
        validate_path(path)?;
        let stat = self.client()?.check_stat(path).await.map_err(|e| map_err(path, e))?;
        Ok(stat.is_some())
    }

    async fn watch_value(&self, path: &str) -> Result<Subscription, RegistryError> {
        validate_path(path)?;
        self.client()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.track(tokio::spawn(watch_value_loop(self.inner.clone(), path.to_string(), tx)));
        Ok(Subscription::new(path, WatchKind::Value, rx))
    }

    async fn watch_children(&self, path: &str) -> Result<Subscription, RegistryError> {
        validate_path(path)?;
        self.client()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.track(tokio::spawn(watch_children_loop(self.inner.clone(), path.to_string(), tx)));
        Ok(Subscription::new(path, WatchKind::Children, rx))
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.conn_tx.subscribe()
    }

    async fn close(&self) -> Result<(), RegistryError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        // Dropping the last client handle closes the session and with it
        // every ephemeral node it owns.
        self.inner.client.store(None);
        tracing::info!(cluster = %self.inner.cluster, "ZooKeeper registry closed");
        Ok(())
    }
}

impl Drop for ZkRegistry {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.abort();
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_err_classifies_client_errors() {
        assert!(matches!(map_err("/a", zk::Error::NoNode), RegistryError::NodeNotFound(p) if p == "/a"));
        assert!(matches!(map_err("/a", zk::Error::NodeExists), RegistryError::NodeExists(p) if p == "/a"));
        assert!(matches!(map_err("/a", zk::Error::ConnectionLoss), RegistryError::ConnectionLost));
        assert!(matches!(map_err("/a", zk::Error::SessionExpired), RegistryError::ConnectionLost));
        assert!(matches!(map_err("/a", zk::Error::ClientClosed), RegistryError::Closed));
        assert!(matches!(map_err("/a", zk::Error::NoAuth), RegistryError::Backend(_)));
    }

    #[test]
    fn test_session_errors_are_transient() {
        assert!(map_err("/a", zk::Error::ConnectionLoss).is_transient());
        assert!(map_err("/a", zk::Error::SessionExpired).is_transient());
        assert!(!map_err("/a", zk::Error::NoNode).is_transient());
    }

    #[test]
    fn test_version_saturates_into_wire_width() {
        assert_eq!(zk_version(0), 0);
        assert_eq!(zk_version(3), 3);
        assert_eq!(zk_version(i64::from(i32::MAX) + 1), i32::MAX);
        assert_eq!(zk_version(i64::MAX), i32::MAX);
    }
}
