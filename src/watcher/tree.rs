//! Watcher tree for one server type.
//!
//! Watches the main node by value and the conf directory by children, and
//! holds one value subscription per discovered sub-config. Every
//! subscription is drained by its own task, so events for one path are
//! handled in order while distinct paths proceed in parallel.
//!
//! Every event is treated as "go look": the worker re-reads its node and
//! updates the shared snapshot, then pokes the debouncer. Duplicate
//! notifications therefore collapse into the same state.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::conf::{ConfPaths, ConfSnapshot, MAIN_CONF_NAME};
use crate::registry::{ConnectionEvent, Registry, RegistryError, Subscription};
use crate::resilience::backoff::BackoffPolicy;
use crate::watcher::debounce::{Debouncer, Trigger};

/// Capacity of the downstream snapshot channel.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 8;

struct Shared {
    registry: Arc<dyn Registry>,
    paths: ConfPaths,
    snapshot: Mutex<ConfSnapshot>,
    /// Sub-config workers keyed by sub-config name.
    subs: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Serializes child reconciliation between the children worker and resync.
    reconcile_lock: tokio::sync::Mutex<()>,
    /// Held across each read-and-store of a node, so an older read never
    /// lands after a newer one.
    read_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    trigger: mpsc::UnboundedSender<Trigger>,
}

/// Running watcher tree. Dropping it stops every worker.
pub struct WatcherTree {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl WatcherTree {
    /// Subscribe, read the initial state, and start the workers.
    ///
    /// The first item on the returned channel is the initial snapshot; later
    /// items are debounced changes.
    pub async fn start(
        registry: Arc<dyn Registry>,
        paths: ConfPaths,
        debounce: Duration,
        backoff: BackoffPolicy,
    ) -> Result<(Self, mpsc::Receiver<ConfSnapshot>), RegistryError> {
        let (trigger, trigger_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);

        // Subscribe before reading so nothing lands between read and watch.
        let main_sub = registry.watch_value(&paths.main()).await?;
        let dir_sub = registry.watch_children(&paths.conf_dir()).await?;
        let conn_rx = registry.connection_events();

        let shared = Arc::new(Shared {
            registry,
            paths,
            snapshot: Mutex::new(ConfSnapshot::default()),
            subs: Mutex::new(HashMap::new()),
            reconcile_lock: tokio::sync::Mutex::new(()),
            read_locks: Mutex::new(HashMap::new()),
            trigger,
        });

        let initial = match shared.resync().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                shared.stop_subs();
                return Err(e);
            }
        };
        tracing::info!(
            server_type = %shared.paths.server_type,
            main_present = initial.main.is_some(),
            sub_confs = initial.subs.len(),
            "Watcher tree started"
        );
        // Capacity is at least one, so the first send cannot block.
        let _ = out_tx.try_send(initial.clone());

        let tasks = vec![
            tokio::spawn(shared.clone().main_worker(main_sub)),
            tokio::spawn(shared.clone().children_worker(dir_sub)),
            tokio::spawn(shared.clone().connection_worker(conn_rx, backoff)),
            tokio::spawn(emit_worker(shared.clone(), Debouncer::new(debounce), trigger_rx, out_tx, initial)),
        ];

        Ok((Self { shared, tasks }, out_rx))
    }

    /// Latest state observed, regardless of debouncing.
    pub fn snapshot(&self) -> ConfSnapshot {
        self.shared.snapshot.lock().clone()
    }

    /// Names of the sub-configs currently being watched.
    pub fn sub_conf_names(&self) -> BTreeSet<String> {
        self.shared.subs.lock().keys().cloned().collect()
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.shared.stop_subs();
        tracing::debug!(server_type = %self.shared.paths.server_type, "Watcher tree stopped");
    }
}

impl Drop for WatcherTree {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn read_value(registry: &dyn Registry, path: &str) -> Result<Option<Vec<u8>>, RegistryError> {
    match registry.get(path).await {
        Ok((data, _)) => Ok(Some(data)),
        Err(RegistryError::NodeNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

impl Shared {
    fn poke(&self, trigger: Trigger) {
        let _ = self.trigger.send(trigger);
    }

    fn read_lock(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.read_locks.lock().entry(path.to_string()).or_default().clone()
    }

    fn stop_subs(&self) {
        for (_, worker) in self.subs.lock().drain() {
            worker.abort();
        }
    }

    /// Re-read everything and reconcile sub-config watches.
    async fn resync(self: &Arc<Self>) -> Result<ConfSnapshot, RegistryError> {
        self.refresh_main().await?;
        self.reconcile().await?;

        let names: Vec<String> = self.subs.lock().keys().cloned().collect();
        for name in names {
            self.refresh_sub(&name).await?;
        }
        Ok(self.snapshot.lock().clone())
    }

    /// Align sub-config workers with the conf directory's children.
    /// Returns whether the set of sub-configs changed.
    async fn reconcile(self: &Arc<Self>) -> Result<bool, RegistryError> {
        let _guard = self.reconcile_lock.lock().await;

        let listed = match self.registry.children(&self.paths.conf_dir()).await {
            Ok(children) => children,
            Err(RegistryError::NodeNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let wanted: BTreeSet<String> = listed.into_iter().filter(|n| n != MAIN_CONF_NAME).collect();
        let current: BTreeSet<String> = self.subs.lock().keys().cloned().collect();
        let mut changed = false;

        for name in current.difference(&wanted) {
            if let Some(worker) = self.subs.lock().remove(name) {
                worker.abort();
            }
            self.snapshot.lock().subs.remove(name);
            self.read_locks.lock().remove(&self.paths.sub(name));
            tracing::info!(server_type = %self.paths.server_type, sub_conf = %name, "Sub-config removed");
            changed = true;
        }

        for name in wanted.difference(&current) {
            let path = self.paths.sub(name);
            let lock = self.read_lock(&path);
            let _read = lock.lock().await;
            let sub = self.registry.watch_value(&path).await?;
            let data = read_value(self.registry.as_ref(), &path).await?;
            let worker = tokio::spawn(self.clone().sub_worker(name.clone(), sub));
            self.subs.lock().insert(name.clone(), worker);
            if let Some(data) = data {
                self.snapshot.lock().subs.insert(name.clone(), data);
            }
            tracing::info!(server_type = %self.paths.server_type, sub_conf = %name, "Sub-config discovered");
            changed = true;
        }
        Ok(changed)
    }

    async fn refresh_main(&self) -> Result<(), RegistryError> {
        let path = self.paths.main();
        let lock = self.read_lock(&path);
        let _read = lock.lock().await;
        let main = read_value(self.registry.as_ref(), &path).await?;
        self.snapshot.lock().main = main;
        Ok(())
    }

    async fn refresh_sub(&self, name: &str) -> Result<(), RegistryError> {
        let path = self.paths.sub(name);
        let lock = self.read_lock(&path);
        let _read = lock.lock().await;
        let data = read_value(self.registry.as_ref(), &path).await?;
        let subs = self.subs.lock();
        if !subs.contains_key(name) {
            return Ok(());
        }
        let mut snapshot = self.snapshot.lock();
        match data {
            Some(data) => {
                snapshot.subs.insert(name.to_string(), data);
            }
            None => {
                snapshot.subs.remove(name);
            }
        }
        Ok(())
    }

    async fn main_worker(self: Arc<Self>, mut sub: Subscription) {
        let path = self.paths.main();
        while let Some(event) = sub.recv().await {
            tracing::debug!(path = %path, kind = ?event.kind, "Main config event");
            match self.refresh_main().await {
                Ok(()) => self.poke(Trigger::Changed),
                // The reconnect resync re-reads this node.
                Err(e) => tracing::warn!(path = %path, error = %e, "Failed to read main config"),
            }
        }
        tracing::debug!(path = %path, "Main config watch closed");
    }

    async fn children_worker(self: Arc<Self>, mut sub: Subscription) {
        while let Some(event) = sub.recv().await {
            tracing::debug!(path = %event.path, kind = ?event.kind, child = ?event.child, "Conf directory event");
            match self.reconcile().await {
                Ok(true) => self.poke(Trigger::Changed),
                Ok(false) => {}
                Err(e) => tracing::warn!(path = %event.path, error = %e, "Failed to reconcile sub-configs"),
            }
        }
    }

    async fn sub_worker(self: Arc<Self>, name: String, mut sub: Subscription) {
        while let Some(event) = sub.recv().await {
            tracing::debug!(path = %event.path, kind = ?event.kind, "Sub-config event");
            match self.refresh_sub(&name).await {
                Ok(()) => self.poke(Trigger::Changed),
                Err(e) => tracing::warn!(sub_conf = %name, error = %e, "Failed to read sub-config"),
            }
        }
    }

    async fn connection_worker(
        self: Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<ConnectionEvent>,
        backoff: BackoffPolicy,
    ) {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Disconnected) => {
                    tracing::warn!(server_type = %self.paths.server_type, "Registry disconnected, holding last snapshot");
                }
                Ok(ConnectionEvent::Reconnected) | Err(RecvError::Lagged(_)) => {
                    let mut attempt = 0;
                    loop {
                        attempt += 1;
                        match self.resync().await {
                            Ok(_) => break,
                            Err(e) => {
                                let delay = backoff.delay(attempt);
                                tracing::warn!(
                                    server_type = %self.paths.server_type,
                                    attempt,
                                    delay = ?delay,
                                    error = %e,
                                    "Resync after reconnect failed"
                                );
                                tokio::time::sleep(delay).await;
                            }
                        }
                    }
                    tracing::info!(server_type = %self.paths.server_type, "Watcher tree resynced after reconnect");
                    self.poke(Trigger::Resync);
                }
                Err(RecvError::Closed) => return,
            }
        }
    }
}

async fn emit_worker(
    shared: Arc<Shared>,
    debouncer: Debouncer,
    mut triggers: mpsc::UnboundedReceiver<Trigger>,
    out: mpsc::Sender<ConfSnapshot>,
    mut last: ConfSnapshot,
) {
    while let Some(forced) = debouncer.next_batch(&mut triggers).await {
        let current = shared.snapshot.lock().clone();
        if !forced && current == last {
            continue;
        }
        if out.send(current.clone()).await.is_err() {
            return;
        }
        last = current;
    }
}
