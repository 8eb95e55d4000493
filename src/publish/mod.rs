//! Discovery publication.
//!
//! Maintains at most one ephemeral node per logical instance at
//! `/{platform}/{system}/{cluster}/{serverType}/{name}`. The node is
//! re-created at the same path after a session loss, and a failed write is
//! retried in the background until it lands or the publication is cleared.
//! A failed removal is parked and retried the same way until the node is
//! gone, so a cleared publication never stays advertised.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::conf::ConfPaths;
use crate::registry::{ConnectionEvent, Registry, RegistryError};
use crate::resilience::backoff::BackoffPolicy;

/// Payload of a discovery node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryMetadata {
    /// Reachable service address, e.g. `http://10.0.0.4:8080`.
    pub service: String,
    pub cluster_id: String,
}

impl DiscoveryMetadata {
    pub fn new(service: impl Into<String>, cluster_id: impl Into<String>) -> Self {
        Self { service: service.into(), cluster_id: cluster_id.into() }
    }
}

#[derive(Debug, Clone)]
struct Publication {
    path: String,
    payload: Vec<u8>,
}

struct Inner {
    registry: Arc<dyn Registry>,
    backoff: BackoffPolicy,
    current: Mutex<Option<Publication>>,
    retry: Mutex<Option<JoinHandle<()>>>,
    /// Path of a cleared publication whose node is still to be deleted.
    removal: Mutex<Option<String>>,
    removal_retry: Mutex<Option<JoinHandle<()>>>,
    /// Serializes registry writes so a clear never races a pending re-put.
    write_lock: tokio::sync::Mutex<()>,
}

pub struct Publisher {
    paths: ConfPaths,
    inner: Arc<Inner>,
    keeper: JoinHandle<()>,
}

impl Publisher {
    /// Must be called inside a tokio runtime; spawns the reconnect keeper.
    pub fn new(registry: Arc<dyn Registry>, paths: ConfPaths, backoff: BackoffPolicy) -> Self {
        let events = registry.connection_events();
        let inner = Arc::new(Inner {
            registry,
            backoff,
            current: Mutex::new(None),
            retry: Mutex::new(None),
            removal: Mutex::new(None),
            removal_retry: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        });
        let keeper = tokio::spawn(keep_published(inner.clone(), events));
        Self { paths, inner, keeper }
    }

    /// Write the discovery node for `name`, replacing any previous
    /// publication. On failure the publication stays active and is retried
    /// in the background; the error is still returned.
    pub async fn publish(&self, name: &str, metadata: &DiscoveryMetadata) -> Result<String, RegistryError> {
        let path = self.paths.discovery(name);
        let payload = serde_json::to_vec(metadata)
            .map_err(|e| RegistryError::Backend(format!("encode discovery metadata: {}", e)))?;

        let previous = self.inner.current.lock().replace(Publication { path: path.clone(), payload });
        self.inner.cancel_retry();
        // Re-creating the node supersedes a parked removal of the same path.
        let superseded = {
            let mut removal = self.inner.removal.lock();
            if removal.as_deref() == Some(path.as_str()) {
                removal.take()
            } else {
                None
            }
        };
        if superseded.is_some() {
            self.inner.cancel_removal();
        }
        if let Some(previous) = previous.filter(|p| p.path != path) {
            let _guard = self.inner.write_lock.lock().await;
            self.inner.remove(&previous.path).await;
        }

        match self.inner.write_current().await {
            Ok(()) => {
                tracing::info!(path = %path, service = %metadata.service, "Published discovery node");
                Ok(path)
            }
            Err(e) => {
                metrics::counter!("conf_runtime_publish_failures_total").increment(1);
                tracing::warn!(path = %path, error = %e, "Publish failed, retrying in background");
                self.inner.schedule_retry();
                Err(e)
            }
        }
    }

    /// Remove the discovery node and stop any pending publish retry.
    ///
    /// When the registry refuses the delete with a transient error the
    /// removal is parked and retried in the background until it succeeds;
    /// the error is still returned.
    pub async fn clear(&self) -> Result<(), RegistryError> {
        let Some(publication) = self.inner.current.lock().take() else {
            return Ok(());
        };
        self.inner.cancel_retry();

        match self.inner.delete_stale(&publication.path).await {
            Ok(()) => {
                tracing::info!(path = %publication.path, "Discovery node removed");
                Ok(())
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(path = %publication.path, error = %e, "Failed to remove discovery node, retrying");
                *self.inner.removal.lock() = Some(publication.path);
                self.inner.schedule_removal();
                Err(e)
            }
            Err(e) => {
                tracing::warn!(path = %publication.path, error = %e, "Failed to remove discovery node");
                Err(e)
            }
        }
    }

    /// Path whose removal is still being retried, if any.
    pub fn pending_removal(&self) -> Option<String> {
        self.inner.removal.lock().clone()
    }

    /// Path of the active publication, if any.
    pub fn published_path(&self) -> Option<String> {
        self.inner.current.lock().as_ref().map(|p| p.path.clone())
    }

    /// Whether a background retry is pending.
    pub fn is_retrying(&self) -> bool {
        self.inner.retry.lock().as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn paths(&self) -> &ConfPaths {
        &self.paths
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.keeper.abort();
        self.inner.cancel_retry();
        self.inner.cancel_removal();
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("discovery_dir", &self.paths.discovery_dir())
            .field("published", &self.published_path())
            .field("pending_removal", &self.pending_removal())
            .finish()
    }
}

impl Inner {
    /// Create the current node, taking over a stale node left at the same path.
    async fn write_current(&self) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;
        let Some(publication) = self.current.lock().clone() else {
            return Ok(());
        };
        match self.registry.create(&publication.path, &publication.payload, true).await {
            Ok(()) => Ok(()),
            Err(RegistryError::NodeExists(_)) => {
                self.remove(&publication.path).await;
                self.registry.create(&publication.path, &publication.payload, true).await
            }
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, path: &str) {
        match self.registry.delete(path).await {
            Ok(()) | Err(RegistryError::NodeNotFound(_)) => {}
            Err(e) => tracing::debug!(path = %path, error = %e, "Failed to remove stale discovery node"),
        }
    }

    /// Delete `path` unless it has become the current publication again.
    async fn delete_stale(&self, path: &str) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;
        if self.current.lock().as_ref().is_some_and(|p| p.path == path) {
            return Ok(());
        }
        match self.registry.delete(path).await {
            Ok(()) | Err(RegistryError::NodeNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Try the parked removal once. Returns true when nothing is left to do.
    async fn retry_removal(&self) -> bool {
        let Some(path) = self.removal.lock().clone() else {
            return true;
        };
        let result = self.delete_stale(&path).await;
        let done = match &result {
            Ok(()) => {
                tracing::info!(path = %path, "Discovery node removed after retry");
                true
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(path = %path, error = %e, "Discovery node removal retry failed");
                false
            }
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Giving up on discovery node removal");
                true
            }
        };
        if done {
            let mut removal = self.removal.lock();
            if removal.as_deref() == Some(path.as_str()) {
                removal.take();
            }
        }
        done
    }

    fn cancel_removal(&self) {
        if let Some(task) = self.removal_retry.lock().take() {
            task.abort();
        }
    }

    fn schedule_removal(self: &Arc<Self>) {
        let mut slot = self.removal_retry.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let inner = self.clone();
        *slot = Some(tokio::spawn(async move {
            let mut attempt = 0;
            loop {
                attempt += 1;
                tokio::time::sleep(inner.backoff.delay(attempt)).await;
                if inner.retry_removal().await {
                    return;
                }
            }
        }));
    }

    fn cancel_retry(&self) {
        if let Some(task) = self.retry.lock().take() {
            task.abort();
        }
    }

    fn schedule_retry(self: &Arc<Self>) {
        let mut slot = self.retry.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let inner = self.clone();
        *slot = Some(tokio::spawn(async move {
            let mut attempt = 0;
            loop {
                attempt += 1;
                tokio::time::sleep(inner.backoff.delay(attempt)).await;
                if inner.current.lock().is_none() {
                    return;
                }
                match inner.write_current().await {
                    Ok(()) => {
                        tracing::info!(attempt, "Discovery node published after retry");
                        return;
                    }
                    Err(e) => {
                        metrics::counter!("conf_runtime_publish_failures_total").increment(1);
                        tracing::warn!(attempt, error = %e, "Publish retry failed");
                    }
                }
            }
        }));
    }
}

async fn keep_published(inner: Arc<Inner>, mut events: tokio::sync::broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Reconnected) | Err(RecvError::Lagged(_)) => {
                if !inner.retry_removal().await {
                    inner.schedule_removal();
                }
                let path = match inner.current.lock().as_ref() {
                    Some(publication) => publication.path.clone(),
                    None => continue,
                };
                match inner.write_current().await {
                    Ok(()) => {
                        inner.cancel_retry();
                        tracing::info!(path = %path, "Discovery node restored after reconnect");
                    }
                    Err(e) => {
                        tracing::warn!(path = %path, error = %e, "Failed to restore discovery node");
                        inner.schedule_retry();
                    }
                }
            }
            Ok(ConnectionEvent::Disconnected) => {}
            Err(RecvError::Closed) => return,
        }
    }
}
