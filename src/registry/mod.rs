//! Registry subsystem.
//!
//! # Data Flow
//! ```text
//! registry address (zk:// | file:// | memory://)
//!     → address.rs (parse scheme)
//!     → connect() (construct one backend instance)
//!     → Arc<dyn Registry> shared with watcher tree + publisher
//!
//! Backend change
//!     → hub.rs / backend watch task
//!     → Subscription channel (one per watch registration)
//!     → single consuming worker per path
//! ```
//!
//! # Design Decisions
//! - One trait, three backends, selected by address scheme
//! - Watch callbacks are channels, not closures; consumers own ordering
//! - Delivery is at-least-once, so consumers re-read state on every event
//! - The registry is constructed explicitly and closed explicitly, never global

pub mod address;
pub mod error;
pub mod filesystem;
mod hub;
pub mod memory;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::resilience::backoff::BackoffPolicy;

pub use address::RegistryAddr;
pub use error::RegistryError;
pub use filesystem::FileSystemRegistry;
pub use memory::{MemoryRegistry, MemoryStore};

/// A read copy of a node held by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryNode {
    pub path: String,
    pub data: Vec<u8>,
    pub version: i64,
    pub children: Vec<String>,
}

/// What a watch registration observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    Value,
    Children,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ValueChanged,
    ChildAdded,
    ChildRemoved,
    Deleted,
}

/// A single change notification for a watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// The watched path (not the child's path for child events).
    pub path: String,
    pub kind: EventKind,
    /// Child name for `ChildAdded` / `ChildRemoved`, when the backend knows it.
    pub child: Option<String>,
}

impl WatchEvent {
    pub fn value(path: &str, kind: EventKind) -> Self {
        Self { path: path.to_string(), kind, child: None }
    }

    pub fn child(path: &str, kind: EventKind, child: &str) -> Self {
        Self { path: path.to_string(), kind, child: Some(child.to_string()) }
    }
}

/// Session-level notifications broadcast by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Disconnected,
    /// Connection (or a new session) re-established; watches are re-armed.
    Reconnected,
}

/// A persistent watch registration.
///
/// Events arrive in order for this path. Dropping the subscription
/// unregisters it.
#[derive(Debug)]
pub struct Subscription {
    path: String,
    kind: WatchKind,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl Subscription {
    pub(crate) fn new(path: &str, kind: WatchKind, rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { path: path.to_string(), kind, rx }
    }

    /// Wait for the next event. Returns `None` once the backend closed the watch.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> WatchKind {
        self.kind
    }
}

/// Uniform CRUD + watch capability over hierarchical nodes.
///
/// Every method is safe to call concurrently. `create` makes missing
/// parents as persistent empty nodes.
#[async_trait]
pub trait Registry: Send + Sync + std::fmt::Debug {
    /// Node payload and version.
    async fn get(&self, path: &str) -> Result<(Vec<u8>, i64), RegistryError>;

    async fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> Result<(), RegistryError>;

    /// Overwrite a node's payload. With `expected_version`, fails with
    /// `VersionConflict` when the node moved on. Returns the new version.
    async fn set(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<i64>,
    ) -> Result<i64, RegistryError>;

    /// Remove a node and everything below it.
    async fn delete(&self, path: &str) -> Result<(), RegistryError>;

    async fn children(&self, path: &str) -> Result<Vec<String>, RegistryError>;

    async fn exists(&self, path: &str) -> Result<bool, RegistryError>;

    async fn watch_value(&self, path: &str) -> Result<Subscription, RegistryError>;

    async fn watch_children(&self, path: &str) -> Result<Subscription, RegistryError>;

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Cancel background work and release the connection. Later calls fail
    /// with `Closed`.
    async fn close(&self) -> Result<(), RegistryError>;

    /// Idempotent create-or-update.
    async fn put(&self, path: &str, data: &[u8], ephemeral: bool) -> Result<(), RegistryError> {
        match self.create(path, data, ephemeral).await {
            Err(RegistryError::NodeExists(_)) => self.set(path, data, None).await.map(|_| ()),
            other => other,
        }
    }

    async fn node(&self, path: &str) -> Result<RegistryNode, RegistryError> {
        let (data, version) = self.get(path).await?;
        let children = self.children(path).await?;
        Ok(RegistryNode { path: path.to_string(), data, version, children })
    }
}

/// Build the backend named by `addr`.
pub async fn connect(addr: &str, backoff: BackoffPolicy) -> Result<Arc<dyn Registry>, RegistryError> {
    let parsed = RegistryAddr::parse(addr)?;
    tracing::info!(registry = %parsed, proto = parsed.proto(), "Connecting registry");

    match parsed {
        RegistryAddr::Memory => Ok(Arc::new(MemoryRegistry::new())),
        RegistryAddr::FileSystem { root } => Ok(Arc::new(FileSystemRegistry::open(root).await?)),
        #[cfg(feature = "zookeeper")]
        RegistryAddr::Zookeeper { servers, chroot } => {
            let registry = zookeeper::ZkRegistry::connect(servers, chroot, backoff).await?;
            Ok(Arc::new(registry))
        }
        #[cfg(not(feature = "zookeeper"))]
        RegistryAddr::Zookeeper { .. } => {
            let _ = backoff;
            Err(RegistryError::Backend("zookeeper support not compiled in".into()))
        }
    }
}

/// Join path segments with single slashes.
pub fn join<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for part in parts {
        for seg in part.as_ref().split('/').filter(|s| !s.is_empty()) {
            out.push('/');
            out.push_str(seg);
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Check that `path` is absolute, has no empty segments and no trailing slash.
pub fn validate_path(path: &str) -> Result<(), RegistryError> {
    let valid = path == "/"
        || (path.starts_with('/')
            && !path.ends_with('/')
            && path[1..].split('/').all(|s| !s.is_empty() && s != "." && s != ".."));
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidPath(path.to_string()))
    }
}

/// Parent of an absolute path; `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of an absolute path.
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
