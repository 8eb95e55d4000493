//! Filesystem-backed registry.
//!
//! Layout: registry path `/a/b` is the directory `<root>/a/b`; its payload
//! lives in the hidden file `<root>/a/b/.node`; children are the
//! non-hidden sub-directories. Changes are observed with `notify`
//! (OS notification, or a `PollWatcher` where that cannot start) and fanned out through the
//! watch hub. Ephemeral nodes are tracked per instance and removed on
//! `close()`; there is no session, so a crashed process leaves them behind.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use notify::{Config, Event, EventKind as FsEventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::fs;
use tokio::sync::broadcast;

use crate::registry::hub::WatchHub;
use crate::registry::{
    parent, validate_path, ConnectionEvent, EventKind, Registry, RegistryError, Subscription,
    WatchEvent, WatchKind,
};

const DATA_FILE: &str = ".node";
const TEMP_FILE: &str = ".node.tmp";

/// Scan interval when OS notification is unavailable.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct FileSystemRegistry {
    root: PathBuf,
    hub: Arc<WatchHub>,
    online: Arc<AtomicBool>,
    ephemerals: Mutex<HashSet<String>>,
    /// Serializes writes so version checks and writes are atomic in-process.
    write_lock: tokio::sync::Mutex<()>,
    watcher: Mutex<Option<Box<dyn Watcher + Send>>>,
    closed: AtomicBool,
    conn_tx: broadcast::Sender<ConnectionEvent>,
}

impl std::fmt::Debug for FileSystemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemRegistry").field("root", &self.root).finish()
    }
}

impl FileSystemRegistry {
    /// Open (creating if needed) a registry rooted at `root` and start
    /// watching it with OS notification, polling if that fails to start.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let root = prepare_root(root.into()).await?;
        let hub = Arc::new(WatchHub::default());
        let watcher = match native_watcher(&root, &hub) {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::warn!(root = ?root, error = %e, "OS file notification unavailable, polling");
                poll_watcher(&root, &hub, DEFAULT_POLL_INTERVAL)?
            }
        };
        Ok(Self::assemble(root, hub, watcher))
    }

    /// Open a registry that always scans for changes every `interval`.
    /// Suits network mounts where OS notification is silent.
    pub async fn open_polling(root: impl Into<PathBuf>, interval: Duration) -> Result<Self, RegistryError> {
        let root = prepare_root(root.into()).await?;
        let hub = Arc::new(WatchHub::default());
        let watcher = poll_watcher(&root, &hub, interval)?;
        Ok(Self::assemble(root, hub, watcher))
    }

    fn assemble(root: PathBuf, hub: Arc<WatchHub>, watcher: Box<dyn Watcher + Send>) -> Self {
        tracing::info!(root = ?root, "Filesystem registry opened");
        let (conn_tx, _) = broadcast::channel(4);
        Self {
            root,
            hub,
            online: Arc::new(AtomicBool::new(true)),
            ephemerals: Mutex::new(HashSet::new()),
            write_lock: tokio::sync::Mutex::new(()),
            watcher: Mutex::new(Some(watcher)),
            closed: AtomicBool::new(false),
            conn_tx,
        }
    }

    fn dir(&self, path: &str) -> PathBuf {
        let mut dir = self.root.clone();
        dir.extend(path.split('/').filter(|s| !s.is_empty()));
        dir
    }

    fn check(&self, path: &str) -> Result<PathBuf, RegistryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }
        validate_path(path)?;
        Ok(self.dir(path))
    }

    async fn write_data(dir: &Path, data: &[u8]) -> Result<i64, RegistryError> {
        let tmp = dir.join(TEMP_FILE);
        let target = dir.join(DATA_FILE);
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &target).await?;
        version_of(&target).await
    }
}

async fn prepare_root(root: PathBuf) -> Result<PathBuf, RegistryError> {
    fs::create_dir_all(&root).await?;
    Ok(fs::canonicalize(&root).await?)
}

fn event_handler(root: &Path, hub: &Arc<WatchHub>) -> impl FnMut(notify::Result<Event>) + Send + 'static {
    let root = root.to_path_buf();
    let hub = hub.clone();
    move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for (kind, ev) in translate(&root, &event) {
                hub.dispatch(kind, ev);
            }
        }
        Err(e) => tracing::error!(error = ?e, "Filesystem registry watch error"),
    }
}

fn native_watcher(root: &Path, hub: &Arc<WatchHub>) -> Result<Box<dyn Watcher + Send>, RegistryError> {
    let mut watcher = RecommendedWatcher::new(event_handler(root, hub), Config::default())
        .map_err(|e| RegistryError::Backend(e.to_string()))?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| RegistryError::Backend(e.to_string()))?;
    Ok(Box::new(watcher))
}

fn poll_watcher(
    root: &Path,
    hub: &Arc<WatchHub>,
    interval: Duration,
) -> Result<Box<dyn Watcher + Send>, RegistryError> {
    let mut watcher = PollWatcher::new(event_handler(root, hub), Config::default().with_poll_interval(interval))
        .map_err(|e| RegistryError::Backend(e.to_string()))?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| RegistryError::Backend(e.to_string()))?;
    Ok(Box::new(watcher))
}

async fn is_dir(dir: &Path) -> Result<bool, RegistryError> {
    match fs::metadata(dir).await {
        Ok(meta) => Ok(meta.is_dir()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Modification time in nanoseconds, or 0 when the node has no payload.
async fn version_of(file: &Path) -> Result<i64, RegistryError> {
    match fs::metadata(file).await {
        Ok(meta) => {
            let nanos = meta
                .modified()?
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            Ok(i64::try_from(nanos).unwrap_or(i64::MAX))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn registry_path(root: &Path, fs_path: &Path) -> Option<String> {
    let rel = fs_path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(seg) => {
                out.push('/');
                out.push_str(seg.to_str()?);
            }
            _ => return None,
        }
    }
    Some(if out.is_empty() { "/".to_string() } else { out })
}

/// Map one filesystem event onto registry watch events.
fn translate(root: &Path, event: &Event) -> Vec<(WatchKind, WatchEvent)> {
    let removed = matches!(event.kind, FsEventKind::Remove(_));
    let relevant = removed || matches!(event.kind, FsEventKind::Create(_) | FsEventKind::Modify(_));
    if !relevant {
        return Vec::new();
    }

    let mut out = Vec::new();
    for fs_path in &event.paths {
        let Some(file_name) = fs_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if file_name == DATA_FILE {
            let Some(node) = fs_path.parent().and_then(|d| registry_path(root, d)) else {
                continue;
            };
            let kind = if removed { EventKind::Deleted } else { EventKind::ValueChanged };
            out.push((WatchKind::Value, WatchEvent::value(&node, kind)));
            continue;
        }
        if file_name.starts_with('.') {
            continue;
        }
        // Anything else under the root is a node directory.
        let Some(node) = registry_path(root, fs_path) else {
            continue;
        };
        let Some(parent_path) = parent(&node) else {
            continue;
        };
        match event.kind {
            FsEventKind::Create(_) => {
                out.push((WatchKind::Children, WatchEvent::child(parent_path, EventKind::ChildAdded, file_name)));
            }
            FsEventKind::Remove(_) => {
                out.push((WatchKind::Children, WatchEvent::child(parent_path, EventKind::ChildRemoved, file_name)));
                out.push((WatchKind::Value, WatchEvent::value(&node, EventKind::Deleted)));
                out.push((WatchKind::Children, WatchEvent::value(&node, EventKind::Deleted)));
            }
            _ => {
                // Renames surface as Modify(Name); let child watchers re-list.
                out.push((WatchKind::Children, WatchEvent::child(parent_path, EventKind::ChildAdded, file_name)));
            }
        }
    }
    out
}

#[async_trait]
impl Registry for FileSystemRegistry {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, i64), RegistryError> {
        let dir = self.check(path)?;
        if !is_dir(&dir).await? {
            return Err(RegistryError::NodeNotFound(path.to_string()));
        }
        let file = dir.join(DATA_FILE);
        match fs::read(&file).await {
            Ok(data) => Ok((data, version_of(&file).await?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((Vec::new(), 0)),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> Result<(), RegistryError> {
        let dir = self.check(path)?;
        if path == "/" {
            return Err(RegistryError::NodeExists(path.to_string()));
        }
        let _guard = self.write_lock.lock().await;
        if let Some(parent_dir) = dir.parent() {
            fs::create_dir_all(parent_dir).await?;
        }
        match fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(RegistryError::NodeExists(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        Self::write_data(&dir, data).await?;
        if ephemeral {
            self.ephemerals.lock().insert(path.to_string());
        }
        Ok(())
    }

    async fn set(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<i64>,
    ) -> Result<i64, RegistryError> {
        let dir = self.check(path)?;
        let _guard = self.write_lock.lock().await;
        if !is_dir(&dir).await? {
            return Err(RegistryError::NodeNotFound(path.to_string()));
        }
        if let Some(expected) = expected_version {
            if version_of(&dir.join(DATA_FILE)).await? != expected {
                return Err(RegistryError::VersionConflict { path: path.to_string(), expected });
            }
        }
        Self::write_data(&dir, data).await
    }

    async fn delete(&self, path: &str) -> Result<(), RegistryError> {
        let dir = self.check(path)?;
        if path == "/" {
            return Err(RegistryError::InvalidPath(path.to_string()));
        }
        let _guard = self.write_lock.lock().await;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::NodeNotFound(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        let prefix = format!("{}/", path);
        self.ephemerals
            .lock()
            .retain(|p| p != path && !p.starts_with(&prefix));
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, RegistryError> {
        let dir = self.check(path)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::NodeNotFound(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn exists(&self, path: &str) -> Result<bool, RegistryError> {
        let dir = self.check(path)?;
        is_dir(&dir).await
    }

    async fn watch_value(&self, path: &str) -> Result<Subscription, RegistryError> {
        self.check(path)?;
        Ok(self.hub.subscribe(WatchKind::Value, path, self.online.clone()))
    }

    async fn watch_children(&self, path: &str) -> Result<Subscription, RegistryError> {
        self.check(path)?;
        Ok(self.hub.subscribe(WatchKind::Children, path, self.online.clone()))
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.conn_tx.subscribe()
    }

    async fn close(&self) -> Result<(), RegistryError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let ephemerals: Vec<String> = self.ephemerals.lock().drain().collect();
        let _guard = self.write_lock.lock().await;
        for path in ephemerals {
            let dir = self.dir(&path);
            if let Err(e) = fs::remove_dir_all(&dir).await {
                tracing::warn!(path = %path, error = %e, "Failed to remove ephemeral node");
            }
        }
        self.watcher.lock().take();
        self.hub.clear();
        tracing::info!(root = ?self.root, "Filesystem registry closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};

    #[tokio::test]
    async fn test_crud() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = FileSystemRegistry::open(tmp.path()).await.unwrap();

        reg.create("/p/s/c/conf/api/main", br#"{"address":":8080"}"#, false).await.unwrap();
        assert!(reg.exists("/p/s/c/conf/api").await.unwrap());
        assert_eq!(reg.children("/p/s/c/conf/api").await.unwrap(), vec!["main".to_string()]);

        let (data, version) = reg.get("/p/s/c/conf/api/main").await.unwrap();
        assert_eq!(data, br#"{"address":":8080"}"#);
        assert!(matches!(
            reg.set("/p/s/c/conf/api/main", b"{}", Some(version + 1)).await,
            Err(RegistryError::VersionConflict { .. })
        ));
        reg.set("/p/s/c/conf/api/main", b"{}", Some(version)).await.unwrap();
        assert_eq!(reg.get("/p/s/c/conf/api/main").await.unwrap().0, b"{}");

        reg.delete("/p/s/c/conf/api/main").await.unwrap();
        assert!(matches!(reg.get("/p/s/c/conf/api/main").await, Err(RegistryError::NodeNotFound(_))));
    }

    #[tokio::test]
    async fn test_ephemeral_removed_on_close() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = FileSystemRegistry::open(tmp.path()).await.unwrap();
        reg.create("/d/api/svc1", b"{}", true).await.unwrap();
        reg.create("/d/api/keep", b"{}", false).await.unwrap();
        reg.close().await.unwrap();

        let reopened = FileSystemRegistry::open(tmp.path()).await.unwrap();
        assert_eq!(reopened.children("/d/api").await.unwrap(), vec!["keep".to_string()]);
        assert!(matches!(reg.get("/d").await, Err(RegistryError::Closed)));
    }

    #[test]
    fn test_translate_events() {
        let root = PathBuf::from("/tmp/reg");
        let event = Event::new(FsEventKind::Modify(ModifyKind::Any)).add_path(root.join("a/b/.node"));
        let out = translate(&root, &event);
        assert_eq!(out, vec![(WatchKind::Value, WatchEvent::value("/a/b", EventKind::ValueChanged))]);

        let event = Event::new(FsEventKind::Create(CreateKind::Folder)).add_path(root.join("a/c"));
        let out = translate(&root, &event);
        assert_eq!(out, vec![(WatchKind::Children, WatchEvent::child("/a", EventKind::ChildAdded, "c"))]);

        let event = Event::new(FsEventKind::Remove(RemoveKind::Folder)).add_path(root.join("a/c"));
        assert_eq!(translate(&root, &event).len(), 3);

        let event = Event::new(FsEventKind::Create(CreateKind::File)).add_path(root.join("a/.node.tmp"));
        assert!(translate(&root, &event).is_empty());
    }

    #[tokio::test]
    async fn test_watch_value_sees_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = FileSystemRegistry::open(tmp.path()).await.unwrap();
        reg.create("/w/main", b"1", false).await.unwrap();

        let mut sub = reg.watch_value("/w/main").await.unwrap();
        reg.set("/w/main", b"2", None).await.unwrap();

        let ev = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("no filesystem event")
            .unwrap();
        assert_eq!(ev.path, "/w/main");
    }

    #[tokio::test]
    async fn test_polling_watcher_sees_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = FileSystemRegistry::open_polling(tmp.path(), Duration::from_millis(50)).await.unwrap();
        reg.create("/w/main", b"1", false).await.unwrap();
        let mut sub = reg.watch_value("/w/main").await.unwrap();

        // Let the poller record the current mtime before changing it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        reg.set("/w/main", b"22", None).await.unwrap();

        let ev = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("no polled event")
            .unwrap();
        assert_eq!(ev.path, "/w/main");
        assert_eq!(reg.get("/w/main").await.unwrap().0, b"22");
    }
}
