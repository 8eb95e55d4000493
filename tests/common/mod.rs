//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Notify};

use conf_runtime::conf::{ConfPaths, ConfSnapshot, ServerConf, ServerType};
use conf_runtime::registry::{ConnectionEvent, MemoryRegistry, Registry, RegistryError, Subscription};
use conf_runtime::server::{Listener, ListenerError, ListenerFactory};

pub const PLATFORM: &str = "hydra";
pub const SYSTEM: &str = "order";
pub const CLUSTER: &str = "prod";

pub fn paths(server_type: ServerType) -> ConfPaths {
    ConfPaths::new(PLATFORM, SYSTEM, CLUSTER, server_type)
}

pub fn main_conf(address: &str) -> Vec<u8> {
    format!(r#"{{"address":"{}"}}"#, address).into_bytes()
}

pub fn snapshot(address: &str) -> ConfSnapshot {
    ConfSnapshot::new(main_conf(address))
}

/// What the mock listeners did, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Started(String),
    Stopped(String),
}

/// Blocks listener starts while closed.
pub struct Gate {
    open: watch::Sender<bool>,
    entered: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        let (open, _) = watch::channel(true);
        Arc::new(Self { open, entered: Notify::new() })
    }

    pub fn close(&self) {
        self.open.send_replace(false);
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Resolve once a start is blocked on this gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    async fn pass(&self) {
        if *self.open.borrow() {
            return;
        }
        self.entered.notify_one();
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Listener factory that records every start/stop instead of binding.
pub struct MockFactory {
    log: Arc<Mutex<Vec<ListenerEvent>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    gate: Arc<Gate>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(Mutex::new(HashSet::new())),
            gate: Gate::new(),
        })
    }

    /// Make listeners for `address` fail to start.
    pub fn fail_on(&self, address: &str) {
        self.failing.lock().insert(address.to_string());
    }

    /// Let listeners for `address` start again.
    pub fn heal(&self, address: &str) {
        self.failing.lock().remove(address);
    }

    pub fn gate(&self) -> Arc<Gate> {
        self.gate.clone()
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.log.lock().clone()
    }

    pub fn starts(&self) -> usize {
        self.events().iter().filter(|e| matches!(e, ListenerEvent::Started(_))).count()
    }

    pub fn stops(&self) -> usize {
        self.events().iter().filter(|e| matches!(e, ListenerEvent::Stopped(_))).count()
    }
}

impl ListenerFactory for MockFactory {
    fn build(&self, conf: &ServerConf) -> Result<Box<dyn Listener>, ListenerError> {
        Ok(Box::new(MockListener {
            address: conf.binding().address.clone(),
            log: self.log.clone(),
            failing: self.failing.clone(),
            gate: self.gate.clone(),
        }))
    }
}

struct MockListener {
    address: String,
    log: Arc<Mutex<Vec<ListenerEvent>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    gate: Arc<Gate>,
}

#[async_trait]
impl Listener for MockListener {
    async fn start(&mut self) -> Result<(), ListenerError> {
        self.gate.pass().await;
        if self.failing.lock().contains(&self.address) {
            return Err(ListenerError::Bind {
                address: self.address.clone(),
                source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
            });
        }
        self.log.lock().push(ListenerEvent::Started(self.address.clone()));
        Ok(())
    }

    async fn shutdown(&mut self, _grace: Duration) -> Result<(), ListenerError> {
        self.log.lock().push(ListenerEvent::Stopped(self.address.clone()));
        Ok(())
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn service_address(&self) -> String {
        format!("http://127.0.0.1{}", self.address)
    }
}

/// Session wrapper that injects registry faults on demand.
#[derive(Debug)]
pub struct FaultyRegistry {
    inner: Arc<MemoryRegistry>,
    failing_deletes: Mutex<usize>,
    slow_gets: Mutex<HashMap<String, Duration>>,
}

impl FaultyRegistry {
    pub fn new(inner: Arc<MemoryRegistry>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing_deletes: Mutex::new(0),
            slow_gets: Mutex::new(HashMap::new()),
        })
    }

    /// Fail the next `count` deletes with `ConnectionLost` while the session stays up.
    pub fn fail_deletes(&self, count: usize) {
        *self.failing_deletes.lock() = count;
    }

    /// Hold the result of the next `get` of `path` for `delay` after reading it.
    pub fn slow_next_get(&self, path: &str, delay: Duration) {
        self.slow_gets.lock().insert(path.to_string(), delay);
    }
}

#[async_trait]
impl Registry for FaultyRegistry {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, i64), RegistryError> {
        let result = self.inner.get(path).await;
        let delay = self.slow_gets.lock().remove(path);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> Result<(), RegistryError> {
        self.inner.create(path, data, ephemeral).await
    }

    async fn set(&self, path: &str, data: &[u8], expected_version: Option<i64>) -> Result<i64, RegistryError> {
        self.inner.set(path, data, expected_version).await
    }

    async fn delete(&self, path: &str) -> Result<(), RegistryError> {
        let fail = {
            let mut remaining = self.failing_deletes.lock();
            let fail = *remaining > 0;
            *remaining = remaining.saturating_sub(1);
            fail
        };
        if fail {
            return Err(RegistryError::ConnectionLost);
        }
        self.inner.delete(path).await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, RegistryError> {
        self.inner.children(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool, RegistryError> {
        self.inner.exists(path).await
    }

    async fn watch_value(&self, path: &str) -> Result<Subscription, RegistryError> {
        self.inner.watch_value(path).await
    }

    async fn watch_children(&self, path: &str) -> Result<Subscription, RegistryError> {
        self.inner.watch_children(path).await
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.connection_events()
    }

    async fn close(&self) -> Result<(), RegistryError> {
        self.inner.close().await
    }
}

/// Write a config node through `registry`, creating or overwriting it.
pub async fn write(registry: &dyn Registry, path: &str, data: &[u8]) {
    registry.put(path, data, false).await.unwrap();
}

/// A writer session sharing `registry`'s store.
pub fn writer(registry: &MemoryRegistry) -> MemoryRegistry {
    MemoryRegistry::with_store(registry.store())
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
