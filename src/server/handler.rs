//! Business handler capability.
//!
//! Handlers are registered by service name; the `router` sub-config maps
//! request paths onto those names.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

/// One request as seen by a handler.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub service: String,
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Context {
    /// Body parsed as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Handler result: an HTTP status plus a JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: serde_json::Value,
}

impl Reply {
    pub fn ok<T: Serialize>(body: T) -> Self {
        Self::with_status(200, body)
    }

    pub fn with_status<T: Serialize>(status: u16, body: T) -> Self {
        let body = serde_json::to_value(body).unwrap_or(serde_json::Value::Null);
        Self { status, body }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": message.into() }),
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: Context) -> Reply;
}

/// Services available to the bundled listener, keyed by name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: impl Into<String>, handler: Arc<dyn Handler>) {
        let service = service.into();
        tracing::debug!(service = %service, "Handler registered");
        self.handlers.insert(service, handler);
    }

    pub fn get(&self, service: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(service).map(|h| h.value().clone())
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry").field("services", &self.services()).finish()
    }
}
