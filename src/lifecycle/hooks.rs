//! Starting and closing hooks.
//!
//! Hooks let embedding code prepare resources a server type depends on
//! before its listener comes up, and release them once it is gone. A
//! starting hook that fails vetoes the start; closing hook failures are
//! logged and do not stop the remaining hooks.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::conf::ServerConf;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A starting hook refused the configuration.
#[derive(Debug, Error)]
#[error("starting hook '{hook}' refused: {source}")]
pub struct HookVeto {
    pub hook: String,
    #[source]
    pub source: HookError,
}

#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// Runs before the listener is built.
    async fn starting(&self, _conf: &ServerConf) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs after the listener has closed.
    async fn closing(&self, _conf: &ServerConf) -> Result<(), HookError> {
        Ok(())
    }
}

/// Named hooks, run in registration order.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<(String, Arc<dyn LifecycleHook>)>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, hook: Arc<dyn LifecycleHook>) {
        let name = name.into();
        tracing::debug!(hook = %name, "Lifecycle hook registered");
        self.hooks.write().push((name, hook));
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn LifecycleHook>)> {
        self.hooks.read().clone()
    }

    /// Stops at the first refusal.
    pub async fn run_starting(&self, conf: &ServerConf) -> Result<(), HookVeto> {
        for (name, hook) in self.snapshot() {
            if let Err(source) = hook.starting(conf).await {
                tracing::warn!(hook = %name, server_type = %conf.server_type, error = %source, "Starting hook refused");
                return Err(HookVeto { hook: name, source });
            }
        }
        Ok(())
    }

    pub async fn run_closing(&self, conf: &ServerConf) {
        for (name, hook) in self.snapshot() {
            if let Err(e) = hook.closing(conf).await {
                tracing::warn!(hook = %name, server_type = %conf.server_type, error = %e, "Closing hook failed");
            }
        }
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.hooks.read().iter().map(|(name, _)| name.clone()).collect();
        f.debug_struct("HookRegistry").field("hooks", &names).finish()
    }
}
