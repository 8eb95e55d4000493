//! Startup orchestration.
//!
//! Order: connect registry → seed (optional) → per server type
//! { watcher tree → controller → driver }. Shutdown runs the reverse:
//! stop watching, stop drivers, shut controllers down concurrently, close
//! the registry last so unpublish still has a session.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::conf::seed::{apply_seed, load_seed};
use crate::conf::ServerType;
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::lifecycle::controller::{self, ControllerOptions, ResponsiveController};
use crate::lifecycle::hooks::HookRegistry;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals;
use crate::registry::{self, Registry};
use crate::server::ListenerFactory;
use crate::watcher::WatcherTree;

struct ServerSlot {
    controller: Arc<ResponsiveController>,
    tree: WatcherTree,
    driver: JoinHandle<()>,
}

/// A running set of controllers sharing one registry session.
pub struct Runtime {
    registry: Arc<dyn Registry>,
    instance_name: String,
    servers: BTreeMap<ServerType, ServerSlot>,
    shutdown: Shutdown,
}

impl Runtime {
    /// Connect to the configured registry and start every server type.
    /// `hooks` run around every listener start and close.
    pub async fn start(
        config: &RuntimeConfig,
        factory: Arc<dyn ListenerFactory>,
        hooks: Arc<HookRegistry>,
    ) -> Result<Self, RuntimeError> {
        let registry = registry::connect(&config.registry.address, config.registry.reconnect).await?;
        match Self::with_registry(config, registry.clone(), factory, hooks).await {
            Ok(runtime) => Ok(runtime),
            Err(e) => {
                let _ = registry.close().await;
                Err(e)
            }
        }
    }

    /// Start every server type against an already connected registry.
    pub async fn with_registry(
        config: &RuntimeConfig,
        registry: Arc<dyn Registry>,
        factory: Arc<dyn ListenerFactory>,
        hooks: Arc<HookRegistry>,
    ) -> Result<Self, RuntimeError> {
        if let Some(path) = &config.seed {
            let seed = load_seed(path)?;
            let created = apply_seed(registry.as_ref(), &seed, |t| config.paths(t)).await?;
            tracing::info!(seed = %path.display(), created, "Registry seeded");
        }

        let instance_name = config
            .cluster
            .instance_name
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let shutdown = Shutdown::new();
        let mut servers = BTreeMap::new();

        for server_type in &config.servers.types {
            let paths = config.paths(*server_type);
            let (tree, snapshots) =
                WatcherTree::start(registry.clone(), paths.clone(), config.debounce(), config.registry.reconnect)
                    .await?;

            let options = ControllerOptions {
                instance_name: instance_name.clone(),
                cluster_id: config.cluster_id(),
                drain_timeout: config.drain_timeout(),
                restart_on_sub_conf: config.servers.restart_on_sub_conf(*server_type),
                publish_backoff: config.lifecycle.publish_retry,
                hooks: hooks.clone(),
            };
            let controller = Arc::new(ResponsiveController::new(registry.clone(), paths, factory.clone(), options));
            let driver = tokio::spawn(controller::drive(controller.clone(), snapshots, shutdown.subscribe()));

            tracing::info!(server_type = %server_type, instance = %instance_name, "Server type registered");
            servers.insert(*server_type, ServerSlot { controller, tree, driver });
        }

        Ok(Self { registry, instance_name, servers, shutdown })
    }

    pub fn registry(&self) -> Arc<dyn Registry> {
        self.registry.clone()
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn controller(&self, server_type: ServerType) -> Option<Arc<ResponsiveController>> {
        self.servers.get(&server_type).map(|slot| slot.controller.clone())
    }

    pub fn server_types(&self) -> Vec<ServerType> {
        self.servers.keys().copied().collect()
    }

    /// Run until SIGINT/SIGTERM, then shut down.
    pub async fn run_until_signal(self) -> Result<(), RuntimeError> {
        signals::wait_for_termination().await;
        self.shutdown().await
    }

    /// Stop every server type and close the registry.
    pub async fn shutdown(mut self) -> Result<(), RuntimeError> {
        tracing::info!("Runtime shutting down");
        for slot in self.servers.values_mut() {
            slot.tree.stop();
        }
        self.shutdown.trigger();

        let mut stopping = Vec::with_capacity(self.servers.len());
        for (server_type, slot) in std::mem::take(&mut self.servers) {
            // A driver mid-transition finishes it before observing the trigger.
            if let Err(e) = slot.driver.await {
                tracing::warn!(server_type = %server_type, error = %e, "Controller driver ended abnormally");
            }
            let controller = slot.controller;
            stopping.push((server_type, tokio::spawn(async move { controller.shutdown().await })));
        }
        for (server_type, task) in stopping {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(server_type = %server_type, error = %e, "Controller shutdown failed"),
                Err(e) => tracing::warn!(server_type = %server_type, error = %e, "Controller shutdown panicked"),
            }
        }

        self.registry.close().await?;
        tracing::info!("Shutdown complete");
        Ok(())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("registry", &self.registry)
            .field("instance_name", &self.instance_name)
            .field("server_types", &self.server_types())
            .finish()
    }
}
