//! Responsive lifecycle controller.
//!
//! One controller owns one server type's listener and discovery entry.
//! Every transition runs under a single async lock held for its whole
//! duration, publish and unpublish round-trips included. Configurations
//! that arrive while a transition is running are parked in a one-slot
//! mailbox tagged with a ticket; only the newest survives, and only its
//! caller applies it, so a burst of N notifications yields exactly one
//! further transition and every other caller learns it was superseded.
//!
//! ```text
//! Stopped ──start──▶ Starting ──ok──▶ Running ──notify(changed)──▶ Restarting ──ok──▶ Running
//!    ▲                  │ err            │                             │ err
//!    └──────────────────┴────────────────┴──shutdown──▶ ShuttingDown ──┴──────────▶ Stopped
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::conf::{Comparer, ConfError, ConfPaths, ConfSnapshot, ServerConf, ServerType};
use crate::lifecycle::hooks::{HookRegistry, HookVeto};
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::publish::{DiscoveryMetadata, Publisher};
use crate::registry::Registry;
use crate::resilience::backoff::BackoffPolicy;
use crate::server::{Listener, ListenerError, ListenerFactory};

/// Default bound on listener drain during shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Restarting,
    ShuttingDown,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Restarting => "restarting",
            ServerState::ShuttingDown => "shutting_down",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            ServerState::Stopped => 0.0,
            ServerState::Starting => 1.0,
            ServerState::Running => 2.0,
            ServerState::Restarting => 3.0,
            ServerState::ShuttingDown => 4.0,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a `notify` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Nothing binding-relevant or sub-config changed; listener untouched.
    Unchanged,
    /// Listener rebuilt and republished.
    Restarted,
    /// Sub-configs changed but the policy skips restarts; new baseline committed.
    Committed,
    /// A newer configuration arrived before this one was applied; this
    /// one was dropped.
    Superseded,
}

/// Why a listener could not be brought up.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Vetoed(#[from] HookVeto),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Conf(#[from] ConfError),

    #[error("server failed to start: {0}")]
    StartFailure(#[source] LaunchError),

    #[error("restart failed, instance stopped: {0}")]
    RestartFailure(#[source] LaunchError),

    #[error("server is not running")]
    NotRunning,

    #[error("server already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Discovery node name.
    pub instance_name: String,
    pub cluster_id: String,
    pub drain_timeout: Duration,
    /// Restart when only sub-configs changed.
    pub restart_on_sub_conf: bool,
    /// Also paces retries of a discovery entry removal that failed.
    pub publish_backoff: BackoffPolicy,
    pub hooks: Arc<HookRegistry>,
}

impl ControllerOptions {
    pub fn new(instance_name: impl Into<String>, cluster_id: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            cluster_id: cluster_id.into(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            restart_on_sub_conf: true,
            publish_backoff: BackoffPolicy::default(),
            hooks: Arc::new(HookRegistry::new()),
        }
    }
}

/// Addresses of the running listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub address: String,
    pub service_address: String,
}

enum Instance {
    Stopped,
    Running { listener: Box<dyn Listener> },
}

struct Core {
    instance: Instance,
    comparer: Comparer,
}

/// One-slot mailbox for configurations waiting on the transition lock.
#[derive(Default)]
struct Mailbox {
    issued: u64,
    parked: Option<(u64, ConfSnapshot)>,
}

pub struct ResponsiveController {
    server_type: ServerType,
    options: ControllerOptions,
    factory: Arc<dyn ListenerFactory>,
    publisher: Publisher,
    /// Transition lock.
    core: tokio::sync::Mutex<Core>,
    /// Newest configuration not yet applied.
    pending: parking_lot::Mutex<Mailbox>,
    state: watch::Sender<ServerState>,
    info: parking_lot::Mutex<Option<InstanceInfo>>,
}

impl ResponsiveController {
    pub fn new(
        registry: Arc<dyn Registry>,
        paths: ConfPaths,
        factory: Arc<dyn ListenerFactory>,
        options: ControllerOptions,
    ) -> Self {
        let publisher = Publisher::new(registry, paths.clone(), options.publish_backoff);
        let (state, _) = watch::channel(ServerState::Stopped);
        Self {
            server_type: paths.server_type,
            options,
            factory,
            publisher,
            core: tokio::sync::Mutex::new(Core { instance: Instance::Stopped, comparer: Comparer::new(paths) }),
            pending: parking_lot::Mutex::new(Mailbox::default()),
            state,
            info: parking_lot::Mutex::new(None),
        }
    }

    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Configured address of the running listener, e.g. `":9090"`.
    pub fn address(&self) -> Option<String> {
        self.info.lock().as_ref().map(|i| i.address.clone())
    }

    pub fn instance_info(&self) -> Option<InstanceInfo> {
        self.info.lock().clone()
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Last committed configuration.
    pub async fn committed(&self) -> Option<ServerConf> {
        self.core.lock().await.comparer.committed().cloned()
    }

    /// Stopped → Starting → Running, or back to Stopped with the error.
    pub async fn start(&self, snapshot: ConfSnapshot) -> Result<(), ControllerError> {
        let mut core = self.core.lock().await;
        if matches!(core.instance, Instance::Running { .. }) {
            return Err(ControllerError::AlreadyStarted);
        }
        // A start supersedes anything parked before it.
        self.pending.lock().parked = None;

        core.comparer.update_snapshot(&snapshot)?;
        let conf = core.comparer.candidate().cloned().ok_or(ControllerError::NotRunning)?;
        self.set_state(ServerState::Starting);
        self.record_transition("start");

        match self.launch(&conf).await {
            Ok(listener) => {
                core.comparer.commit();
                core.instance = Instance::Running { listener };
                self.set_state(ServerState::Running);
                Ok(())
            }
            Err(e) => {
                core.comparer.discard();
                self.set_state(ServerState::Stopped);
                tracing::error!(server_type = %self.server_type, error = %e, "Server failed to start");
                Err(ControllerError::StartFailure(e))
            }
        }
    }

    /// Apply a new configuration to a running instance.
    ///
    /// Concurrent calls coalesce: a caller whose configuration was replaced
    /// by a newer one before the lock came free gets `Superseded`, and the
    /// caller of the newest configuration applies it and gets its outcome.
    pub async fn notify(&self, snapshot: ConfSnapshot) -> Result<NotifyOutcome, ControllerError> {
        let ticket = {
            let mut mailbox = self.pending.lock();
            mailbox.issued += 1;
            let ticket = mailbox.issued;
            mailbox.parked = Some((ticket, snapshot));
            ticket
        };

        let mut core = self.core.lock().await;
        let snapshot = {
            let mut mailbox = self.pending.lock();
            match mailbox.parked.take() {
                Some((parked, snapshot)) if parked == ticket => Some(snapshot),
                newer => {
                    mailbox.parked = newer;
                    None
                }
            }
        };
        let Some(snapshot) = snapshot else {
            tracing::debug!(server_type = %self.server_type, ticket, "Configuration superseded");
            return Ok(NotifyOutcome::Superseded);
        };
        if matches!(core.instance, Instance::Stopped) {
            return Err(ControllerError::NotRunning);
        }

        let result = match core.comparer.update_snapshot(&snapshot) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    server_type = %self.server_type,
                    error = %e,
                    "Rejected configuration, keeping previous"
                );
                return Err(e.into());
            }
        };

        if !result.changed {
            core.comparer.commit();
            tracing::debug!(server_type = %self.server_type, "Configuration unchanged");
            return Ok(NotifyOutcome::Unchanged);
        }
        if !result.value_changed && !self.options.restart_on_sub_conf {
            core.comparer.commit();
            self.record_transition("commit");
            tracing::info!(server_type = %self.server_type, "Sub-configs updated without restart");
            return Ok(NotifyOutcome::Committed);
        }

        tracing::info!(
            server_type = %self.server_type,
            value_changed = result.value_changed,
            sub_conf_changed = result.sub_conf_changed,
            "Configuration changed, restarting"
        );
        self.restart(&mut core).await?;
        Ok(NotifyOutcome::Restarted)
    }

    /// Unpublish, close the listener, drain, run closing hooks, and stop.
    /// Idempotent.
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        let mut core = self.core.lock().await;
        self.pending.lock().parked = None;

        let Instance::Running { listener } = std::mem::replace(&mut core.instance, Instance::Stopped) else {
            return Ok(());
        };
        self.set_state(ServerState::ShuttingDown);
        self.record_transition("shutdown");

        let running = core.comparer.committed().cloned();
        self.unpublish().await;
        self.close(listener, running.as_ref()).await;

        self.set_state(ServerState::Stopped);
        tracing::info!(server_type = %self.server_type, "Server stopped");
        Ok(())
    }

    async fn restart(&self, core: &mut Core) -> Result<(), ControllerError> {
        let conf = core.comparer.candidate().cloned().ok_or(ControllerError::NotRunning)?;
        let Instance::Running { listener } = std::mem::replace(&mut core.instance, Instance::Stopped) else {
            return Err(ControllerError::NotRunning);
        };
        self.set_state(ServerState::Restarting);
        self.record_transition("restart");

        let running = core.comparer.committed().cloned();
        self.unpublish().await;
        self.close(listener, running.as_ref()).await;

        match self.launch(&conf).await {
            Ok(listener) => {
                core.comparer.commit();
                core.instance = Instance::Running { listener };
                self.set_state(ServerState::Running);
                Ok(())
            }
            Err(e) => {
                core.comparer.discard();
                metrics::counter!("conf_runtime_restart_failures_total").increment(1);
                self.set_state(ServerState::Stopped);
                tracing::error!(server_type = %self.server_type, error = %e, "Restart failed, instance stopped");
                Err(ControllerError::RestartFailure(e))
            }
        }
    }

    /// Run starting hooks, then build, start and publish a listener. A
    /// publish failure is not fatal: the publisher keeps retrying while the
    /// listener serves.
    async fn launch(&self, conf: &ServerConf) -> Result<Box<dyn Listener>, LaunchError> {
        self.options.hooks.run_starting(conf).await?;
        let mut listener = self.factory.build(conf)?;
        listener.start().await?;

        let info = InstanceInfo {
            address: listener.address().to_string(),
            service_address: listener.service_address(),
        };
        let metadata = DiscoveryMetadata::new(&info.service_address, &self.options.cluster_id);
        if let Err(e) = self.publisher.publish(&self.options.instance_name, &metadata).await {
            tracing::warn!(
                server_type = %self.server_type,
                error = %e,
                "Serving without discovery entry until publish succeeds"
            );
        }
        tracing::info!(
            server_type = %self.server_type,
            address = %info.address,
            service = %info.service_address,
            "Server running"
        );
        *self.info.lock() = Some(info);
        Ok(listener)
    }

    /// Remove the discovery entry. A removal the registry refused stays with
    /// the publisher, which retries it until it lands.
    async fn unpublish(&self) {
        if let Err(e) = self.publisher.clear().await {
            tracing::warn!(
                server_type = %self.server_type,
                error = %e,
                pending = ?self.publisher.pending_removal(),
                "Discovery entry removal handed to background retry"
            );
        }
    }

    async fn close(&self, mut listener: Box<dyn Listener>, conf: Option<&ServerConf>) {
        self.info.lock().take();
        let grace = self.options.drain_timeout;
        match tokio::time::timeout(grace + Duration::from_secs(1), listener.shutdown(grace)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(server_type = %self.server_type, error = %e, "Listener shutdown failed"),
            Err(_) => tracing::warn!(server_type = %self.server_type, "Listener drain abandoned"),
        }
        if let Some(conf) = conf {
            self.options.hooks.run_closing(conf).await;
        }
    }

    fn set_state(&self, state: ServerState) {
        self.state.send_replace(state);
        metrics::gauge!("conf_runtime_server_state", "server_type" => self.server_type.as_str())
            .set(state.gauge_value());
        tracing::debug!(server_type = %self.server_type, state = %state, "State changed");
    }

    fn record_transition(&self, kind: &'static str) {
        metrics::counter!(
            "conf_runtime_transitions_total",
            "server_type" => self.server_type.as_str(),
            "kind" => kind
        )
        .increment(1);
    }
}

impl fmt::Debug for ResponsiveController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponsiveController")
            .field("server_type", &self.server_type)
            .field("state", &self.state())
            .field("instance", &self.instance_info())
            .finish()
    }
}

/// Feed watcher snapshots to `controller` until the stream ends or
/// `shutdown` fires.
///
/// A stopped instance (never started, or stopped by a failed restart) is
/// started from the next snapshot; a running one is notified. Snapshots
/// queued behind a slow transition are skipped in favour of the newest.
///
/// The watcher tree only emits snapshots that differ from the last one it
/// sent, except after a registry resync. Rewriting identical bytes therefore
/// does not retry a fail-stopped instance; a changed configuration or a
/// reconnect does.
pub async fn drive(
    controller: Arc<ResponsiveController>,
    mut snapshots: mpsc::Receiver<ConfSnapshot>,
    mut shutdown: ShutdownSignal,
) {
    let server_type = controller.server_type();
    loop {
        let mut snapshot = tokio::select! {
            next = snapshots.recv() => match next {
                Some(snapshot) => snapshot,
                None => break,
            },
            _ = shutdown.wait() => break,
        };
        while let Ok(newer) = snapshots.try_recv() {
            snapshot = newer;
        }

        if controller.state() == ServerState::Stopped {
            if let Err(e) = controller.start(snapshot).await {
                tracing::warn!(server_type = %server_type, error = %e, "Start attempt failed, waiting for next configuration");
            }
            continue;
        }
        match controller.notify(snapshot).await {
            Ok(outcome) => tracing::debug!(server_type = %server_type, outcome = ?outcome, "Configuration applied"),
            Err(ControllerError::Conf(_)) => {}
            Err(e) => tracing::error!(server_type = %server_type, error = %e, "Configuration change failed"),
        }
    }
    tracing::debug!(server_type = %server_type, "Controller driver exited");
}
