//! conf-runtime (v1)
//!
//! # Architecture Overview
//!
//! ```text
//!   ┌──────────────┐  notifications  ┌──────────────┐  snapshots  ┌──────────────┐
//!   │   registry   │────────────────▶│ watcher tree │────────────▶│  controller  │
//!   │ zk/file/mem  │                 │  + debounce  │             │  + comparer  │
//!   └──────▲───────┘                 └──────────────┘             └──────┬───────┘
//!          │ ephemeral discovery node                                    │ build/start/shutdown
//!   ┌──────┴───────┐                                              ┌──────▼───────┐
//!   │  publisher   │◀─────────────── service address ─────────────│   listener   │
//!   └──────────────┘                                              └──────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;

use conf_runtime::conf::ServerType;
use conf_runtime::lifecycle::HookRegistry;
use conf_runtime::config::{load_config, validate_config, ConfigError, RuntimeConfig};
use conf_runtime::observability;
use conf_runtime::server::{Context, Handler, HandlerRegistry, HttpListenerFactory, Reply};
use conf_runtime::{Runtime, RuntimeError};

#[derive(Parser, Debug)]
#[command(name = "conf-runtime")]
#[command(about = "Configuration-driven service runtime", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Registry address (`zk://…`, `file://…`, `memory://`).
    #[arg(short, long)]
    registry: Option<String>,

    #[arg(long)]
    platform: Option<String>,

    #[arg(long)]
    system: Option<String>,

    #[arg(long)]
    cluster: Option<String>,

    /// Server types to run; repeatable.
    #[arg(short = 't', long = "server-type")]
    server_types: Vec<ServerType>,

    /// Discovery node name.
    #[arg(long)]
    instance_name: Option<String>,

    /// Value advertised as `cluster_id` in discovery metadata.
    #[arg(long)]
    cluster_id: Option<String>,

    /// Debounce window for config notifications, in milliseconds.
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Listener drain bound on shutdown, in seconds.
    #[arg(long)]
    drain_timeout: Option<u64>,

    /// JSON seed file for the registry.
    #[arg(long)]
    seed: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    metrics_address: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut RuntimeConfig) {
        if let Some(registry) = self.registry {
            config.registry.address = registry;
        }
        if let Some(platform) = self.platform {
            config.cluster.platform = platform;
        }
        if let Some(system) = self.system {
            config.cluster.system = system;
        }
        if let Some(cluster) = self.cluster {
            config.cluster.name = cluster;
        }
        if !self.server_types.is_empty() {
            config.servers.types = self.server_types;
        }
        if self.instance_name.is_some() {
            config.cluster.instance_name = self.instance_name;
        }
        if self.cluster_id.is_some() {
            config.cluster.cluster_id = self.cluster_id;
        }
        if let Some(ms) = self.debounce_ms {
            config.watch.debounce_ms = ms;
        }
        if let Some(secs) = self.drain_timeout {
            config.lifecycle.drain_timeout_secs = secs;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
        if let Some(addr) = self.metrics_address {
            config.observability.metrics_enabled = true;
            config.observability.metrics_address = addr;
        }
    }
}

/// Liveness probe available to every router config as service `ping`.
struct Ping;

#[async_trait]
impl Handler for Ping {
    async fn handle(&self, _ctx: Context) -> Reply {
        Reply::ok(serde_json::json!({ "status": "ok" }))
    }
}

fn load(cli: Cli) -> Result<RuntimeConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RuntimeConfig::default(),
    };
    cli.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load(Cli::parse())?;
    observability::logging::init(&config.observability.log_level);

    tracing::info!("conf-runtime v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        registry = %config.registry.address,
        platform = %config.cluster.platform,
        system = %config.cluster.system,
        cluster = %config.cluster.name,
        server_types = ?config.servers.types,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|e| RuntimeError::Metrics(format!("{}", e)))?;
        observability::metrics::init_metrics(addr).map_err(|e| RuntimeError::Metrics(e.to_string()))?;
    }

    let handlers = Arc::new(HandlerRegistry::new());
    handlers.register("ping", Arc::new(Ping));
    let factory = Arc::new(HttpListenerFactory::new(handlers));

    let runtime = Runtime::start(&config, factory, Arc::new(HookRegistry::new())).await?;
    tracing::info!(instance = %runtime.instance_name(), "Runtime started");
    runtime.run_until_signal().await?;
    Ok(())
}
