//! Runtime configuration schema.
//!
//! This is the process's own bootstrap configuration (where the registry
//! is, which cluster this instance belongs to, which server types to run).
//! Server configuration itself lives in the registry.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conf::{ConfPaths, ServerType};
use crate::resilience::backoff::BackoffPolicy;

/// Root configuration for the runtime.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Registry connection settings.
    pub registry: RegistryConfig,

    /// Cluster identity and discovery naming.
    pub cluster: ClusterConfig,

    /// Server types to run and their policies.
    pub servers: ServersConfig,

    /// Watcher tree tuning.
    pub watch: WatchConfig,

    /// Transition timing.
    pub lifecycle: LifecycleConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,

    /// JSON seed file written to the registry at startup, for local mode.
    pub seed: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// `zk://host:port[,host:port]/chroot`, `file://path` or `memory://`.
    pub address: String,

    /// Backoff between session re-establishment attempts.
    pub reconnect: BackoffPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: "memory://".to_string(),
            reconnect: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub platform: String,
    pub system: String,
    /// Cluster name, the third path segment.
    pub name: String,

    /// Advertised in discovery metadata; defaults to the cluster name.
    pub cluster_id: Option<String>,

    /// Discovery node name; a random UUID when unset.
    pub instance_name: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            platform: "platform".to_string(),
            system: "system".to_string(),
            name: "default".to_string(),
            cluster_id: None,
            instance_name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServersConfig {
    pub types: Vec<ServerType>,

    /// Per server type: restart when only sub-configs changed (default true).
    pub restart_on_sub_conf: BTreeMap<ServerType, bool>,
}

impl Default for ServersConfig {
    fn default() -> Self {
        Self {
            types: vec![ServerType::Api],
            restart_on_sub_conf: BTreeMap::new(),
        }
    }
}

impl ServersConfig {
    pub fn restart_on_sub_conf(&self, server_type: ServerType) -> bool {
        self.restart_on_sub_conf.get(&server_type).copied().unwrap_or(true)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Debounce window for registry notifications.
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 200 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Bound on listener drain during restart and shutdown.
    pub drain_timeout_secs: u64,

    /// Backoff between discovery publish retries.
    pub publish_retry: BackoffPolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 30,
            publish_retry: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub log_level: String,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9100".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn paths(&self, server_type: ServerType) -> ConfPaths {
        ConfPaths::new(&self.cluster.platform, &self.cluster.system, &self.cluster.name, server_type)
    }

    pub fn cluster_id(&self) -> String {
        self.cluster.cluster_id.clone().unwrap_or_else(|| self.cluster.name.clone())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.watch.debounce_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle.drain_timeout_secs)
    }
}
