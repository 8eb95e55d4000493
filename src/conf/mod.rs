//! Server configuration as stored in the registry.
//!
//! # Data Flow
//! ```text
//! registry nodes  …/conf/{serverType}/main, …/conf/{serverType}/{sub}
//!     → watcher tree (raw bytes → ConfSnapshot)
//!     → comparer.rs (parse main, validate subs, classify vs baseline)
//!     → ServerConf (parsed, handed to the listener factory)
//! ```
//!
//! # Design Decisions
//! - Only binding fields (address, TLS, timeouts) decide `value_changed`
//! - Sub-configs are compared as raw bytes
//! - A malformed payload never replaces the last good baseline

pub mod comparer;
pub mod main_conf;
pub mod seed;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry;

pub use comparer::{ComparisonResult, Comparer};
pub use main_conf::{BindingConf, MainConfSnapshot, TlsConf};

/// Name of the main config node under a server type's conf directory.
pub const MAIN_CONF_NAME: &str = "main";

/// Sub-config holding the route table.
pub const ROUTER_CONF_NAME: &str = "router";

/// Configuration parse / validation failure. The previous snapshot stays in
/// effect and no restart is attempted.
#[derive(Debug, Error)]
pub enum ConfError {
    #[error("main config missing at {0}")]
    MissingMain(String),

    #[error("malformed config at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config at {path}: {reason}")]
    Invalid { path: String, reason: String },
}

/// Kind of listener a server type runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Api,
    Web,
    Rpc,
}

impl ServerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerType::Api => "api",
            ServerType::Web => "web",
            ServerType::Rpc => "rpc",
        }
    }

    /// URL scheme used when advertising the listener's address.
    pub fn scheme(&self, tls: bool) -> &'static str {
        match (self, tls) {
            (ServerType::Rpc, _) => "tcp",
            (_, true) => "https",
            (_, false) => "http",
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "api" => Ok(ServerType::Api),
            "web" => Ok(ServerType::Web),
            "rpc" => Ok(ServerType::Rpc),
            other => Err(format!("unknown server type '{}'", other)),
        }
    }
}

/// Registry path scheme for one server type of one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfPaths {
    pub platform: String,
    pub system: String,
    pub cluster: String,
    pub server_type: ServerType,
}

impl ConfPaths {
    pub fn new(
        platform: impl Into<String>,
        system: impl Into<String>,
        cluster: impl Into<String>,
        server_type: ServerType,
    ) -> Self {
        Self {
            platform: platform.into(),
            system: system.into(),
            cluster: cluster.into(),
            server_type,
        }
    }

    /// `/{platform}/{system}/{cluster}/conf/{serverType}`
    pub fn conf_dir(&self) -> String {
        registry::join([
            self.platform.as_str(),
            self.system.as_str(),
            self.cluster.as_str(),
            "conf",
            self.server_type.as_str(),
        ])
    }

    pub fn main(&self) -> String {
        self.sub(MAIN_CONF_NAME)
    }

    pub fn sub(&self, name: &str) -> String {
        registry::join([self.conf_dir().as_str(), name])
    }

    /// `/{platform}/{system}/{cluster}/{serverType}`
    pub fn discovery_dir(&self) -> String {
        registry::join([
            self.platform.as_str(),
            self.system.as_str(),
            self.cluster.as_str(),
            self.server_type.as_str(),
        ])
    }

    pub fn discovery(&self, instance: &str) -> String {
        registry::join([self.discovery_dir().as_str(), instance])
    }
}

/// Raw state of one server type's configuration, as read from the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfSnapshot {
    pub main: Option<Vec<u8>>,
    pub subs: BTreeMap<String, Vec<u8>>,
}

impl ConfSnapshot {
    pub fn new(main: impl Into<Vec<u8>>) -> Self {
        Self { main: Some(main.into()), subs: BTreeMap::new() }
    }

    pub fn with_sub(mut self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.subs.insert(name.to_string(), data.into());
        self
    }
}

/// Parsed configuration a listener is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConf {
    pub server_type: ServerType,
    pub main: MainConfSnapshot,
    pub subs: BTreeMap<String, Vec<u8>>,
}

impl ServerConf {
    pub fn binding(&self) -> &BindingConf {
        &self.main.binding
    }

    pub fn sub(&self, name: &str) -> Option<&[u8]> {
        self.subs.get(name).map(Vec::as_slice)
    }
}
