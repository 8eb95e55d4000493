//! Main config parsing.
//!
//! The main node is free-form JSON. Only the fields needed to bind a
//! listener are extracted; everything else is administrative and ignored
//! when deciding whether a restart is needed.

use serde::{Deserialize, Serialize};

use crate::conf::{ConfError, ServerType};

const DEFAULT_ADDRESS: &str = ":8080";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Certificate and key file paths for the listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlsConf {
    pub cert_path: String,
    pub key_path: String,
}

/// Binding-relevant fields of the main config, with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingConf {
    /// Bind address; `":8080"` binds every interface.
    pub address: String,
    pub tls: Option<TlsConf>,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub read_header_timeout_secs: u64,
}

impl Default for BindingConf {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            tls: None,
            read_timeout_secs: DEFAULT_TIMEOUT_SECS,
            write_timeout_secs: DEFAULT_TIMEOUT_SECS,
            read_header_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl BindingConf {
    /// Address in `host:port` form, filling in `0.0.0.0` for a bare `:port`.
    pub fn bind_address(&self) -> String {
        if self.address.starts_with(':') {
            format!("0.0.0.0{}", self.address)
        } else {
            self.address.clone()
        }
    }
}

/// Wire shape of the main node. Unknown fields are administrative.
#[derive(Debug, Deserialize)]
struct RawMainConf {
    #[serde(default, alias = "addr")]
    address: Option<String>,
    #[serde(default)]
    tls: Option<Vec<String>>,
    #[serde(default, rename = "rTimeout")]
    read_timeout: Option<u64>,
    #[serde(default, rename = "wTimeout")]
    write_timeout: Option<u64>,
    #[serde(default, rename = "rhTimeout")]
    read_header_timeout: Option<u64>,
}

/// A parsed main config node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainConfSnapshot {
    pub raw: Vec<u8>,
    pub server_type: ServerType,
    pub binding: BindingConf,
}

impl MainConfSnapshot {
    /// Parse main config bytes read from `path`.
    pub fn parse(path: &str, server_type: ServerType, raw: &[u8]) -> Result<Self, ConfError> {
        let parsed: RawMainConf = serde_json::from_slice(raw).map_err(|source| ConfError::Parse {
            path: path.to_string(),
            source,
        })?;
        let invalid = |reason: String| ConfError::Invalid { path: path.to_string(), reason };

        let address = parsed.address.unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
        if address.trim().is_empty() {
            return Err(invalid("address must not be empty".into()));
        }
        if !address.contains(':') {
            return Err(invalid(format!("address '{}' has no port", address)));
        }

        let tls = match parsed.tls.as_deref() {
            None | Some([]) => None,
            Some([cert, key]) => Some(TlsConf { cert_path: cert.clone(), key_path: key.clone() }),
            Some(other) => {
                return Err(invalid(format!("tls expects [cert, key], got {} entries", other.len())));
            }
        };

        let binding = BindingConf {
            address,
            tls,
            read_timeout_secs: parsed.read_timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
            write_timeout_secs: parsed.write_timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
            read_header_timeout_secs: parsed.read_header_timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
        };

        Ok(Self { raw: raw.to_vec(), server_type, binding })
    }
}
