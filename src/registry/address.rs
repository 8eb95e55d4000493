//! Registry address parsing.
//!
//! Supported schemes:
//! - `zk://host:port[,host:port...][/chroot]`
//! - `file://path` (relative or absolute)
//! - `memory://`

use std::fmt;
use std::path::PathBuf;

use crate::registry::RegistryError;

/// A parsed registry address, one variant per backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryAddr {
    Zookeeper {
        servers: Vec<String>,
        chroot: Option<String>,
    },
    FileSystem {
        root: PathBuf,
    },
    Memory,
}

impl RegistryAddr {
    pub fn parse(addr: &str) -> Result<Self, RegistryError> {
        let invalid = || RegistryError::InvalidAddress(addr.to_string());
        let (scheme, rest) = addr.split_once("://").ok_or_else(invalid)?;

        match scheme.to_ascii_lowercase().as_str() {
            "zk" => {
                let (hosts, chroot) = match rest.find('/') {
                    Some(idx) => (&rest[..idx], Some(&rest[idx..])),
                    None => (rest, None),
                };
                let servers: Vec<String> = hosts
                    .split(',')
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .collect();
                if servers.is_empty() {
                    return Err(invalid());
                }
                let chroot = chroot
                    .map(|c| c.trim_end_matches('/').to_string())
                    .filter(|c| !c.is_empty());
                Ok(RegistryAddr::Zookeeper { servers, chroot })
            }
            "file" => {
                if rest.is_empty() {
                    return Err(invalid());
                }
                Ok(RegistryAddr::FileSystem { root: PathBuf::from(rest) })
            }
            "memory" | "lm" => Ok(RegistryAddr::Memory),
            _ => Err(invalid()),
        }
    }

    /// Short protocol name used in logs and metrics labels.
    pub fn proto(&self) -> &'static str {
        match self {
            RegistryAddr::Zookeeper { .. } => "zk",
            RegistryAddr::FileSystem { .. } => "file",
            RegistryAddr::Memory => "memory",
        }
    }
}

impl fmt::Display for RegistryAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryAddr::Zookeeper { servers, chroot } => {
                write!(f, "zk://{}{}", servers.join(","), chroot.as_deref().unwrap_or(""))
            }
            RegistryAddr::FileSystem { root } => write!(f, "file://{}", root.display()),
            RegistryAddr::Memory => write!(f, "memory://"),
        }
    }
}
