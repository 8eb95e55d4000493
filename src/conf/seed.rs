//! Registry seeding for local mode.
//!
//! A seed file maps server types to named configs:
//!
//! ```json
//! { "api": { "main": { "address": ":8080" }, "router": { "routers": [] } } }
//! ```
//!
//! Each config is written to its conf path only if the node does not exist
//! yet, so restarting against a persistent registry never clobbers edits.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

use crate::conf::{ConfPaths, ServerType};
use crate::registry::{Registry, RegistryError};

pub type SeedFile = BTreeMap<ServerType, BTreeMap<String, serde_json::Value>>;

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("failed to read seed file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed seed file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub fn load_seed(path: &Path) -> Result<SeedFile, SeedError> {
    let display = path.display().to_string();
    let raw = std::fs::read(path).map_err(|source| SeedError::Io { path: display.clone(), source })?;
    serde_json::from_slice(&raw).map_err(|source| SeedError::Parse { path: display, source })
}

/// Write missing seed nodes. Returns how many were created.
pub async fn apply_seed<F>(registry: &dyn Registry, seed: &SeedFile, paths_for: F) -> Result<usize, SeedError>
where
    F: Fn(ServerType) -> ConfPaths,
{
    let mut created = 0;
    for (server_type, confs) in seed {
        let paths = paths_for(*server_type);
        for (name, value) in confs {
            let path = paths.sub(name);
            let data = serde_json::to_vec(value).map_err(|source| SeedError::Parse { path: path.clone(), source })?;
            match registry.create(&path, &data, false).await {
                Ok(()) => {
                    tracing::info!(path = %path, "Seeded config node");
                    created += 1;
                }
                Err(RegistryError::NodeExists(_)) => {
                    tracing::debug!(path = %path, "Config node exists, seed skipped");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(created)
}
