//! Top-level error taxonomy.
//!
//! Subsystems keep their own error enums; this wraps the ones that can end
//! the process at startup or shutdown. Failures after startup are handled
//! where they occur and never bubble up here.

use thiserror::Error;

use crate::config::ConfigError;
use crate::conf::seed::SeedError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("seed error: {0}")]
    Seed(#[from] SeedError),

    #[error("metrics exporter: {0}")]
    Metrics(String),
}
