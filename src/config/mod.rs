//! Runtime configuration subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → CLI overrides (main.rs)
//!     → RuntimeConfig (validated, immutable, handed to lifecycle::startup)
//! ```
//!
//! # Design Decisions
//! - Every field has a default so a missing file still yields a local-mode runtime
//! - Validation reports every problem at once
//! - Server configuration is not here; it is watched live in the registry

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ClusterConfig, LifecycleConfig, ObservabilityConfig, RegistryConfig, RuntimeConfig, ServersConfig,
    WatchConfig,
};
pub use validation::{validate_config, ValidationError};
