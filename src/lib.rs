//! Configuration-driven service runtime control plane.
//!
//! Keeps a live registry session, watches each server type's configuration,
//! decides which changes matter, and moves the listener between
//! configurations while keeping its discovery entry accurate.

// Core subsystems
pub mod conf;
pub mod registry;
pub mod watcher;

// Transitions and discovery
pub mod lifecycle;
pub mod publish;
pub mod server;

// Cross-cutting concerns
pub mod config;
pub mod error;
pub mod observability;
pub mod resilience;

pub use config::schema::RuntimeConfig;
pub use error::RuntimeError;
pub use lifecycle::{ResponsiveController, Runtime, ServerState};
pub use registry::Registry;
