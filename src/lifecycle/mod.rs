//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Connect registry → Seed → Watcher tree + controller per server type
//!
//! Transitions (controller.rs):
//!     ConfSnapshot → Comparer → Unchanged | Restart | Commit
//!     Restart: unpublish → shutdown listener → closing hooks
//!              → starting hooks → build → start → publish
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → stop watching → unpublish → drain → close registry
//! ```
//!
//! # Design Decisions
//! - One transition lock per controller, held across registry round-trips
//! - Fail-stop: a failed restart leaves the instance stopped and unpublished
//! - Shutdown drain is bounded; stragglers are abandoned

pub mod controller;
pub mod hooks;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use controller::{
    ControllerError, ControllerOptions, InstanceInfo, LaunchError, NotifyOutcome, ResponsiveController,
    ServerState,
};
pub use hooks::{HookError, HookRegistry, HookVeto, LifecycleHook};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use startup::Runtime;
