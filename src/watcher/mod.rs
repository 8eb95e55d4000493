//! Config watching.
//!
//! # Data Flow
//! ```text
//! registry subscriptions (main, conf dir, one per sub-config)
//!     → per-path workers (re-read node, update shared snapshot)
//!     → debounce.rs (coalesce bursts, force after reconnect)
//!     → mpsc::Receiver<ConfSnapshot> (consumed by the controller driver)
//! ```

pub mod debounce;
pub mod tree;

pub use debounce::{Debouncer, Trigger};
pub use tree::WatcherTree;
