//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Registry session lost / publish rejected:
//!     → backoff.rs (bounded exponential delay with jitter)
//!     → retry until success, shutdown, or registry close
//! ```
//!
//! # Design Decisions
//! - Every retry loop is bounded per attempt and cancellable
//! - Jittered backoff prevents thundering herd on a recovering ensemble

pub mod backoff;

pub use backoff::BackoffPolicy;
