//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger → listeners stop accepting → syncer flushes usage
//!             → coordinator drains in-flight executions → exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - One broadcast channel fans the shutdown out to every long-running task
//! - Shutdown has timeout: the coordinator drain gives up after its deadline

pub mod shutdown;
pub mod signals;

pub use shutdown::{join_logged, Shutdown};
pub use signals::wait_for_signal;
