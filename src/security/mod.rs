//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → client_ip.rs (resolve client IP, trusted proxies only)
//!     → rate_limit.rs (per-IP, then per-credential fixed windows)
//!     → Pass to quota throttle
//! ```
//!
//! # Design Decisions
//! - No trust in forwarding headers unless configured
//! - Fail open: the limiter's own backend never takes traffic down
//! - Credentials appear in logs by prefix only

pub mod client_ip;
pub mod rate_limit;

pub use client_ip::{ClientIpResolver, TrustedProxy};
pub use rate_limit::{Granularity, LimitScope, RateLimitDecision, RateLimiter};
