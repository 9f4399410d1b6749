//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, layers, ConnectInfo)
//!     → request.rs (add request ID)
//!     → middleware.rs (rate limit → quota throttle → delay)
//!     → protected handler
//!     → response.rs (admission headers, 429 body)
//!     → Send to client
//! ```

pub mod middleware;
pub mod request;
pub mod response;
pub mod server;

pub use middleware::{admission_middleware, Admission, AdmissionControl};
pub use request::{RequestIdExt, X_REQUEST_ID};
pub use response::RejectionResponse;
pub use server::{build_router, AppState, HttpServer};
