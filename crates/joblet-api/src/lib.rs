//! HTTP/JSON surface of the Joblet daemon.
//!
//! Transport concerns beyond the method contracts (authN/Z, TLS) are out of
//! scope; this crate maps requests onto the supervisor, workflow engine,
//! runtime manager, and volume manager, and maps the core error taxonomy
//! onto status codes.

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use state::AppState;
