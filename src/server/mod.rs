//! HTTP surface: JSON endpoints and SSE streams

pub mod api;
pub mod middleware;
pub mod sse;

pub use api::{router, run_server, AppState};
