//! bucketproxy library: an HTTP front end for S3-compatible object storage.
//!
//! The binary in `main.rs` wires these pieces together; integration tests
//! drive the same router against an in-memory store.

use std::sync::Arc;

pub mod config;
pub mod errors;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod server;
pub mod storage;

use crate::config::Config;
use crate::storage::backend::ObjectStore;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Startup configuration.
    pub config: Config,
    /// Object storage backend (S3 or in-memory).
    pub store: Arc<dyn ObjectStore>,
}
