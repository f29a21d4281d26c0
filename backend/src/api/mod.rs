//! HTTP API module.
//!
//! This module provides the HTTP server and API types for the xml2csv backend.

pub mod logs;
pub mod server;
pub mod types;

pub use logs::*;
pub use server::{router, serve, start_server, AppState};
pub use types::*;
