//! HTTP server for blob-relay

pub mod http;

pub use http::{handle_request, run, AppState};
