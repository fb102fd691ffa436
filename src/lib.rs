//! blob-relay - streaming cache for content-addressed blobs
//!
//! Sits between HTTP clients and a slow content-addressed origin and serves
//! each object efficiently and repeatedly, with byte-range support for media
//! seeking.
//!
//! ## Components
//!
//! - **Cache**: disk-backed store with LRU and TTL eviction; artifact files
//!   are deleted only once no reader holds them
//! - **Coordinator**: one origin fetch per key, however many clients ask
//! - **Delivery**: streams bytes to clients while the fetch is still writing
//! - **Retrieval**: picks cache, direct, progressive or buffered delivery
//! - **Routes**: `/resource/{key}`, `/health`, `/version`

pub mod cache;
pub mod config;
pub mod delivery;
pub mod retrieval;
pub mod routes;
pub mod server;
pub mod services;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{RelayError, Result};
