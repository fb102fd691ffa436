//! Health check endpoints
//!
//! - /health, /healthz - Liveness check with cache and fetch statistics
//! - /version - Build information for deployment verification

use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN};
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::{json_response, BoxBody};
use crate::cache::CacheStats;
use crate::server::AppState;

/// Liveness response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always true while the process is serving
    pub healthy: bool,
    pub version: &'static str,
    /// Configured origin contract
    pub origin_mode: &'static str,
    pub uptime_secs: u64,
    pub cache: CacheStats,
    /// Origin fetches currently running
    pub in_flight: usize,
    /// Origin fetches started since startup
    pub fetches_started: u64,
    pub timestamp: String,
}

/// Liveness check - returns 200 while the service is running
pub async fn health_check(state: &AppState) -> Response<BoxBody> {
    let response = HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        origin_mode: state.origin.mode_name(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        cache: state.cache.stats(),
        in_flight: state.coordinator.in_flight_count().await,
        fetches_started: state.coordinator.fetches_started(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    json_response(StatusCode::OK, &response)
}

/// Version information response
#[derive(Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
    pub commit: &'static str,
    pub commit_full: &'static str,
    pub build_time: &'static str,
    pub service: &'static str,
}

/// Build details baked in by build.rs
pub fn version_info() -> Response<BoxBody> {
    let response = VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        commit_full: option_env!("GIT_COMMIT_FULL").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        service: "blob-relay",
    };

    let mut response = json_response(StatusCode::OK, &response);
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}
