//! Health and version endpoints
//!
//! `/health` reports liveness of this replica plus its local connection
//! counts. It does not check MongoDB or NATS.

use bytes::Bytes;
use http_body_util::Full;
use hyper::Response;
use serde::Serialize;

use crate::server::http::json_response;
use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    pub timestamp: String,
    /// "development" or "production"
    pub mode: &'static str,
    pub node_id: String,
    pub store: &'static str,
    pub bus: &'static str,
    pub connections: ConnectionCounts,
}

/// Entries in this replica's registry
#[derive(Serialize)]
pub struct ConnectionCounts {
    pub hosts: usize,
    pub clients: usize,
}

#[derive(Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
    pub commit: &'static str,
    pub commit_full: &'static str,
    pub build_time: &'static str,
    pub service: &'static str,
}

/// Liveness probe
pub fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    let response = HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: if state.args.dev_mode {
            "development"
        } else {
            "production"
        },
        node_id: state.args.node_id.to_string(),
        store: state.store_backend,
        bus: state.bus_backend,
        connections: ConnectionCounts {
            hosts: state.registry.hosts.len(),
            clients: state.registry.clients.len(),
        },
    };
    json_response(&response)
}

/// Build version info for deployment verification
pub fn version_info() -> Response<Full<Bytes>> {
    json_response(&VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        commit_full: option_env!("GIT_COMMIT_FULL").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        service: "portico",
    })
}
