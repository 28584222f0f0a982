//! `GET /api/hosts/ping`
//!
//! Tenant-scoped "is any host reachable" check for request/response
//! endpoints that have no live socket. Takes `page_id` (optionally scoped by
//! `api_key_id`) or `api_key_id` alone, and answers with the host instance
//! that host selection would pick.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{HeaderMap, Response, Uri};
use serde::Serialize;

use crate::auth::RequestQuery;
use crate::server::http::{error_response, json_response};
use crate::server::AppState;
use crate::types::{PorticoError, Result};

#[derive(Debug, Serialize)]
pub struct HostPingResponse {
    pub api_key_id: String,
    pub host_instance_id: String,
}

pub async fn host_ping(state: &AppState, headers: &HeaderMap, uri: &Uri) -> Response<Full<Bytes>> {
    match ping(state, headers, uri).await {
        Ok(response) => json_response(&response),
        Err(e) => error_response(e),
    }
}

async fn ping(state: &AppState, headers: &HeaderMap, uri: &Uri) -> Result<HostPingResponse> {
    let principal = state.auth.authenticate(headers, uri)?;
    let query = RequestQuery::parse(uri)?;

    let api_key_id = if let Some(page_id) = &query.page_id {
        state
            .handler
            .resolve_page(&principal, page_id, query.api_key_id.as_deref())
            .await?
            .api_key_id
    } else if let Some(api_key_id) = &query.api_key_id {
        let api_key = state
            .store
            .api_key(api_key_id)
            .await?
            .ok_or_else(|| PorticoError::NotFound("API key".into()))?;
        principal.ensure_organization(&api_key.organization_id, "API key")?;
        api_key.api_key_id
    } else {
        return Err(PorticoError::InvalidArgument(
            "page_id or api_key_id is required".into(),
        ));
    };

    let host_instance_id = state.handler.select_host(&api_key_id).await?;
    Ok(HostPingResponse {
        api_key_id,
        host_instance_id,
    })
}
