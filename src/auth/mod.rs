//! Client principal resolution
//!
//! Client sockets carry an HS256 bearer token, either as `?token=` on the
//! upgrade URL or in the `Authorization` header. In dev mode the
//! `X-User-ID` / `X-Organization-ID` headers are accepted instead.
//! Hosts do not go through here; they authenticate with the API key inside
//! InitializeHost.

use hyper::{HeaderMap, Uri};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{PorticoError, Result};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ORGANIZATION_ID_HEADER: &str = "x-organization-id";

/// Tenant context of an authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub organization_id: String,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id: organization_id.into(),
        }
    }

    /// Reject access to a row owned by another organization
    pub fn ensure_organization(&self, organization_id: &str, what: &str) -> Result<()> {
        if self.organization_id == organization_id {
            Ok(())
        } else {
            Err(PorticoError::PermissionDenied(format!(
                "{} belongs to another organization",
                what
            )))
        }
    }
}

/// Payload stored in JWT token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: String,
    /// Organization ID
    pub org: String,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// Resolves the principal of an upgrade request
#[derive(Clone)]
pub struct Authenticator {
    secret: Option<String>,
    dev_mode: bool,
}

impl Authenticator {
    pub fn new(secret: Option<String>, dev_mode: bool) -> Self {
        Self { secret, dev_mode }
    }

    /// Issue a token; used by tests and local tooling
    pub fn generate_token(&self, principal: &Principal, ttl_secs: u64) -> Result<String> {
        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| PorticoError::Config("JWT_SECRET is not configured".into()))?;
        let now = unix_now()?;
        let claims = Claims {
            sub: principal.user_id.clone(),
            org: principal.organization_id.clone(),
            iat: now,
            exp: now + ttl_secs,
        };
        Ok(encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )?)
    }

    /// Verify and decode a JWT token
    pub fn verify_token(&self, token: &str) -> Result<Principal> {
        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| PorticoError::Unauthorized("Token authentication is not configured".into()))?;
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )?;
        Ok(Principal::new(data.claims.sub, data.claims.org))
    }

    /// Principal for an upgrade request
    pub fn authenticate(&self, headers: &HeaderMap, uri: &Uri) -> Result<Principal> {
        let token = RequestQuery::parse(uri)?
            .token
            .or_else(|| {
                extract_token_from_header(
                    headers
                        .get(hyper::header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok()),
                )
                .map(str::to_string)
            });

        if let Some(token) = token {
            return self.verify_token(&token);
        }

        if self.dev_mode {
            let header = |name: &str| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            };
            if let (Some(user_id), Some(organization_id)) =
                (header(USER_ID_HEADER), header(ORGANIZATION_ID_HEADER))
            {
                return Ok(Principal::new(user_id, organization_id));
            }
        }

        Err(PorticoError::Unauthorized("Missing bearer token".into()))
    }
}

fn unix_now() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| PorticoError::Internal(format!("System time error: {}", e)))
}

/// Extract token from Authorization header.
/// Supports "Bearer <token>" format and raw tokens.
pub fn extract_token_from_header(auth_header: Option<&str>) -> Option<&str> {
    let header = auth_header?;

    if let Some(token) = header.strip_prefix("Bearer ") {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    if !header.contains(' ') {
        let token = header.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    None
}

/// Query parameters read from upgrade and ping URLs
#[derive(Debug, Default, Deserialize)]
pub struct RequestQuery {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub page_id: Option<String>,
    #[serde(default)]
    pub api_key_id: Option<String>,
}

impl RequestQuery {
    /// Percent-decode the query string. Empty values count as absent.
    pub fn parse(uri: &Uri) -> Result<Self> {
        let query: RequestQuery = serde_urlencoded::from_str(uri.query().unwrap_or(""))
            .map_err(|e| PorticoError::InvalidArgument(format!("Invalid query parameters: {}", e)))?;
        let present = |value: Option<String>| value.filter(|v| !v.is_empty());
        Ok(Self {
            token: present(query.token),
            page_id: present(query.page_id),
            api_key_id: present(query.api_key_id),
        })
    }
}
