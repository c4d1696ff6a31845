//! Edge middleware: client IP block check, bearer token lookup,
//! and tenant balance check, run once per request before any relay work
//! starts. Per-model checks (allowed model, rate limit) happen in the route
//! handler since they need the parsed body.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use aiproxy_core::model::{Tenant, Token};
use aiproxy_core::ProxyError;

use crate::errors::error_response;
use crate::state::AppState;

/// Request-scoped identity, attached to the request's extensions once the
/// edge middleware has authenticated it.
#[derive(Clone)]
pub struct AuthContext {
    pub tenant: Tenant,
    pub token: Token,
    pub client_ip: String,
}

pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "0.0.0.0".to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

pub async fn edge_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(request.headers());

    if state.ip_block.is_blocked(&ip).await {
        return error_response(&ProxyError::IpBlocked);
    }

    let Some(token_name) = bearer_token(request.headers()) else {
        return error_response(&ProxyError::Auth);
    };

    let token = match state.store.find_token(token_name).await {
        Ok(Some(token)) if token.enabled => token,
        Ok(_) => return error_response(&ProxyError::Auth),
        Err(err) => return error_response(&err),
    };

    let tenant = match state.store.find_tenant(token.tenant_id).await {
        Ok(Some(tenant)) if tenant.enabled => tenant,
        Ok(_) => return error_response(&ProxyError::Auth),
        Err(err) => return error_response(&err),
    };

    if !tenant.has_balance() {
        return error_response(&ProxyError::Quota);
    }

    request.extensions_mut().insert(AuthContext {
        tenant,
        token,
        client_ip: ip,
    });

    next.run(request).await
}
