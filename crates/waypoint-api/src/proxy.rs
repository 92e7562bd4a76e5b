//! Inbound traffic handler

use crate::error::{error_response, ApiError};
use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;
use uuid::Uuid;
use waypoint_router::{ProxyRequest, RequestRouter};

pub const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const CACHE_STATUS: HeaderName = HeaderName::from_static("x-cache");

/// Largest inbound body the proxy buffers
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Create the proxy router: every path goes through the request router.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so the
/// peer address can key session affinity.
pub fn create_proxy_router(router: Arc<RequestRouter>) -> Router {
    Router::new()
        .fallback(proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(router)
}

async fn proxy(State(router): State<Arc<RequestRouter>>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();
    let client_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let request_id = parts
        .headers
        .get(&REQUEST_ID)
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());
    if let Some(id) = &request_id {
        parts.headers.insert(REQUEST_ID, id.clone());
    }

    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "Rejecting inbound body");
            return with_request_id(
                error_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "payload_too_large",
                    "request body too large",
                ),
                request_id,
            );
        }
    };

    let proxied = ProxyRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
        client_addr,
    };

    let response = match router.route(proxied).await {
        Ok(routed) => {
            let status = StatusCode::from_u16(routed.response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = Response::new(Body::from(routed.response.body));
            *response.status_mut() = status;
            *response.headers_mut() = routed.response.headers;
            if let Some(cache) = routed.cache {
                response
                    .headers_mut()
                    .insert(CACHE_STATUS, HeaderValue::from_static(cache.as_str()));
            }
            response
        }
        Err(e) => ApiError(e).into_response(),
    };

    with_request_id(response, request_id)
}

fn with_request_id(mut response: Response, request_id: Option<HeaderValue>) -> Response {
    if let Some(id) = request_id {
        response.headers_mut().insert(REQUEST_ID, id);
    }
    response
}
