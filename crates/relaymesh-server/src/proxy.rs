//! Client-facing proxy server

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Router;
use relaymesh_control::Proxy;
use relaymesh_proto::{HttpRequest, HttpResponse};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::error::{error_response, panic_response, ErrorResponse};

/// Header naming the endpoint a request is for
pub const ENDPOINT_HEADER: &str = "x-relaymesh-endpoint";

#[derive(Clone)]
struct ProxyState {
    proxy: Arc<Proxy>,
    max_body_bytes: usize,
}

/// Builds the router serving external clients. Every path is proxied.
pub fn router(proxy: Arc<Proxy>, max_body_bytes: usize) -> Router {
    Router::new()
        .fallback(proxy_route)
        .with_state(ProxyState {
            proxy,
            max_body_bytes,
        })
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

/// Endpoint ID from the endpoint header, else the first label of a
/// multi-label Host
pub fn endpoint_id(headers: &HeaderMap) -> Option<String> {
    if let Some(id) = headers
        .get(ENDPOINT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        return Some(id.to_string());
    }

    let host = headers.get(http::header::HOST)?.to_str().ok()?;
    let host = host.split(':').next().unwrap_or(host);
    let (first, rest) = host.split_once('.')?;
    if first.is_empty() || rest.is_empty() {
        return None;
    }
    Some(first.to_string())
}

async fn proxy_route(State(state): State<ProxyState>, request: Request) -> Response {
    let Some(endpoint_id) = endpoint_id(request.headers()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorResponse::new("missing endpoint id").with_code("MISSING_ENDPOINT"),
        );
    };

    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            debug!("Failed to read request body for {}: {}", endpoint_id, e);
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                ErrorResponse::new("request body too large").with_code("BODY_TOO_LARGE"),
            );
        }
    };

    let request = HttpRequest::from_parts(&parts, body);
    match state.proxy.request(&endpoint_id, request).await {
        Ok(response) => into_response(&endpoint_id, response),
        Err(e) => {
            warn!("Proxy request for {} failed: {}", endpoint_id, e);
            error_response(e.status(), ErrorResponse::new(e.public_message()))
        }
    }
}

fn into_response(endpoint_id: &str, response: HttpResponse) -> Response {
    match response.into_http() {
        Ok(response) => response.map(Body::from),
        Err(e) => {
            warn!("Upstream for {} sent an invalid response: {}", endpoint_id, e);
            error_response(
                StatusCode::BAD_GATEWAY,
                ErrorResponse::new("invalid upstream response"),
            )
        }
    }
}
