//! Admin server, reachable by peer nodes
//!
//! Serves forwarded requests from peers, this node's endpoint table for
//! membership polling, and a health check.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relaymesh_control::Proxy;
use relaymesh_proto::{encode_forward_result, ForwardResult, HttpRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::error::{error_response, panic_response, ErrorResponse};

pub const FORWARD_PATH: &str = "/relaymesh/v1/forward/{endpoint_id}";
pub const ENDPOINTS_PATH: &str = "/relaymesh/v1/endpoints";

/// Room for the request line and headers around a maximal body
const FORWARD_OVERHEAD_BYTES: usize = 64 * 1024;

/// Endpoints held by a node, as served to peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointsResponse {
    pub node_id: String,
    /// Endpoint ID -> local connection count
    pub endpoints: HashMap<String, usize>,
}

#[derive(Clone)]
struct AdminState {
    node_id: String,
    proxy: Arc<Proxy>,
}

pub fn router(node_id: String, proxy: Arc<Proxy>, max_body_bytes: usize) -> Router {
    Router::new()
        .route(FORWARD_PATH, post(forward_route))
        .route(ENDPOINTS_PATH, get(endpoints_route))
        .route("/health", get(health_route))
        .layer(DefaultBodyLimit::max(max_body_bytes + FORWARD_OVERHEAD_BYTES))
        .with_state(AdminState { node_id, proxy })
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

/// Serve a request a peer forwarded here; never forwards it again
async fn forward_route(
    State(state): State<AdminState>,
    Path(endpoint_id): Path<String>,
    body: Bytes,
) -> Response {
    let request = match HttpRequest::decode(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Undecodable forwarded request for {}: {}", endpoint_id, e);
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("invalid forwarded request"),
            );
        }
    };

    debug!("Serving forwarded request for {}", endpoint_id);
    let result: ForwardResult = state
        .proxy
        .forward_local(&endpoint_id, request)
        .await
        .map_err(|e| e.to_failure());

    match encode_forward_result(&result) {
        Ok(encoded) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            encoded,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode forward result for {}: {}", endpoint_id, e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("internal server error"),
            )
        }
    }
}

async fn endpoints_route(State(state): State<AdminState>) -> Json<EndpointsResponse> {
    Json(EndpointsResponse {
        node_id: state.node_id.clone(),
        endpoints: state.proxy.registry().endpoints(),
    })
}

async fn health_route() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
