//! Upstream-facing server
//!
//! Upstream services open a WebSocket to `/relaymesh/v1/listener/{endpoint_id}`
//! and keep it open for as long as they serve that endpoint. The connection
//! is registered while the socket lives and heartbeats keep it honest.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use relaymesh_auth::Verifier;
use relaymesh_control::{
    child_with_deadline, deadline_from, Conn, ConnectionManager, Registration, RpcConn,
};
use relaymesh_proto::{RejectingHandler, Stream, MAX_FRAME_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{require_token, ListenerContext};
use crate::error::{error_response, panic_response, ErrorResponse};
use crate::transport::WebSocketTransport;

pub const LISTENER_PATH: &str = "/relaymesh/v1/listener/{endpoint_id}";

#[derive(Clone)]
struct UpstreamState {
    manager: Arc<dyn ConnectionManager>,
    shutdown: CancellationToken,
    listeners: TaskTracker,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

/// Builds the upstream listener router.
///
/// With a verifier, registration requires a bearer token permitting the
/// endpoint. Cancelling `shutdown` disconnects every listener; each
/// upgraded connection runs on `listeners` so its teardown can be awaited.
pub fn router(
    manager: Arc<dyn ConnectionManager>,
    verifier: Option<Arc<dyn Verifier>>,
    shutdown: CancellationToken,
    listeners: TaskTracker,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
) -> Router {
    let state = UpstreamState {
        manager,
        shutdown,
        listeners,
        heartbeat_interval,
        heartbeat_timeout,
    };

    let listener = Router::new().route(LISTENER_PATH, get(listener_route));
    let listener = match verifier {
        Some(verifier) => {
            listener.route_layer(middleware::from_fn_with_state(verifier, require_token))
        }
        None => listener,
    };

    listener
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

async fn listener_route(
    State(state): State<UpstreamState>,
    Path(endpoint_id): Path<String>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ctx: ListenerContext,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Some(token) = &ctx.token {
        if !token.permits(&endpoint_id) {
            warn!(
                "Upstream {} not permitted to register endpoint {}",
                remote_addr, endpoint_id
            );
            return error_response(
                StatusCode::UNAUTHORIZED,
                ErrorResponse::new("endpoint not permitted").with_code("ENDPOINT_NOT_PERMITTED"),
            );
        }
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!("Listener request from {} is not a WebSocket upgrade", remote_addr);
            return rejection.into_response();
        }
    };

    let expiry = ctx.token.and_then(|token| token.expiry);

    ws.max_message_size(MAX_FRAME_SIZE)
        .max_frame_size(MAX_FRAME_SIZE)
        .on_failed_upgrade(move |e| {
            warn!("Failed to upgrade listener from {}: {}", remote_addr, e);
        })
        .on_upgrade(move |socket| {
            let listeners = state.listeners.clone();
            listeners.track_future(serve_listener(state, endpoint_id, remote_addr, expiry, socket))
        })
}

async fn serve_listener(
    state: UpstreamState,
    endpoint_id: String,
    remote_addr: SocketAddr,
    expiry: Option<DateTime<Utc>>,
    socket: WebSocket,
) {
    let stream = Stream::new(WebSocketTransport::new(socket), Arc::new(RejectingHandler));
    let conn: Arc<dyn Conn> =
        Arc::new(RpcConn::new(endpoint_id.clone(), stream.clone()).with_remote_addr(remote_addr));
    let conn_id = conn.id();

    info!(
        "Upstream {} connected for endpoint {} as {}",
        remote_addr, endpoint_id, conn_id
    );

    // Unregisters and closes the stream however this task ends
    let _registration = Registration::new(state.manager.clone(), conn);

    let lifetime = match expiry {
        Some(expiry) => child_with_deadline(&state.shutdown, deadline_from(expiry)),
        None => state.shutdown.child_token(),
    };

    let result = stream
        .monitor(
            lifetime.clone(),
            state.heartbeat_interval,
            state.heartbeat_timeout,
        )
        .await;
    lifetime.cancel();

    match result {
        Ok(()) if state.shutdown.is_cancelled() => {
            info!("Disconnecting {} for shutdown", conn_id)
        }
        Ok(()) => info!("Token for {} expired, disconnecting", conn_id),
        Err(e) => info!("Upstream {} disconnected: {}", conn_id, e),
    }
}
