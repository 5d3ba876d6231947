//! HTTP surface of a worker: the upgrade endpoint and the delegate router.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::FromRequestParts;
use axum::extract::Request;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::any;
use axum::routing::get;
use serde_json::json;
use tokio::sync::watch;
use tower::ServiceExt;
use tracing::warn;

use super::WorkerShared;
use super::session::Session;
use crate::handshake;
use crate::handshake::HandshakeError;
use crate::ids::WorkerId;

/// Remote address of the TCP connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PeerAddr(pub(crate) SocketAddr);

pub(crate) fn build_router(shared: Arc<WorkerShared>) -> Router {
    let path = shared.settings.path.clone();
    Router::new()
        .route(&path, any(upgrade_entry))
        .fallback(delegate_entry)
        .with_state(shared)
}

/// Answers `GET /healthz` with the worker's identity and load; 404 otherwise.
pub fn default_http_router(worker_id: WorkerId, open: watch::Receiver<usize>) -> Router {
    Router::new()
        .route(
            "/healthz",
            get(move || {
                let open_connections = *open.borrow();
                async move {
                    Json(json!({
                        "status": "ok",
                        "workerId": worker_id,
                        "pid": std::process::id(),
                        "openConnections": open_connections,
                    }))
                }
            }),
        )
        .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
}

async fn upgrade_entry(State(shared): State<Arc<WorkerShared>>, request: Request) -> Response {
    if !handshake::wants_upgrade(request.headers()) {
        return delegate(&shared, request).await;
    }
    if let Err(err) = handshake::validate(request.method(), request.headers()) {
        return reject_handshake(&shared, err);
    }
    if *shared.draining.borrow() {
        return unavailable("worker is shutting down");
    }
    let Ok(permit) = Arc::clone(&shared.limits).try_acquire_owned() else {
        return unavailable("too many websocket connections");
    };

    let peer = request.extensions().get::<PeerAddr>().map(|peer| peer.0);
    let (mut parts, _body) = request.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            return reject_handshake(&shared, HandshakeError::Rejected(rejection.body_text()));
        }
    };

    let id = shared.next_connection_id();
    let session = Session::new(id, peer, Arc::clone(&shared), permit);
    upgrade
        .max_message_size(shared.settings.max_message_bytes)
        .on_failed_upgrade(move |err| {
            warn!(conn_id = %id, error = %err, "WebSocket upgrade failed after handshake");
        })
        .on_upgrade(move |socket| session.run(socket))
}

async fn delegate_entry(State(shared): State<Arc<WorkerShared>>, request: Request) -> Response {
    delegate(&shared, request).await
}

async fn delegate(shared: &WorkerShared, request: Request) -> Response {
    match shared.delegate.clone().oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

fn reject_handshake(shared: &WorkerShared, err: HandshakeError) -> Response {
    warn!(worker_id = %shared.worker_id, error = %err, "Rejected websocket handshake");
    (
        StatusCode::BAD_REQUEST,
        [(header::CONNECTION, "close")],
        err.to_string(),
    )
        .into_response()
}

fn unavailable(reason: &'static str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::CONNECTION, "close")],
        reason,
    )
        .into_response()
}
