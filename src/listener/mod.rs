//! The dedicated HTTP/WebSocket listener each session gets on its own port.
//!
//! Routes:
//! - `GET /ws/raw`: viewer channel, raw terminal bytes both ways
//! - `POST /resize`: `{"rows", "cols"}` resizes the pty
//! - everything else: the embedded terminal front-end

mod web;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::hub::{HubError, SessionHub, Viewer};
use crate::pty::Pty;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone)]
struct ListenerState {
    hub: SessionHub,
    pty: Arc<parking_lot::Mutex<Pty>>,
}

/// A running session listener. Dropping it without [`stop`] leaves the
/// server task running.
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Bind `host:port` and start serving the session's viewer endpoint.
pub async fn start(
    host: IpAddr,
    port: u16,
    hub: SessionHub,
    pty: Arc<parking_lot::Mutex<Pty>>,
) -> Result<ListenerHandle, ListenerError> {
    let addr = SocketAddr::new(host, port);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ListenerError::Bind { addr, source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ListenerError::Bind { addr, source })?;

    let app = router(ListenerState { hub, pty });
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::warn!(addr = %local_addr, error = %e, "session listener failed");
        }
    });

    tracing::info!(addr = %local_addr, "session listener started");
    Ok(ListenerHandle { local_addr, task })
}

/// Shut the listener down without draining in-flight connections.
///
/// Returns once the listening socket is closed. Viewer connections end when
/// the session's hub is closed.
pub async fn stop(handle: ListenerHandle) {
    handle.task.abort();
    let _ = handle.task.await;
    tracing::info!(addr = %handle.local_addr, "session listener stopped");
}

fn router(state: ListenerState) -> Router {
    Router::new()
        .route("/ws/raw", get(ws_raw))
        .route("/resize", post(resize))
        .fallback(web::web_asset)
        .with_state(state)
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
}

async fn ws_raw(ws: WebSocketUpgrade, State(state): State<ListenerState>) -> Response {
    let viewer = match state.hub.join() {
        Ok(viewer) => viewer,
        Err(e @ HubError::Full(_)) => {
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
        Err(e @ HubError::Closed) => return (StatusCode::GONE, e.to_string()).into_response(),
    };
    ws.on_upgrade(move |socket| serve_viewer(socket, state.hub, viewer))
}

async fn serve_viewer(socket: WebSocket, hub: SessionHub, mut viewer: Viewer) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let id = viewer.id;

    loop {
        tokio::select! {
            // pty output -> viewer
            result = viewer.output.recv() => {
                match result {
                    Ok(data) => {
                        if ws_tx.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(viewer = %id, skipped, "viewer lagging, output dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            // viewer input -> pty
            msg = ws_rx.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // ping/pong handled by axum
                    Some(Err(_)) => break,
                };
                if hub.on_viewer_message(data).await.is_err() {
                    break;
                }
            }

            _ = hub.closed() => {
                let close_frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: "session ended".into(),
                };
                let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
                let _ = ws_tx.flush().await;
                break;
            }
        }
    }
    // `viewer` drops here and leaves the hub.
}

#[derive(Debug, Deserialize)]
struct ResizeRequest {
    rows: u16,
    cols: u16,
}

async fn resize(
    State(state): State<ListenerState>,
    Json(req): Json<ResizeRequest>,
) -> Response {
    if req.rows == 0 || req.cols == 0 {
        return (StatusCode::BAD_REQUEST, "rows and cols must be non-zero").into_response();
    }
    match state.pty.lock().resize(req.rows, req.cols) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::AttachCommand;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> ListenerState {
        let (hub, _rx) = SessionHub::new(4);
        let pty = Pty::spawn_for_unit("t", &AttachCommand::new("sleep", &["10"]), 24, 80)
            .expect("spawn pty");
        ListenerState {
            hub,
            pty: Arc::new(parking_lot::Mutex::new(pty)),
        }
    }

    #[tokio::test]
    async fn index_is_served_at_root() {
        let state = test_state();
        let pty = state.pty.clone();
        let response = router(state)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "text/html"
        );
        pty.lock().kill().unwrap();
    }

    #[tokio::test]
    async fn unknown_asset_is_404() {
        let state = test_state();
        let pty = state.pty.clone();
        let response = router(state)
            .oneshot(Request::builder().uri("/nope.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        pty.lock().kill().unwrap();
    }

    #[tokio::test]
    async fn resize_accepts_valid_dimensions() {
        let state = test_state();
        let pty = state.pty.clone();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/resize")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"rows":40,"cols":100}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        pty.lock().kill().unwrap();
    }

    #[tokio::test]
    async fn resize_rejects_zero() {
        let state = test_state();
        let pty = state.pty.clone();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/resize")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"rows":0,"cols":100}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        pty.lock().kill().unwrap();
    }

    #[tokio::test]
    async fn start_then_stop_frees_the_port() {
        let state = test_state();
        let handle = start("127.0.0.1".parse().unwrap(), 0, state.hub.clone(), state.pty.clone())
            .await
            .unwrap();
        let addr = handle.local_addr();
        assert_ne!(addr.port(), 0);
        stop(handle).await;

        // The exact port can be bound again once stop() returns.
        let rebound = std::net::TcpListener::bind(addr);
        assert!(rebound.is_ok(), "port should be free: {:?}", rebound.err());
        state.pty.lock().kill().unwrap();
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let state = test_state();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let err = start("127.0.0.1".parse().unwrap(), port, state.hub.clone(), state.pty.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ListenerError::Bind { .. }));
        state.pty.lock().kill().unwrap();
    }
}
