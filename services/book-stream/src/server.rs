//! WebSocket transport
//!
//! Each connection runs two tasks: the reader (this handler) feeds inbound
//! frames to the `StreamService` one at a time, and a writer drains the
//! connection's outbox into the socket and sends heartbeat pings. When
//! either side stops, the session is closed and the writer aborted.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::outbox::Outbox;
use crate::service::StreamService;

pub fn create_router(service: Arc<StreamService>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serve the router on `listener` until the process ends.
pub async fn serve(listener: TcpListener, service: Arc<StreamService>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Listening for WebSocket clients");
    }
    axum::serve(listener, create_router(service)).await
}

async fn health_handler(State(service): State<Arc<StreamService>>) -> impl IntoResponse {
    Json(service.health())
}

async fn ws_handler(ws: WebSocketUpgrade, State(service): State<Arc<StreamService>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, service))
}

async fn handle_socket(socket: WebSocket, service: Arc<StreamService>) {
    let (ws_tx, mut ws_rx) = socket.split();
    let mut session = service.open_session();
    let connection_id = session.id();

    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        Arc::clone(session.outbox()),
        service.config().heartbeat_interval,
    ));

    let stale_timeout = service.config().stale_timeout;
    loop {
        tokio::select! {
            biased;

            _ = &mut writer => {
                debug!(connection_id, "Writer finished");
                break;
            }

            received = timeout(stale_timeout, ws_rx.next()) => {
                let message = match received {
                    Ok(Some(Ok(message))) => message,
                    Ok(Some(Err(e))) => {
                        debug!(connection_id, error = %e, "WebSocket receive error");
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        info!(connection_id, "Closing stale connection");
                        break;
                    }
                };

                let handled = match message {
                    Message::Text(text) => service.handle_text(&mut session, text.as_str()),
                    Message::Binary(_) => service.handle_binary(&mut session),
                    Message::Close(_) => break,
                    // Pings are answered by the transport; pongs only refresh the stale timer.
                    Message::Ping(_) | Message::Pong(_) => Ok(()),
                };
                // The error reply is already queued; the connection stays open.
                if let Err(e) = handled {
                    debug!(connection_id, error = %e, "Request answered with error");
                }

                if session.outbox().is_closed() {
                    break;
                }
            }
        }
    }

    service.close_session(session);
    writer.abort();
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    outbox: Arc<Outbox>,
    heartbeat: std::time::Duration,
) {
    let mut ping_interval = interval(heartbeat);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ping_interval.tick().await;

    loop {
        tokio::select! {
            next = outbox.recv() => {
                let Some(message) = next else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode outbound message");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }

            _ = ping_interval.tick() => {
                if ws_tx.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }
}
