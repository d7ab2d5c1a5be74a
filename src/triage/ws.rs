//! WebSocket subscribers for job progress.
//!
//! `/ws` and `/ws/jobs` receive every job's events, `/ws/jobs/{id}` only
//! that job's. Each connection owns one broadcaster subscription, released
//! when the socket loop exits.

use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use tokio::time::Instant;

use super::api::SharedState;
use super::broadcast::{Scope, Subscription};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn global_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Scope::Global))
}

pub async fn job_ws_handler(
    ws: WebSocketUpgrade,
    Path(job_id): Path<String>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Scope::Job(job_id)))
}

async fn handle_socket(socket: WebSocket, state: SharedState, scope: Scope) {
    let subscription = state.broadcaster.subscribe(scope);
    let id = subscription.id;
    let scope = subscription.scope.clone();
    tracing::debug!(subscriber = id, scope = ?scope, "WebSocket subscriber connected");

    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, subscription).await;

    state.broadcaster.unsubscribe(&scope, id);
    tracing::debug!(subscriber = id, "WebSocket subscriber disconnected");
}

/// Forward broadcaster events and keep the connection alive.
///
/// If no Pong arrives within [`PONG_TIMEOUT`] after a Ping, the connection
/// is considered dead. A closed subscription (the broadcaster dropped us as
/// stalled) also ends the loop.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut subscription: Subscription,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Event forwarding ────────────────────────────────────
            event = subscription.rx.recv() => {
                let Some(json) = event else {
                    break;
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Text(text))) if text.as_str() == "ping" => {
                        if sender.send(Message::Text("pong".into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
