//! # routes::monitor
//!
//! **Monitor stream** — per-user WebSocket fan-out for the dashboard.
//!
//! | Method   | Path                         | Description                     |
//! |----------|------------------------------|---------------------------------|
//! | GET (WS) | `/ws/monitor?user_id=<uuid>` | Real-time event stream          |
//!
//! Every broadcast frame carries a scope: user-scoped frames reach only the
//! sockets registered for that user, unscoped frames (engine stats) reach
//! everyone.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::Ordering;
use tracing::{debug, info};
use uuid::Uuid;

use crate::state::SharedState;

// ─── WebSocket handler ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MonitorQuery {
    pub user_id: Uuid,
}

/// Upgrade HTTP → WebSocket, subscribe to the broadcast channel and forward
/// frames scoped to this user (plus unscoped engine frames).
pub async fn ws_monitor(
    ws: WebSocketUpgrade,
    Query(query): Query<MonitorQuery>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.user_id))
}

async fn handle_socket(socket: WebSocket, state: SharedState, user_id: Uuid) {
    let mut rx = state.broadcast_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!(%user_id, "🔌 Monitor client connected");

    // ── Greet with the engine's current vitals ────────────────────────────────
    let snapshot = json!({
        "event":       "SNAPSHOT",
        "enabled":     state.is_enabled(),
        "tick_count":  state.tick_count.load(Ordering::Relaxed),
        "close_count": state.close_count.load(Ordering::Relaxed),
    })
    .to_string();

    if sender.send(Message::Text(snapshot.into())).await.is_err() {
        return; // Client vanished before the snapshot went out.
    }

    // ── Event loop ────────────────────────────────────────────────────────────
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok((scope, json_str)) => {
                        let mine = scope.is_none() || scope == Some(user_id);
                        if mine && sender.send(Message::Text(json_str.into())).await.is_err() {
                            break; // Client disconnect
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Slow reader — some events were skipped, not an error.
                        debug!(%user_id, "WS client lagged, skipped {n} events");
                    }
                    Err(_) => break, // Channel closed
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    _ => {} // Client text/binary — ignored
                }
            }
        }
    }

    info!(%user_id, "🔌 Monitor client disconnected");
}
