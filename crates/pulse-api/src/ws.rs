//! WebSocket endpoint bridging connections to the broadcast hub.
//!
//! Each connection becomes a hub session: outbound frames stream from
//! the session's bounded channel, inbound control frames (`subscribe`,
//! `ping`, `pause`, `resume`) mutate it. Transport-level pings run
//! every heartbeat cycle; any inbound traffic counts as liveness, and
//! the hub heartbeat reaps sessions that stay silent.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tracing::debug;

use pulse_core::{defaults, ClientFrame};

use crate::AppState;

/// `GET /ws` — upgrade and hand the socket to the bridge.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let hub = state.hub.clone();
    let (session_id, mut frames) = hub.attach();
    debug!(session_id = %session_id, "websocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Outbound: hub frames plus transport pings.
    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(Duration::from_secs(
            defaults::HEARTBEAT_INTERVAL_SECS,
        ));
        ping.tick().await;
        loop {
            tokio::select! {
                frame = frames.recv() => {
                    match frame {
                        Some(frame) => {
                            let json = match serde_json::to_string(&frame) {
                                Ok(json) => json,
                                Err(_) => continue,
                            };
                            if sender.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        // Hub closed the session (overflow or reap).
                        None => break,
                    }
                }
                _ = ping.tick() => {
                    if sender.send(Message::Ping(vec![])).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Inbound: control frames and liveness.
    let recv_hub = state.hub.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            recv_hub.touch(session_id);
            match message {
                Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Subscribe { channels }) => {
                        let effective = recv_hub.subscribe(session_id, channels);
                        debug!(
                            session_id = %session_id,
                            channels = ?effective,
                            "subscription replaced"
                        );
                    }
                    Ok(ClientFrame::Ping) => recv_hub.pong(session_id),
                    Ok(ClientFrame::Pause { timestamp }) => {
                        recv_hub.pause(session_id, timestamp)
                    }
                    Ok(ClientFrame::Resume) => recv_hub.resume(session_id),
                    // Unknown types get a diagnostic, not a close.
                    Err(_) => recv_hub.send_error(
                        session_id,
                        "unrecognized message type; expected subscribe, ping, pause, or resume",
                    ),
                },
                Message::Close(_) => break,
                // Pong and binary frames only refresh liveness.
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }
    hub.detach(session_id);
    debug!(session_id = %session_id, "websocket disconnected");
}
