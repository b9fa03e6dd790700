//! Transcript / level WebSocket endpoint.
//!
//! One writer loop per client. Events arrive from the subscriber ring in
//! publish order and go out as `{type, data}` envelopes. A send that takes
//! longer than 2 s drops the client; other subscribers are unaffected.
//! Clients may send `{"type":"ping"}` and get `{"type":"pong"}` back.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::state::AppState;

const WRITE_DEADLINE: Duration = Duration::from_secs(2);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (mut subscription, session_id) = match state.supervisor.subscribe_transcript() {
        Ok(handle) => handle,
        Err(e) => {
            warn!(error = %e, "rejecting transcript subscriber");
            let frame = json!({ "type": "error", "data": { "reason": e.to_string(), "fatal": false } });
            let _ = socket.send(Message::Text(frame.to_string().into())).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    info!(session_id = ?session_id, "transcript subscriber connected");

    let hello = json!({ "type": "status", "data": { "stage": "subscribed", "sessionId": session_id } });
    if socket.send(Message::Text(hello.to_string().into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let is_ping = serde_json::from_str::<serde_json::Value>(&text)
                            .ok()
                            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "ping"))
                            .unwrap_or(false);
                        if is_ping {
                            let pong = json!({ "type": "pong" });
                            let _ = socket.send(Message::Text(pong.to_string().into())).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            event = subscription.recv() => {
                let Some(event) = event else {
                    debug!("subscription closed; ending socket");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                let payload = event.envelope().to_string();
                let send = tokio::time::timeout(
                    WRITE_DEADLINE,
                    socket.send(Message::Text(payload.into())),
                )
                .await;
                match send {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(error = %e, "transcript socket write failed");
                        break;
                    }
                    Err(_) => {
                        warn!("transcript socket missed the write deadline; dropping client");
                        break;
                    }
                }
            }
        }
    }
    info!("transcript subscriber disconnected");
}
