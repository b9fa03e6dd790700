//! Chat relay — one WS connection to the room's message channel.
//!
//! ## Connection lifecycle
//!
//! ```text
//! connect ──► read frames ──► parse ──► broadcast
//!    ▲             │
//!    │             ├─ room_control.status == closed ─► status(room_closed), stop
//!    │             └─ disconnect / error
//!    │                    │
//!    └── backoff 1,2,4,8,16 s (cap 16) ◄──┘   status(reconnecting, attempt=k)
//! ```
//!
//! The connection presents the resolver-supplied user-agent and signature
//! cookie; neither is refreshed mid-session — reconnects reuse them. A text
//! ping goes out every 10 s to keep the gateway from reaping the socket.

pub mod parse;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::events::{ChatEvent, ChatPayload};
use crate::resolve::ResolvedRoom;
use crate::session::SessionStats;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const BACKOFF_CAP_SECS: u64 = 16;

/// Reconnect delay for attempt `k` (1-based): 1, 2, 4, 8, 16, 16, ...
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(4);
    Duration::from_secs((1u64 << exp).min(BACKOFF_CAP_SECS))
}

enum ConnOutcome {
    RoomClosed,
    Disconnected,
    Cancelled,
}

/// Relay task: runs until the room closes, the token fires, or the
/// broadcaster is no longer needed.
pub(crate) async fn run_chat_relay(
    room: ResolvedRoom,
    events: Arc<Broadcaster<ChatEvent>>,
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
) {
    let Some(ws_url) = room.ws_url.clone() else {
        warn!(room_id = %room.room_id, "room exposes no chat channel");
        events.publish(ChatEvent::error("chat_unavailable"));
        return;
    };

    let mut attempt: u32 = 0;
    loop {
        let outcome = match connect(&ws_url, &room).await {
            Ok(ws) => {
                info!(room_id = %room.room_id, "chat channel connected");
                attempt = 0;
                events.publish(ChatEvent::status("connected", None));
                read_loop(ws, &events, &stats, &cancel).await
            }
            Err(e) => {
                debug!(error = %e, "chat connect failed");
                ConnOutcome::Disconnected
            }
        };

        match outcome {
            ConnOutcome::Cancelled => return,
            ConnOutcome::RoomClosed => {
                info!(room_id = %room.room_id, "room closed; chat relay stopping");
                events.publish(ChatEvent::status("room_closed", None));
                return;
            }
            ConnOutcome::Disconnected => {
                attempt += 1;
                stats.chat_reconnects.fetch_add(1, Ordering::Relaxed);
                let delay = backoff_delay(attempt);
                events.publish(ChatEvent::status("reconnecting", Some(attempt)));
                debug!(attempt, ?delay, "chat reconnect scheduled");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn connect(
    ws_url: &str,
    room: &ResolvedRoom,
) -> anyhow::Result<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
> {
    let mut request = ws_url.into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(header::USER_AGENT, room.user_agent.parse()?);
    headers.insert(header::REFERER, "https://live.douyin.com/".parse()?);
    if let Some(cookie) = &room.cookie {
        headers.insert(header::COOKIE, cookie.parse()?);
    }
    let (ws, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

async fn read_loop<S>(
    mut ws: tokio_tungstenite::WebSocketStream<S>,
    events: &Broadcaster<ChatEvent>,
    stats: &SessionStats,
    cancel: &CancellationToken,
) -> ConnOutcome
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.close(None).await;
                return ConnOutcome::Cancelled;
            }
            _ = heartbeat.tick() => {
                if ws.send(Message::text("ping")).await.is_err() {
                    return ConnOutcome::Disconnected;
                }
            }
            frame = ws.next() => {
                let raw: Vec<u8> = match frame {
                    Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                    Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        return ConnOutcome::Disconnected;
                    }
                };

                let event = parse::parse_frame(&raw);
                stats.chat_events.fetch_add(1, Ordering::Relaxed);
                if matches!(event.payload, ChatPayload::Other { .. }) {
                    stats.unknown_chat_frames.fetch_add(1, Ordering::Relaxed);
                }
                let closed = parse::is_room_closed(&event);
                events.publish(event);
                if closed {
                    let _ = ws.close(None).await;
                    return ConnOutcome::RoomClosed;
                }
            }
        }
    }
}
