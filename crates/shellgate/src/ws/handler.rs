//! Connection server: accepts WebSocket upgrades, applies IP-level
//! admission control, and drives each socket through the lifecycle
//! controller.
//!
//! The socket sink is owned by a writer task fed through a bounded
//! queue; the controller and the output pump only ever queue frames.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::api::state::AppState;
use crate::session::Outbound;
use crate::ws::protocol::{ServerFrame, close};

/// Slack above the application ceiling: messages in the slack band are
/// rejected by the controller with close code 4009 instead of a bare
/// transport error, while anything larger is never buffered at all.
const TRANSPORT_SIZE_SLACK: usize = 4 * 1024;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let limit = transport_size_limit(state.controller.settings.max_message_bytes);
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_connection(state, socket, peer, headers))
}

/// How much a peer can make the server buffer for a single message,
/// regardless of what it eventually gets rejected with.
fn transport_size_limit(app_ceiling: usize) -> usize {
    app_ceiling.saturating_add(TRANSPORT_SIZE_SLACK)
}

async fn handle_connection(state: AppState, mut socket: WebSocket, peer: SocketAddr, headers: HeaderMap) {
    let controller = state.controller.clone();
    let (ip, forwarded_present) = controller.limiter.client_ip(peer, &headers);

    if !controller.limiter.admit_connection(ip, forwarded_present) {
        controller
            .alerts
            .rate_limit_rejections
            .fetch_add(1, Ordering::Relaxed);
        warn!("connection from {} rejected by rate limiter", ip);
        send_and_close(&mut socket, close::POLICY_VIOLATION, "rate limit exceeded").await;
        return;
    }

    // Immediate status frame; an unwritable brand-new socket means a
    // dead transport, so bail before creating any state.
    let Ok(connecting) = serde_json::to_string(&ServerFrame::connecting()) else {
        return;
    };
    if socket.send(Message::Text(connecting.into())).await.is_err() {
        debug!("socket from {} dead before handshake", ip);
        return;
    }

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(controller.settings.client_queue_depth);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let result = match frame {
                Outbound::Text(json) => sink.send(Message::Text(json.into())).await,
                Outbound::Binary(bytes) => sink.send(Message::Binary(bytes)).await,
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    let Some(placeholder) = controller.begin_connection(&tx).await else {
        drop(tx);
        let _ = writer.await;
        return;
    };

    // Exactly one inbound message is the auth payload; a one-shot read
    // keeps the auth phase bounded.
    let first = read_data_frame(&mut stream).await;
    let Some(raw) = first else {
        controller.handle_preauth_disconnect(placeholder).await;
        drop(tx);
        let _ = writer.await;
        return;
    };

    let Some((session, epoch)) = controller.authenticate(placeholder, &raw, &tx).await else {
        drop(tx);
        let _ = writer.await;
        return;
    };

    // Steady state: every further frame is terminal input.
    loop {
        match read_data_frame(&mut stream).await {
            Some(data) => {
                if !controller.handle_frame(&session, epoch, data).await {
                    break;
                }
            }
            None => {
                controller.handle_disconnect(session.clone(), epoch).await;
                break;
            }
        }
    }

    drop(tx);
    let _ = writer.await;
}

/// Read the next text or binary frame, skipping pings and pongs.
/// `None` means the socket is closed or errored.
async fn read_data_frame(stream: &mut futures::stream::SplitStream<WebSocket>) -> Option<Bytes> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Some(Bytes::from(text)),
            Some(Ok(Message::Binary(data))) => return Some(data),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Err(e)) => {
                debug!("socket read error: {}", e);
                return None;
            }
        }
    }
}

/// Best-effort status frame followed by a coded close, for rejections
/// that happen before a session exists.
async fn send_and_close(socket: &mut WebSocket, code: u16, reason: &str) {
    if let Ok(json) = serde_json::to_string(&ServerFrame::error(reason)) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_limit_sits_just_above_the_app_ceiling() {
        assert_eq!(transport_size_limit(64 * 1024), 64 * 1024 + TRANSPORT_SIZE_SLACK);
        assert_eq!(transport_size_limit(usize::MAX), usize::MAX);
    }
}
