//! Status fan-out over WebSocket.
//!
//! Clients subscribe to topic keys (`video:<id>`) with JSON frames and
//! receive status events in publish order. A connection that stops draining
//! loses its oldest buffered events; the socket itself is never blocked by
//! the dispatch path.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::bus::StatusEvent;
use crate::fanout::video_topic_key;

use super::handlers::AppState;

/// Heartbeat ping interval in seconds.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Frames a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase", deny_unknown_fields)]
enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

/// Event frame delivered to subscribers.
#[derive(Debug, Serialize)]
struct EventFrame<'a> {
    topic: String,
    #[serde(flatten)]
    event: &'a StatusEvent,
}

#[derive(Debug, Serialize)]
struct ErrorFrame<'a> {
    error: &'a str,
    message: String,
}

/// GET /ws - upgrade and stream status events
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

fn parse_topic(topic: &str) -> Option<String> {
    let id = topic.strip_prefix("video:")?;
    (!id.is_empty() && id.len() <= 64).then(|| topic.to_string())
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let subscriber = state.fanout.subscriber();
    let mut topics: HashSet<String> = HashSet::new();

    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    // The first tick completes immediately; skip it.
    heartbeat.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Subscribe { topic }) => {
                                match parse_topic(&topic) {
                                    Some(key) => {
                                        state.fanout.attach(&key, &subscriber);
                                        topics.insert(key);
                                    }
                                    None => {
                                        if send_error(&mut sender, "invalid_topic", &topic).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                            Ok(ClientFrame::Unsubscribe { topic }) => {
                                if topics.remove(&topic) {
                                    state.fanout.detach(&topic, &subscriber);
                                }
                            }
                            Err(e) => {
                                tracing::debug!("unparseable client frame: {}", e);
                                if send_error(&mut sender, "invalid_frame", &e.to_string()).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Err(e)) => {
                        tracing::debug!("websocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            event = subscriber.recv() => {
                let Some(event) = event else { break };
                let frame = EventFrame {
                    topic: video_topic_key(&event.video_id),
                    event: &event,
                };
                let payload = match serde_json::to_string(&frame) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!("event frame encoding failed: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if awaiting_pong {
                    tracing::debug!("client missed heartbeat, closing");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
        }
    }

    state.fanout.disconnect(&subscriber);
}

async fn send_error(
    sender: &mut (impl SinkExt<Message> + Unpin),
    code: &str,
    detail: &str,
) -> std::result::Result<(), ()> {
    let frame = ErrorFrame {
        error: code,
        message: detail.to_string(),
    };
    let payload = serde_json::to_string(&frame).map_err(|_| ())?;
    sender.send(Message::Text(payload)).await.map_err(|_| ())
}
