use crate::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Query;
use axum::response::Response;
use axum::Extension;
use futures::{SinkExt, StreamExt};
use palaver_common::{ServerEvent, UserId};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Live-connection directory, `user id -> event sender`. Entries exist
/// only while the socket is open; nothing here implies persistence.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<UserId, mpsc::UnboundedSender<ServerEvent>>>,
}

impl ConnectionRegistry {
    pub async fn register(&self, user: UserId, sender: mpsc::UnboundedSender<ServerEvent>) {
        self.connections.write().await.insert(user, sender);
    }

    pub async fn unregister(&self, user: &UserId) {
        self.connections.write().await.remove(user);
    }

    pub async fn online(&self) -> Vec<UserId> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Delivers `event` to `user` if a live connection exists. An offline
    /// target is the expected case; the durable notification record is
    /// the fallback delivery path.
    pub async fn push(&self, user: &UserId, event: ServerEvent) {
        let connections = self.connections.read().await;
        match connections.get(user) {
            Some(sender) => {
                if sender.send(event).is_err() {
                    warn!(user = %user, "dropped event for closing connection");
                }
            }
            None => debug!(user = %user, "no live connection"),
        }
    }

    pub async fn broadcast(&self, event: ServerEvent) {
        let connections = self.connections.read().await;
        for sender in connections.values() {
            let _ = sender.send(event.clone());
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    user_id: String,
}

pub async fn ws_handler(
    Extension(state): Extension<State>,
    Query(params): Query<WsParams>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let user = UserId(params.user_id);
    upgrade.on_upgrade(move |socket| handle_socket(state, user, socket))
}

async fn handle_socket(state: State, user: UserId, socket: WebSocket) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.registry.register(user.clone(), tx).await;
    info!(user = %user, "connected");
    let online = state.registry.online().await;
    state
        .registry
        .broadcast(ServerEvent::OnlineUsers { users: online })
        .await;

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("event encode failed: {err}");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            message = stream.next() => {
                match message {
                    // Inbound frames carry nothing actionable; clients
                    // act over HTTP and only listen here.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.registry.unregister(&user).await;
    info!(user = %user, "disconnected");
    let online = state.registry.online().await;
    state
        .registry
        .broadcast(ServerEvent::OnlineUsers { users: online })
        .await;
}
