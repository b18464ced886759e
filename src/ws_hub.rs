//! Realtime Push Hub
//! Mission: accept authenticated persistent connections, index them by
//! user, heartbeat/reap stale peers, and fan out server-initiated messages.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Server-initiated message types pushed over the websocket. `Heartbeat` is
/// also client-initiated (echoed back verbatim).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    ConnectionStatus { connected: bool, last_heartbeat: DateTime<Utc> },
    Heartbeat { timestamp: DateTime<Utc> },
    PriceUpdate(serde_json::Value),
    TradeNotification(serde_json::Value),
    TradeStatus(serde_json::Value),
    PortfolioUpdate(serde_json::Value),
    MarketAlert(serde_json::Value),
    SystemNotification(serde_json::Value),
}

struct ConnectionEntry {
    user_id: String,
    alive: bool,
    last_heartbeat: DateTime<Utc>,
    sender: mpsc::UnboundedSender<WsMessage>,
}

/// Two indexed structures, as required by the invariant that a connection
/// id appears in exactly one user entry.
#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    by_user: HashMap<String, HashSet<ConnectionId>>,
}

pub struct RealtimeHub {
    state: Mutex<HubState>,
}

impl RealtimeHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn user_count(&self) -> usize {
        self.state.lock().by_user.len()
    }

    fn insert(&self, id: ConnectionId, user_id: String, sender: mpsc::UnboundedSender<WsMessage>) {
        let mut state = self.state.lock();
        state.connections.insert(
            id,
            ConnectionEntry {
                user_id: user_id.clone(),
                alive: true,
                last_heartbeat: Utc::now(),
                sender,
            },
        );
        state.by_user.entry(user_id).or_default().insert(id);
    }

    fn remove(&self, id: ConnectionId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.connections.remove(&id) {
            if let Some(set) = state.by_user.get_mut(&entry.user_id) {
                set.remove(&id);
                if set.is_empty() {
                    state.by_user.remove(&entry.user_id);
                }
            }
        }
    }

    fn touch_heartbeat(&self, id: ConnectionId) {
        if let Some(entry) = self.state.lock().connections.get_mut(&id) {
            entry.alive = true;
            entry.last_heartbeat = Utc::now();
        }
    }

    /// Best-effort delivery to every session of a user. Drops silently (with
    /// a log) if a peer's buffer is full or it is no longer writable.
    pub fn send_to_user(&self, user_id: &str, event: &ServerEvent) {
        let Ok(payload) = serde_json::to_string(event) else { return };
        let ids: Vec<ConnectionId> = self
            .state
            .lock()
            .by_user
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            self.deliver(id, payload.clone());
        }
    }

    pub fn send_to_connection(&self, id: ConnectionId, event: &ServerEvent) {
        let Ok(payload) = serde_json::to_string(event) else { return };
        self.deliver(id, payload);
    }

    pub fn broadcast(&self, event: &ServerEvent, exclude: Option<ConnectionId>) {
        let Ok(payload) = serde_json::to_string(event) else { return };
        let ids: Vec<ConnectionId> = self
            .state
            .lock()
            .connections
            .keys()
            .copied()
            .filter(|id| Some(*id) != exclude)
            .collect();
        for id in ids {
            self.deliver(id, payload.clone());
        }
    }

    fn deliver(&self, id: ConnectionId, payload: String) {
        let sender = self.state.lock().connections.get(&id).map(|e| e.sender.clone());
        if let Some(sender) = sender {
            if sender.send(WsMessage::Text(payload)).is_err() {
                debug!(connection_id = %id, "dropping message, peer not writable");
            }
        }
    }

    /// Handshake: the caller has already verified the token. Accept the
    /// socket, register it, send the initial `connection_status`, then run
    /// the reader loop until close or a missed heartbeat.
    pub async fn handle_connection(self: Arc<Self>, socket: WebSocket, user_id: String) {
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        self.insert(id, user_id.clone(), tx.clone());

        let (mut sink, mut stream) = socket.split();

        let initial = ServerEvent::ConnectionStatus {
            connected: true,
            last_heartbeat: Utc::now(),
        };
        if let Ok(json) = serde_json::to_string(&initial) {
            if sink.send(WsMessage::Text(json)).await.is_err() {
                self.remove(id);
                return;
            }
        }

        let hub = self.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let reader_hub = self.clone();
        let reader_tx = tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                match msg {
                    WsMessage::Text(text) => {
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                            if value.get("type").and_then(|t| t.as_str()) == Some("heartbeat") {
                                reader_hub.touch_heartbeat(id);
                                let pong = ServerEvent::Heartbeat { timestamp: Utc::now() };
                                if let Ok(json) = serde_json::to_string(&pong) {
                                    let _ = reader_tx.send(WsMessage::Text(json));
                                }
                            }
                        }
                    }
                    WsMessage::Pong(_) => reader_hub.touch_heartbeat(id),
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        });

        let heartbeat_hub = self.clone();
        let heartbeat_tx = tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(WsMessage::Ping(Vec::new())).is_err() {
                    break;
                }
                let stale = heartbeat_hub
                    .state
                    .lock()
                    .connections
                    .get(&id)
                    .map(|e| Utc::now().signed_duration_since(e.last_heartbeat).num_seconds() as u64 > HEARTBEAT_TIMEOUT.as_secs())
                    .unwrap_or(true);
                if stale {
                    warn!(connection_id = %id, "missed heartbeat, terminating connection");
                    break;
                }
            }
        });

        tokio::select! {
            _ = reader => {}
            _ = heartbeat => {}
            _ = writer => {}
        }

        self.remove(id);
    }

    /// Close all connections, release indices, stop accepting new work.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        for (_, entry) in state.connections.drain() {
            let _ = entry.sender.send(WsMessage::Close(None));
        }
        state.by_user.clear();
    }
}
