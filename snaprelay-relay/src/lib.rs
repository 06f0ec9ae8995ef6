use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    extract::{Path, State, WebSocketUpgrade, ws::Message},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use snaprelay_core::{
    MAX_RELAY_FRAME_BYTES, PairingCode, ProtocolMessage, decode_message, encode_message,
};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{debug, info, warn};

/// Exactly two peers share a pairing code; a third is turned away.
pub const MAX_PEERS_PER_CODE: usize = 2;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
struct Peer {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Debug, Default)]
struct Room {
    peers: Vec<Peer>,
}

#[derive(Debug, Default)]
struct RelayState {
    rooms: HashMap<String, Room>,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<RelayState>>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RelayState::default())),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn consume(&mut self, amount: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/{code}", get(ws_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn ws_handler(
    Path(code): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    let Ok(code) = PairingCode::parse(&code) else {
        return (StatusCode::BAD_REQUEST, "pairing code must be 6 digits").into_response();
    };

    ws.max_frame_size(MAX_RELAY_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, code, socket).await {
                warn!("socket session ended with error: {}", err);
            }
        })
}

async fn handle_socket(
    state: AppState,
    code: PairingCode,
    socket: axum::extract::ws::WebSocket,
) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Keepalive interval for the per-client write half.  When using split
    // WebSocket streams, Pong responses to incoming Pings are queued by the
    // read half but only flushed when the write half actually sends data.
    // Without periodic writes, a reverse proxy may consider the relay-side
    // connection idle/dead and close it.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let peer_id = NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed);
    if !register_peer(&state, &code, peer_id, outbound_tx.clone()).await {
        send_protocol(
            &outbound_tx,
            &ProtocolMessage::Error {
                message: format!("pairing code {code} already has two clients"),
            },
        );
        let _ = outbound_tx.send(Message::Close(None));
        // Let the send task drain the rejection before it exits.
        drop(outbound_tx);
        let _ = send_task.await;
        return Ok(());
    }

    info!("peer {} joined code {}", peer_id, code);

    let mut rate_limiter = TokenBucket::new(24.0, 12.0);

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket receive error: {}", err);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                if text.len() > MAX_RELAY_FRAME_BYTES {
                    warn!("closing peer {} for oversized frame", peer_id);
                    break;
                }

                // Heartbeats terminate at the relay; everything else is
                // forwarded verbatim, opaque payloads included.
                if let Ok(ProtocolMessage::Ping { .. }) = decode_message(text.as_str()) {
                    debug!("consumed heartbeat from peer {}", peer_id);
                    continue;
                }

                if !rate_limiter.consume(1.0) {
                    warn!("rate limit exceeded for peer {}", peer_id);
                    continue;
                }

                forward_text(&state, &code, peer_id, text.to_string()).await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    unregister_peer(&state, &code, peer_id).await;
    send_task.abort();
    info!("peer {} left code {}", peer_id, code);
    Ok(())
}

/// Returns `false` when the code already has two peers. The first peer waits
/// alone; the second arrival makes both sides see `partner_connected`.
async fn register_peer(
    state: &AppState,
    code: &PairingCode,
    peer_id: u64,
    tx: mpsc::UnboundedSender<Message>,
) -> bool {
    let mut relay = state.inner.write().await;
    let room = relay.rooms.entry(code.as_str().to_owned()).or_default();
    if room.peers.len() >= MAX_PEERS_PER_CODE {
        return false;
    }
    room.peers.push(Peer {
        id: peer_id,
        tx: tx.clone(),
    });
    let recipients: Vec<_> = room.peers.iter().map(|peer| peer.tx.clone()).collect();
    let paired = room.peers.len() == MAX_PEERS_PER_CODE;
    drop(relay);

    if paired {
        for recipient in &recipients {
            send_protocol(recipient, &ProtocolMessage::PartnerConnected);
        }
    } else {
        send_protocol(&tx, &ProtocolMessage::WaitingForClient);
    }
    true
}

async fn unregister_peer(state: &AppState, code: &PairingCode, peer_id: u64) {
    let mut relay = state.inner.write().await;
    let mut survivors = Vec::new();
    if let Some(room) = relay.rooms.get_mut(code.as_str()) {
        room.peers.retain(|peer| peer.id != peer_id);
        survivors = room.peers.iter().map(|peer| peer.tx.clone()).collect();
        if room.peers.is_empty() {
            relay.rooms.remove(code.as_str());
        }
    }
    drop(relay);

    for survivor in survivors {
        send_protocol(&survivor, &ProtocolMessage::PartnerDisconnected);
    }
}

async fn forward_text(state: &AppState, code: &PairingCode, sender_id: u64, text: String) {
    let recipients = {
        let relay = state.inner.read().await;
        relay
            .rooms
            .get(code.as_str())
            .map(|room| {
                room.peers
                    .iter()
                    .filter(|peer| peer.id != sender_id)
                    .map(|peer| peer.tx.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };

    for tx in recipients {
        let _ = tx.send(Message::Text(text.clone().into()));
    }
}

fn send_protocol(tx: &mpsc::UnboundedSender<Message>, message: &ProtocolMessage) {
    match encode_message(message) {
        Ok(text) => {
            let _ = tx.send(Message::Text(text.into()));
        }
        Err(err) => warn!("failed to serialize relay message: {}", err),
    }
}
