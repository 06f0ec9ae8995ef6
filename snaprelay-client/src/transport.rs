use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use snaprelay_core::{
    HEARTBEAT_INTERVAL_MS, PairingCode, ProtocolMessage, RECONNECT_BASE_MS, RECONNECT_JITTER_MS,
    RECONNECT_MAX_MS, decode_message, encode_message,
};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
    time::{Duration, Instant, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(8);
const ABNORMAL_CLOSE_TEXT: &str = "connection to the server failed";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = futures::stream::SplitSink<WsStream, Message>;

/// Lifecycle and traffic events emitted by the transport, in the order the
/// socket produced them.
#[derive(Debug)]
pub enum TransportEvent {
    Opened { code: PairingCode },
    Inbound(ProtocolMessage),
    Closed { clean: bool, error: Option<String> },
}

#[derive(Debug)]
enum TransportCommand {
    Connect(PairingCode),
    Send(ProtocolMessage),
    Disconnect,
}

#[derive(Debug)]
pub enum TransportConfigError {
    UnsupportedScheme(String),
}

impl std::fmt::Display for TransportConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportConfigError::UnsupportedScheme(scheme) => {
                write!(f, "relay URL scheme must be ws or wss, got {scheme:?}")
            }
        }
    }
}

impl std::error::Error for TransportConfigError {}

/// Owns the relay socket lifecycle for one logical session: dial, announce,
/// heartbeat, outbound queueing, close classification, and jittered-backoff
/// reconnection. All socket state lives in one supervisor task; the handle
/// only carries commands to it.
#[derive(Debug)]
pub struct RelayTransport {
    cmd_tx: mpsc::UnboundedSender<TransportCommand>,
    task: JoinHandle<()>,
}

impl RelayTransport {
    pub fn new(
        base_url: url::Url,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportConfigError> {
        match base_url.scheme() {
            "ws" | "wss" => {}
            other => return Err(TransportConfigError::UnsupportedScheme(other.to_owned())),
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(transport_task(base_url, cmd_rx, event_tx));
        Ok((Self { cmd_tx, task }, event_rx))
    }

    /// No-op while a socket is already open or being dialed.
    pub fn connect(&self, code: PairingCode) {
        let _ = self.cmd_tx.send(TransportCommand::Connect(code));
    }

    /// Sends immediately when open; otherwise the message is queued FIFO and
    /// flushed on the next successful open.
    pub fn send(&self, message: ProtocolMessage) {
        let _ = self.cmd_tx.send(TransportCommand::Send(message));
    }

    /// User-initiated close. Clears the reconnect intent so no background
    /// timer resurrects the session.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(TransportCommand::Disconnect);
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Default)]
struct SessionState {
    desired: bool,
    code: Option<PairingCode>,
    attempt: u32,
    queue: VecDeque<ProtocolMessage>,
    next_dial: Option<Instant>,
}

impl SessionState {
    fn apply_idle_command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Connect(code) => {
                self.desired = true;
                self.code = Some(code);
                self.attempt = 0;
                self.next_dial = None;
            }
            TransportCommand::Send(message) => self.queue.push_back(message),
            TransportCommand::Disconnect => {
                self.desired = false;
                self.attempt = 0;
                self.next_dial = None;
                self.queue.clear();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if !self.desired || self.code.is_none() {
            return;
        }
        self.attempt = self.attempt.saturating_add(1);
        let jitter_ms = rand::rng().random_range(0..RECONNECT_JITTER_MS);
        let delay_ms = reconnect_delay_ms(self.attempt, jitter_ms);
        info!(attempt = self.attempt, delay_ms, "scheduling reconnect");
        self.next_dial = Some(Instant::now() + Duration::from_millis(delay_ms));
    }
}

/// Delay before reconnect attempt `n`: base 500 ms doubling per attempt,
/// capped at 5000 ms, plus the caller-supplied jitter.
#[must_use]
pub fn reconnect_delay_ms(attempt: u32, jitter_ms: u64) -> u64 {
    let shift = attempt.saturating_sub(1).min(16);
    let exponential = RECONNECT_BASE_MS.saturating_mul(1_u64 << shift);
    exponential.min(RECONNECT_MAX_MS) + jitter_ms
}

fn endpoint_url(base: &url::Url, code: &PairingCode) -> String {
    format!("{}/{}", base.as_str().trim_end_matches('/'), code)
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

enum SocketEnd {
    /// Local `disconnect()`; reconnect intent already cleared.
    CleanLocal,
    /// Remote close frame with a normal code.
    CleanRemote,
    Unclean(String),
    /// Command channel closed; the owning handle is gone.
    Shutdown,
}

async fn transport_task(
    base_url: url::Url,
    mut cmd_rx: mpsc::UnboundedReceiver<TransportCommand>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut session = SessionState::default();

    loop {
        if !session.desired || session.code.is_none() {
            let Some(command) = cmd_rx.recv().await else {
                return;
            };
            session.apply_idle_command(command);
            continue;
        }

        if let Some(deadline) = session.next_dial {
            let interrupted = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => false,
                command = cmd_rx.recv() => match command {
                    Some(command) => {
                        session.apply_idle_command(command);
                        true
                    }
                    None => return,
                },
            };
            if interrupted {
                continue;
            }
            session.next_dial = None;
        }

        let Some(code) = session.code.clone() else {
            continue;
        };
        let url = endpoint_url(&base_url, &code);
        debug!(attempt = session.attempt, %url, "dialing relay");

        let stream = match timeout(DIAL_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(err)) => {
                warn!(%url, "dial failed: {err}");
                let _ = event_tx.send(TransportEvent::Closed {
                    clean: false,
                    error: Some(format!("{ABNORMAL_CLOSE_TEXT}: {err}")),
                });
                session.schedule_reconnect();
                continue;
            }
            Err(_) => {
                warn!(%url, "dial timed out after {DIAL_TIMEOUT:?}");
                let _ = event_tx.send(TransportEvent::Closed {
                    clean: false,
                    error: Some(format!("{ABNORMAL_CLOSE_TEXT}: dial timed out")),
                });
                session.schedule_reconnect();
                continue;
            }
        };

        match run_session(stream, &code, &mut session, &mut cmd_rx, &event_tx).await {
            SocketEnd::CleanLocal => {
                let _ = event_tx.send(TransportEvent::Closed {
                    clean: true,
                    error: None,
                });
            }
            SocketEnd::CleanRemote => {
                let _ = event_tx.send(TransportEvent::Closed {
                    clean: true,
                    error: None,
                });
                session.schedule_reconnect();
            }
            SocketEnd::Unclean(error) => {
                let _ = event_tx.send(TransportEvent::Closed {
                    clean: false,
                    error: Some(error),
                });
                session.schedule_reconnect();
            }
            SocketEnd::Shutdown => return,
        }
    }
}

async fn run_session(
    stream: WsStream,
    code: &PairingCode,
    session: &mut SessionState,
    cmd_rx: &mut mpsc::UnboundedReceiver<TransportCommand>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
) -> SocketEnd {
    session.attempt = 0;
    let _ = event_tx.send(TransportEvent::Opened { code: code.clone() });

    let (mut write, mut read) = stream.split();

    let announce = ProtocolMessage::ConnectionRequest {
        code: code.clone(),
        ts: now_unix_ms(),
    };
    if send_frame(&mut write, &announce).await.is_err() {
        return SocketEnd::Unclean(ABNORMAL_CLOSE_TEXT.to_owned());
    }

    while let Some(queued) = session.queue.pop_front() {
        if send_frame(&mut write, &queued).await.is_err() {
            session.queue.push_front(queued);
            return SocketEnd::Unclean(ABNORMAL_CLOSE_TEXT.to_owned());
        }
    }

    let mut heartbeat = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat.tick().await; // skip first immediate tick

    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(TransportCommand::Connect(_)) => {
                    // Already open; connect is idempotent.
                }
                Some(TransportCommand::Send(message)) => {
                    if send_frame(&mut write, &message).await.is_err() {
                        session.queue.push_back(message);
                        return SocketEnd::Unclean(ABNORMAL_CLOSE_TEXT.to_owned());
                    }
                }
                Some(TransportCommand::Disconnect) => {
                    session.desired = false;
                    session.attempt = 0;
                    session.queue.clear();
                    let _ = write
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        })))
                        .await;
                    return SocketEnd::CleanLocal;
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    return SocketEnd::Shutdown;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match decode_message(text.as_str()) {
                    Ok(message) => {
                        let _ = event_tx.send(TransportEvent::Inbound(message));
                    }
                    Err(err) => warn!("ignoring undecodable frame: {err}"),
                },
                Some(Ok(Message::Close(close_frame))) => return classify_close(close_frame),
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    return SocketEnd::Unclean(format!("{ABNORMAL_CLOSE_TEXT}: {err}"));
                }
                None => return SocketEnd::Unclean(ABNORMAL_CLOSE_TEXT.to_owned()),
            },
            _ = heartbeat.tick() => {
                let ping = ProtocolMessage::Ping { ts: now_unix_ms() };
                if send_frame(&mut write, &ping).await.is_err() {
                    return SocketEnd::Unclean(ABNORMAL_CLOSE_TEXT.to_owned());
                }
            }
        }
    }
}

/// A close frame with a normal code is a clean shutdown. An abnormal close
/// carrying a reason surfaces that reason; otherwise the code alone is
/// reported.
fn classify_close(frame: Option<CloseFrame>) -> SocketEnd {
    match frame {
        Some(frame) if frame.code == CloseCode::Normal => SocketEnd::CleanRemote,
        Some(frame) if !frame.reason.is_empty() => SocketEnd::Unclean(frame.reason.to_string()),
        Some(frame) => SocketEnd::Unclean(format!("connection closed (code {})", frame.code)),
        None => SocketEnd::Unclean(ABNORMAL_CLOSE_TEXT.to_owned()),
    }
}

async fn send_frame(
    write: &mut WsWrite,
    message: &ProtocolMessage,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let text = match encode_message(message) {
        Ok(text) => text,
        Err(err) => {
            warn!("failed to encode outgoing frame: {err}");
            return Ok(());
        }
    };
    write.send(Message::Text(text.into())).await
}
