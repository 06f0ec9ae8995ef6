use snaprelay_core::{CONNECT_WATCHDOG_MS, CodeError, PairingCode, ProtocolMessage};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::store::PairingStore;
use crate::transport::{RelayTransport, TransportConfigError, TransportEvent, now_unix_ms};

const FORCE_RECONNECT_DELAY: Duration = Duration::from_millis(100);
const TIMEOUT_TEXT: &str = "Connection timed out";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Reactive view of the connection, published through a watch channel.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub error: Option<String>,
    pub code: Option<PairingCode>,
    pub last_success_unix_ms: Option<u64>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            error: None,
            code: None,
            last_success_unix_ms: None,
        }
    }
}

#[derive(Debug)]
enum ControllerCommand {
    Connect(PairingCode),
    CodeRejected(String),
    Disconnect,
    ForceReconnect,
    Foreground,
    Send(ProtocolMessage),
}

/// `connect` is accepted only from the idle states; while a session is being
/// established or is up, repeat calls are no-ops so at most one socket ever
/// exists per pairing session.
fn accepts_connect(status: ConnectionStatus) -> bool {
    matches!(
        status,
        ConnectionStatus::Disconnected | ConnectionStatus::Error
    )
}

/// Wraps [`RelayTransport`] with the user-facing status state machine: a
/// connect watchdog, pairing persistence, focus-triggered reconnects, and a
/// forced disconnect-then-reconnect affordance. Inbound protocol messages are
/// re-emitted untouched for the ingestion pipeline.
#[derive(Debug)]
pub struct ConnectionController {
    cmd_tx: mpsc::UnboundedSender<ControllerCommand>,
    snapshot_rx: watch::Receiver<ConnectionSnapshot>,
    task: JoinHandle<()>,
}

impl ConnectionController {
    pub fn new(
        relay_url: url::Url,
        store: PairingStore,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ProtocolMessage>), TransportConfigError> {
        let (transport, transport_events) = RelayTransport::new(relay_url)?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let initial = ConnectionSnapshot {
            last_success_unix_ms: store.load().map(|pairing| pairing.connected_at_unix_ms),
            code: store.load().map(|pairing| pairing.code),
            ..ConnectionSnapshot::default()
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let task = tokio::spawn(controller_task(
            ControllerTask {
                transport,
                store,
                snapshot_tx,
                inbound_tx,
                watchdog_deadline: None,
                pending_reconnect: None,
                keep_error_on_close: false,
            },
            cmd_rx,
            transport_events,
        ));

        Ok((
            Self {
                cmd_tx,
                snapshot_rx,
                task,
            },
            inbound_rx,
        ))
    }

    /// Validates the code before any I/O. A malformed code fails fast and
    /// also surfaces through the reactive error value.
    pub fn connect(&self, code: &str) -> Result<(), CodeError> {
        match PairingCode::parse(code) {
            Ok(code) => {
                let _ = self.cmd_tx.send(ControllerCommand::Connect(code));
                Ok(())
            }
            Err(err) => {
                let _ = self
                    .cmd_tx
                    .send(ControllerCommand::CodeRejected(err.to_string()));
                Err(err)
            }
        }
    }

    pub fn connect_code(&self, code: PairingCode) {
        let _ = self.cmd_tx.send(ControllerCommand::Connect(code));
    }

    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(ControllerCommand::Disconnect);
    }

    pub fn force_reconnect(&self) {
        let _ = self.cmd_tx.send(ControllerCommand::ForceReconnect);
    }

    /// App regained foreground focus; reconnects to a persisted pairing when
    /// currently disconnected.
    pub fn notify_foreground(&self) {
        let _ = self.cmd_tx.send(ControllerCommand::Foreground);
    }

    pub fn send(&self, message: ProtocolMessage) {
        let _ = self.cmd_tx.send(ControllerCommand::Send(message));
    }

    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot_rx.clone()
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ControllerTask {
    transport: RelayTransport,
    store: PairingStore,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    inbound_tx: mpsc::UnboundedSender<ProtocolMessage>,
    watchdog_deadline: Option<Instant>,
    pending_reconnect: Option<(Instant, PairingCode)>,
    /// Set when the controller itself forced the close (watchdog expiry) so
    /// the transport's follow-up clean-close event does not erase the error.
    keep_error_on_close: bool,
}

async fn controller_task(
    mut task: ControllerTask,
    mut cmd_rx: mpsc::UnboundedReceiver<ControllerCommand>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    loop {
        let far = Instant::now() + Duration::from_secs(3_600);
        let watchdog = tokio::time::sleep_until(task.watchdog_deadline.unwrap_or(far));
        let reconnect_at = task
            .pending_reconnect
            .as_ref()
            .map(|(at, _)| *at)
            .unwrap_or(far);
        let reconnect = tokio::time::sleep_until(reconnect_at);

        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(command) => task.handle_command(command),
                None => return,
            },
            event = transport_events.recv() => match event {
                Some(event) => task.handle_transport_event(event),
                None => return,
            },
            _ = watchdog, if task.watchdog_deadline.is_some() => task.on_watchdog_expired(),
            _ = reconnect, if task.pending_reconnect.is_some() => {
                if let Some((_, code)) = task.pending_reconnect.take() {
                    task.handle_command(ControllerCommand::Connect(code));
                }
            }
        }
    }
}

impl ControllerTask {
    fn update<F: FnOnce(&mut ConnectionSnapshot)>(&self, apply: F) {
        self.snapshot_tx.send_modify(apply);
    }

    fn status(&self) -> ConnectionStatus {
        self.snapshot_tx.borrow().status
    }

    fn handle_command(&mut self, command: ControllerCommand) {
        match command {
            ControllerCommand::Connect(code) => {
                if !accepts_connect(self.status()) {
                    debug!(status = ?self.status(), "connect ignored while active");
                    return;
                }
                info!(code = %code, "connecting");
                self.keep_error_on_close = false;
                self.watchdog_deadline =
                    Some(Instant::now() + Duration::from_millis(CONNECT_WATCHDOG_MS));
                self.update(|snapshot| {
                    snapshot.status = ConnectionStatus::Connecting;
                    snapshot.error = None;
                    snapshot.code = Some(code.clone());
                });
                self.transport.connect(code);
            }
            ControllerCommand::CodeRejected(message) => {
                self.update(|snapshot| snapshot.error = Some(message));
            }
            ControllerCommand::Disconnect => {
                info!("disconnecting");
                self.watchdog_deadline = None;
                self.pending_reconnect = None;
                self.keep_error_on_close = false;
                self.transport.disconnect();
                self.store.clear();
                self.update(|snapshot| {
                    snapshot.status = ConnectionStatus::Disconnected;
                    snapshot.error = None;
                    snapshot.code = None;
                });
            }
            ControllerCommand::ForceReconnect => {
                let code = self
                    .snapshot_tx
                    .borrow()
                    .code
                    .clone()
                    .or_else(|| self.store.load().map(|pairing| pairing.code));
                let Some(code) = code else {
                    debug!("force reconnect with no known pairing code");
                    return;
                };
                info!(code = %code, "forcing reconnect");
                self.watchdog_deadline = None;
                self.keep_error_on_close = false;
                self.transport.disconnect();
                self.update(|snapshot| {
                    snapshot.status = ConnectionStatus::Disconnected;
                    snapshot.error = None;
                });
                self.pending_reconnect = Some((Instant::now() + FORCE_RECONNECT_DELAY, code));
            }
            ControllerCommand::Foreground => {
                if self.status() != ConnectionStatus::Disconnected {
                    return;
                }
                if let Some(pairing) = self.store.load() {
                    info!(code = %pairing.code, "foreground reconnect to persisted pairing");
                    self.handle_command(ControllerCommand::Connect(pairing.code));
                }
            }
            ControllerCommand::Send(message) => self.transport.send(message),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { code } => {
                debug!(code = %code, "transport opened");
                if self.status() != ConnectionStatus::Connected {
                    if self.watchdog_deadline.is_none() {
                        self.watchdog_deadline =
                            Some(Instant::now() + Duration::from_millis(CONNECT_WATCHDOG_MS));
                    }
                    self.update(|snapshot| {
                        snapshot.status = ConnectionStatus::Connecting;
                        snapshot.code = Some(code);
                    });
                }
                // Session bootstrap: ask the partner for the shared history.
                self.transport.send(ProtocolMessage::GetHistory);
            }
            TransportEvent::Inbound(message) => {
                if let ProtocolMessage::PartnerConnected = message {
                    self.on_partner_connected();
                }
                let _ = self.inbound_tx.send(message);
            }
            TransportEvent::Closed { clean, error } => {
                self.watchdog_deadline = None;
                if self.keep_error_on_close {
                    self.keep_error_on_close = false;
                    return;
                }
                if clean {
                    self.update(|snapshot| {
                        snapshot.status = ConnectionStatus::Disconnected;
                    });
                } else {
                    let message = error.unwrap_or_else(|| "connection lost".to_owned());
                    warn!("transport closed uncleanly: {message}");
                    self.update(|snapshot| {
                        snapshot.status = ConnectionStatus::Error;
                        snapshot.error = Some(message);
                    });
                }
            }
        }
    }

    fn on_partner_connected(&mut self) {
        self.watchdog_deadline = None;
        let now = now_unix_ms();
        let code = self.snapshot_tx.borrow().code.clone();
        if let Some(code) = &code {
            if let Err(err) = self.store.save(code, now) {
                warn!("failed to persist pairing: {err}");
            }
        }
        info!("partner connected");
        self.update(|snapshot| {
            snapshot.status = ConnectionStatus::Connected;
            snapshot.error = None;
            snapshot.last_success_unix_ms = Some(now);
        });
    }

    fn on_watchdog_expired(&mut self) {
        warn!("no pairing within the connect watchdog");
        self.watchdog_deadline = None;
        self.keep_error_on_close = true;
        self.transport.disconnect();
        self.update(|snapshot| {
            snapshot.status = ConnectionStatus::Error;
            snapshot.error = Some(TIMEOUT_TEXT.to_owned());
        });
    }
}
