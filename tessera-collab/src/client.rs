//! WebSocket transport between a session and the relay.
//!
//! One spawned task owns the socket for the whole session: it connects,
//! sends the `Join`, forwards frames both ways and reconnects with bounded
//! exponential backoff. The session talks to it through a command channel
//! and receives `TransportEvent`s on an unbounded channel. Every handle
//! method returns immediately.
//!
//! ```text
//!  Disconnected ──► Connecting ──► Connected ──► Synced
//!       ▲               │              │            │
//!       └───── backoff ─┴──────────────┴────────────┘
//!                                      │
//!                               AuthRejected ──► AuthFailed (until reauthenticate)
//! ```

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{JoinRequest, MessageType, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Synced,
    /// Credential refused; no retries until a new one is supplied.
    AuthFailed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Synced)
    }

    pub fn is_synced(&self) -> bool {
        *self == ConnectionState::Synced
    }

    fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (a, b) if *a == b => false,
            (Disconnected | AuthFailed, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Synced) => true,
            (Connected | Synced, AuthFailed) => true,
            (_, Disconnected) => true,
            _ => false,
        }
    }
}

/// Events delivered to the owning session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// Relay refused the credential. Followed by `StateChanged(AuthFailed)`.
    AuthRejected(String),
    Message(SyncMessage),
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay WebSocket URL
    pub url: String,
    /// First reconnect delay (default: 250ms)
    pub initial_backoff: Duration,
    /// Upper bound on the reconnect delay (default: 10s)
    pub max_backoff: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".into(),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Short delays so tests reconnect quickly.
    pub fn for_testing(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(200),
        }
    }
}

/// Doubling reconnect delay with an upper bound.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Publishes state changes, only on real transitions.
struct ConnectionTracker {
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl ConnectionTracker {
    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let current = self.current();
        if !current.can_transition_to(next) {
            if current != next {
                log::warn!("Ignoring transport transition {current:?} -> {next:?}");
            }
            return false;
        }
        log::debug!("Transport {current:?} -> {next:?}");
        self.state.send_replace(next);
        let _ = self.events.send(TransportEvent::StateChanged(next));
        true
    }

    fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

enum Command {
    Send(Vec<u8>),
    Reconnect,
    Reauthenticate(String),
    Shutdown,
}

/// How a single connection ended.
enum ConnectionEnd {
    Failed,
    Reconnect,
    AuthRejected,
    Shutdown,
}

/// Handle to the spawned transport task.
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    client_id: Uuid,
    task: JoinHandle<()>,
}

impl TransportHandle {
    /// Spawn the transport task. Must be called inside a tokio runtime.
    pub fn spawn(
        config: TransportConfig,
        client_id: Uuid,
        room: String,
        join: JoinRequest,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let tracker = ConnectionTracker {
            state: state_tx,
            events: event_tx,
        };
        let task = tokio::spawn(run_transport(config, client_id, room, join, cmd_rx, tracker));

        (
            Self {
                commands: cmd_tx,
                state: state_rx,
                client_id,
                task,
            },
            event_rx,
        )
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_synced(&self) -> bool {
        self.state().is_synced()
    }

    /// Queue a message. Dropped if the socket is down when it reaches the task.
    pub fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        self.command(Command::Send(encoded))
    }

    /// Drop the current connection and dial again immediately.
    pub fn reconnect(&self) -> Result<(), ProtocolError> {
        self.command(Command::Reconnect)
    }

    /// Replace the credential and reconnect, leaving `AuthFailed` if needed.
    pub fn reauthenticate(&self, token: impl Into<String>) -> Result<(), ProtocolError> {
        self.command(Command::Reauthenticate(token.into()))
    }

    /// Close the socket and stop the task. Safe to call more than once.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    fn command(&self, cmd: Command) -> Result<(), ProtocolError> {
        self.commands
            .send(cmd)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_transport(
    config: TransportConfig,
    client_id: Uuid,
    room: String,
    mut join: JoinRequest,
    mut commands: mpsc::UnboundedReceiver<Command>,
    tracker: ConnectionTracker,
) {
    let mut backoff = Backoff::new(config.initial_backoff, config.max_backoff);

    loop {
        tracker.transition(ConnectionState::Connecting);

        let connect = tokio_tungstenite::connect_async(config.url.as_str());
        tokio::pin!(connect);
        let attempt = loop {
            tokio::select! {
                result = &mut connect => break Some(result),
                cmd = commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => break None,
                    Some(Command::Reauthenticate(token)) => join.token = token,
                    Some(Command::Send(_)) | Some(Command::Reconnect) => {}
                },
            }
        };

        let end = match attempt {
            None => ConnectionEnd::Shutdown,
            Some(Ok((ws, _))) => {
                log::info!("Connected to {} as {client_id}", config.url);
                backoff.reset();
                run_connection(ws, client_id, &room, &mut join, &mut commands, &tracker).await
            }
            Some(Err(e)) => {
                log::debug!("Connect to {} failed: {e}", config.url);
                ConnectionEnd::Failed
            }
        };

        match end {
            ConnectionEnd::Shutdown => {
                tracker.transition(ConnectionState::Disconnected);
                log::debug!("Transport for {client_id} stopped");
                return;
            }
            ConnectionEnd::Reconnect => {
                tracker.transition(ConnectionState::Disconnected);
            }
            ConnectionEnd::Failed => {
                tracker.transition(ConnectionState::Disconnected);
                let delay = backoff.next_delay();
                log::debug!("Reconnecting in {delay:?}");
                if !wait_for_retry(delay, &mut join, &mut commands).await {
                    return;
                }
            }
            ConnectionEnd::AuthRejected => {
                tracker.transition(ConnectionState::AuthFailed);
                if !wait_for_credential(&mut join, &mut commands).await {
                    tracker.transition(ConnectionState::Disconnected);
                    return;
                }
                backoff.reset();
            }
        }
    }
}

/// Sleep out the backoff delay. Returns `false` on shutdown.
async fn wait_for_retry(
    delay: Duration,
    join: &mut JoinRequest,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = commands.recv() => match cmd {
                None | Some(Command::Shutdown) => return false,
                Some(Command::Reconnect) => return true,
                Some(Command::Reauthenticate(token)) => {
                    join.token = token;
                    return true;
                }
                Some(Command::Send(_)) => {}
            },
        }
    }
}

/// Park until a new credential arrives. Returns `false` on shutdown.
async fn wait_for_credential(
    join: &mut JoinRequest,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> bool {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            Command::Reauthenticate(token) => {
                join.token = token;
                return true;
            }
            Command::Shutdown => return false,
            Command::Send(_) | Command::Reconnect => {}
        }
    }
    false
}

async fn run_connection<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    client_id: Uuid,
    room: &str,
    join: &mut JoinRequest,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    tracker: &ConnectionTracker,
) -> ConnectionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    let join_frame = match SyncMessage::join(client_id, room, join).and_then(|m| m.encode()) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("Failed to encode join: {e}");
            return ConnectionEnd::Failed;
        }
    };
    if sink.send(Message::Binary(join_frame.into())).await.is_err() {
        return ConnectionEnd::Failed;
    }
    tracker.transition(ConnectionState::Connected);

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Send(bytes)) => {
                    if sink.send(Message::Binary(bytes.into())).await.is_err() {
                        return ConnectionEnd::Failed;
                    }
                }
                Some(Command::Reconnect) => {
                    let _ = sink.close().await;
                    return ConnectionEnd::Reconnect;
                }
                Some(Command::Reauthenticate(token)) => {
                    join.token = token;
                    let _ = sink.close().await;
                    return ConnectionEnd::Reconnect;
                }
                Some(Command::Shutdown) | None => {
                    let _ = sink.close().await;
                    return ConnectionEnd::Shutdown;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    let msg = match SyncMessage::decode(&bytes) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("Dropping undecodable frame: {e}");
                            continue;
                        }
                    };
                    match msg.msg_type {
                        MessageType::AuthRejected => {
                            log::warn!("Relay rejected credentials: {}", msg.rejection_reason());
                            tracker.emit(TransportEvent::AuthRejected(msg.rejection_reason()));
                            let _ = sink.close().await;
                            return ConnectionEnd::AuthRejected;
                        }
                        MessageType::Ping => {
                            if let Ok(pong) = SyncMessage::pong(client_id).encode() {
                                if sink.send(Message::Binary(pong.into())).await.is_err() {
                                    return ConnectionEnd::Failed;
                                }
                            }
                        }
                        MessageType::Pong => {}
                        MessageType::SyncStep2 => {
                            if !tracker.emit(TransportEvent::Message(msg)) {
                                return ConnectionEnd::Shutdown;
                            }
                            if tracker.current() == ConnectionState::Connected {
                                tracker.transition(ConnectionState::Synced);
                            }
                        }
                        _ => {
                            if !tracker.emit(TransportEvent::Message(msg)) {
                                return ConnectionEnd::Shutdown;
                            }
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        return ConnectionEnd::Failed;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Relay closed the connection");
                    return ConnectionEnd::Failed;
                }
                Some(Err(e)) => {
                    log::warn!("WebSocket error: {e}");
                    return ConnectionEnd::Failed;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}
