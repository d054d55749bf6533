//! Transport boundary for the stream session.
//!
//! A [`Transport`] opens, writes to and closes one text channel at a time and
//! reports what happens to it as [`TransportSignal`]s. Every signal carries
//! the [`ConnectionId`] it belongs to so the session can discard signals from
//! connections it has already replaced.

use std::fmt;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

/// Generation number of a connection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Raw lifecycle and data events reported by a transport.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    Error(String),
    /// Always the last event of a connection, including after a failed open.
    Closed {
        code: Option<u16>,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransportSignal {
    pub connection: ConnectionId,
    pub event: TransportEvent,
}

/// Errors produced synchronously by a transport call.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket request or protocol error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// The addressed connection is not the active one.
    #[error("connection {0} is not open")]
    NotOpen(ConnectionId),

    /// The connection worker has already stopped.
    #[error("transport channel is closed")]
    ChannelClosed,
}

/// Bidirectional text channel driven by the session.
pub trait Transport {
    /// Starts opening a connection; completion is reported asynchronously.
    fn open(&mut self, connection: ConnectionId, address: &str) -> Result<(), TransportError>;

    /// Queues one text frame on an open connection.
    fn send(&mut self, connection: ConnectionId, text: String) -> Result<(), TransportError>;

    /// Requests the connection be closed. Unknown ids are ignored.
    fn close(&mut self, connection: ConnectionId);
}

enum SocketCommand {
    Send(String),
    Close,
}

struct ActiveSocket {
    connection: ConnectionId,
    commands: mpsc::UnboundedSender<SocketCommand>,
    task: JoinHandle<()>,
}

/// Websocket transport backed by `tokio-tungstenite`.
///
/// Each connection is owned by a background task; signals are posted to the
/// channel given at construction.
#[derive(Debug)]
pub struct WsTransport {
    signals: mpsc::UnboundedSender<TransportSignal>,
    open_timeout: Duration,
    active: Option<ActiveSocket>,
}

impl fmt::Debug for ActiveSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSocket")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl WsTransport {
    pub fn new(signals: mpsc::UnboundedSender<TransportSignal>, open_timeout: Duration) -> Self {
        Self {
            signals,
            open_timeout,
            active: None,
        }
    }
}

impl Transport for WsTransport {
    fn open(&mut self, connection: ConnectionId, address: &str) -> Result<(), TransportError> {
        let request = address.into_client_request()?;

        if let Some(previous) = self.active.take() {
            let _ = previous.commands.send(SocketCommand::Close);
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let signals = self.signals.clone();
        let open_timeout = self.open_timeout;
        let task = tokio::spawn(async move {
            socket_worker(connection, request, open_timeout, commands_rx, signals).await;
        });

        self.active = Some(ActiveSocket {
            connection,
            commands: commands_tx,
            task,
        });
        Ok(())
    }

    fn send(&mut self, connection: ConnectionId, text: String) -> Result<(), TransportError> {
        let Some(active) = self
            .active
            .as_ref()
            .filter(|active| active.connection == connection)
        else {
            return Err(TransportError::NotOpen(connection));
        };
        active
            .commands
            .send(SocketCommand::Send(text))
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn close(&mut self, connection: ConnectionId) {
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.connection == connection)
        {
            if let Some(active) = self.active.take() {
                if active.commands.send(SocketCommand::Close).is_err() {
                    active.task.abort();
                }
            }
        }
    }
}

async fn socket_worker(
    connection: ConnectionId,
    request: Request,
    open_timeout: Duration,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    signals: mpsc::UnboundedSender<TransportSignal>,
) {
    let emit = |event: TransportEvent| {
        let _ = signals.send(TransportSignal { connection, event });
    };

    let handshake = tokio::time::timeout(open_timeout, connect_async(request));
    tokio::pin!(handshake);
    let outcome = loop {
        tokio::select! {
            outcome = &mut handshake => break outcome,
            command = commands.recv() => {
                match command {
                    Some(SocketCommand::Send(_)) => {
                        debug!(event = "send_before_open_dropped", %connection);
                    }
                    Some(SocketCommand::Close) | None => {
                        debug!(event = "stream_open_abandoned", %connection);
                        emit(TransportEvent::Closed {
                            code: None,
                            reason: "closed by client".to_string(),
                        });
                        return;
                    }
                }
            }
        }
    };

    let mut socket = match outcome {
        Ok(Ok((socket, _))) => socket,
        Ok(Err(err)) => {
            emit(TransportEvent::Error(err.to_string()));
            emit(TransportEvent::Closed {
                code: None,
                reason: "connect failed".to_string(),
            });
            return;
        }
        Err(_) => {
            emit(TransportEvent::Error(format!(
                "connect timed out after {}ms",
                open_timeout.as_millis()
            )));
            emit(TransportEvent::Closed {
                code: None,
                reason: "connect timed out".to_string(),
            });
            return;
        }
    };
    emit(TransportEvent::Opened);

    let (code, reason) = loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(SocketCommand::Send(text)) => {
                        if let Err(err) = socket.send(Message::Text(text.into())).await {
                            emit(TransportEvent::Error(err.to_string()));
                            break (None, "send failed".to_string());
                        }
                    }
                    Some(SocketCommand::Close) | None => {
                        let _ = socket.close(None).await;
                        break (Some(1000), "closed by client".to_string());
                    }
                }
            }
            inbound = socket.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        emit(TransportEvent::Frame(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            emit(TransportEvent::Error(err.to_string()));
                            break (None, "pong failed".to_string());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => (
                                Some(u16::from(frame.code)),
                                frame.reason.as_str().to_owned(),
                            ),
                            None => (None, "closed by server".to_string()),
                        };
                    }
                    Some(Ok(_)) => {
                        debug!(event = "non_text_frame_ignored", %connection);
                    }
                    Some(Err(err)) => {
                        emit(TransportEvent::Error(err.to_string()));
                        break (None, "receive failed".to_string());
                    }
                    None => break (None, "stream ended".to_string()),
                }
            }
        }
    };

    emit(TransportEvent::Closed { code, reason });
}
