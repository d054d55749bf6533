//! Async handle for a telemetry stream connection.
//!
//! [`StreamClient::spawn`] starts a background worker that owns the
//! [`StreamSession`], the websocket transport and the timer tasks. Caller
//! commands, transport signals and elapsed timers are all handled on that one
//! task, so observers never run concurrently with each other or with a state
//! change.

use std::ops::ControlFlow;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::stream::config::StreamConfig;
use crate::stream::controller::ConnectionState;
use crate::stream::dispatch::{Callback, Category, ObserverId, ObserverResult};
use crate::stream::session::StreamSession;
use crate::stream::timer::TokioScheduler;
use crate::stream::transport::WsTransport;

type Session = StreamSession<WsTransport, TokioScheduler>;

/// Errors returned by [`StreamClient`] calls.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// The background worker has exited.
    #[error("stream worker stopped")]
    WorkerStopped,
}

/// Point-in-time view of the session, for status displays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    /// Consecutive retries since the last successful open.
    pub attempts: usize,
    /// Round trip of the most recent answered heartbeat.
    pub last_round_trip: Option<Duration>,
    pub pings_sent: u64,
}

enum Command {
    Connect(oneshot::Sender<()>),
    Disconnect(oneshot::Sender<()>),
    Send {
        message: Value,
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        sensor_ids: Vec<String>,
        reply: oneshot::Sender<bool>,
    },
    GetStatus(oneshot::Sender<bool>),
    On {
        category: Category,
        callback: Callback,
        reply: oneshot::Sender<ObserverId>,
    },
    Off {
        category: Category,
        id: ObserverId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running stream session.
///
/// The worker stops, closing any open connection and cancelling its timers,
/// once every `StreamClient` has been dropped or [`StreamClient::shutdown`]
/// is called. Observers run inside the worker, so a handle captured by an
/// observer would keep it alive; capture a [`WeakStreamClient`] instead.
#[derive(Clone, Debug)]
pub struct StreamClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionState>,
}

/// Non-owning handle that does not keep the worker running.
///
/// Obtained from [`StreamClient::downgrade`]; meant to be captured by
/// observers that need to talk back to the session.
#[derive(Clone, Debug)]
pub struct WeakStreamClient {
    commands: mpsc::WeakUnboundedSender<Command>,
    status: watch::Receiver<ConnectionState>,
}

impl WeakStreamClient {
    /// Returns a full handle while at least one `StreamClient` is alive.
    pub fn upgrade(&self) -> Option<StreamClient> {
        Some(StreamClient {
            commands: self.commands.upgrade()?,
            status: self.status.clone(),
        })
    }
}

impl StreamClient {
    /// Spawns the session worker on the current `tokio` runtime.
    ///
    /// The session starts `Idle`; call [`StreamClient::connect`] to open it.
    pub fn spawn(config: StreamConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionState::Idle);

        tokio::spawn(async move {
            session_worker(config, commands_rx, status_tx).await;
        });

        Self {
            commands: commands_tx,
            status: status_rx,
        }
    }

    /// Starts connecting. Resolves once the attempt has begun; observe
    /// [`Category::Connected`] or [`StreamClient::status`] for the outcome.
    pub async fn connect(&self) -> Result<(), StreamClientError> {
        self.request(Command::Connect).await
    }

    /// Closes the connection and cancels every pending timer. No retry
    /// follows. Resolves after the session is `Idle`.
    pub async fn disconnect(&self) -> Result<(), StreamClientError> {
        self.request(Command::Disconnect).await
    }

    /// Writes `message` as JSON. Returns `false` when the connection is not
    /// open; nothing is queued for later.
    pub async fn send<M: Serialize + ?Sized>(&self, message: &M) -> bool {
        let message = match serde_json::to_value(message) {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "send_encode_failed", error = %err);
                return false;
            }
        };
        self.request(|reply| Command::Send { message, reply })
            .await
            .unwrap_or(false)
    }

    /// Asks the server to stream readings for `sensor_ids`.
    pub async fn subscribe<I, Id>(&self, sensor_ids: I) -> bool
    where
        I: IntoIterator<Item = Id>,
        Id: Into<String>,
    {
        let sensor_ids = sensor_ids.into_iter().map(Into::into).collect();
        self.request(|reply| Command::Subscribe { sensor_ids, reply })
            .await
            .unwrap_or(false)
    }

    /// Requests a `system_status` message.
    pub async fn get_status(&self) -> bool {
        self.request(Command::GetStatus).await.unwrap_or(false)
    }

    /// Registers an observer. Observers run on the worker task and must not
    /// block.
    pub async fn on<F>(
        &self,
        category: Category,
        callback: F,
    ) -> Result<ObserverId, StreamClientError>
    where
        F: FnMut(&Value) -> ObserverResult + Send + 'static,
    {
        let callback: Callback = Box::new(callback);
        self.request(|reply| Command::On {
            category,
            callback,
            reply,
        })
        .await
    }

    /// Removes an observer. Returns `false` if it was not registered.
    pub async fn off(&self, category: Category, id: ObserverId) -> bool {
        self.request(|reply| Command::Off {
            category,
            id,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Last published connection state.
    pub fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    /// Receiver that observes every connection state change.
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Reads state, attempt counter and heartbeat figures in one round trip.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, StreamClientError> {
        self.request(Command::Snapshot).await
    }

    /// Returns a handle that does not keep the worker alive.
    pub fn downgrade(&self) -> WeakStreamClient {
        WeakStreamClient {
            commands: self.commands.downgrade(),
            status: self.status.clone(),
        }
    }

    /// Disconnects and stops the worker, even while other handles exist.
    ///
    /// Registered observers are dropped with the session. Later calls on any
    /// handle fail with [`StreamClientError::WorkerStopped`].
    pub async fn shutdown(&self) -> Result<(), StreamClientError> {
        self.request(Command::Shutdown).await
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, StreamClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .map_err(|_| StreamClientError::WorkerStopped)?;
        reply_rx.await.map_err(|_| StreamClientError::WorkerStopped)
    }
}

async fn session_worker(
    config: StreamConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ConnectionState>,
) {
    let (signals_tx, mut signals) = mpsc::unbounded_channel();
    let (timers_tx, mut timers) = mpsc::unbounded_channel();
    let transport = WsTransport::new(signals_tx, config.open_timeout);
    let scheduler = TokioScheduler::new(timers_tx);
    let mut session = StreamSession::new(&config, transport, scheduler);

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(command) => {
                        if handle_command(&mut session, command, &status).is_break() {
                            break;
                        }
                    }
                    None => {
                        debug!(event = "stream_handles_dropped");
                        session.disconnect();
                        publish(&status, session.state());
                        break;
                    }
                }
            }
            Some(signal) = signals.recv() => session.handle_transport(signal),
            Some(timer) = timers.recv() => session.handle_timer(timer),
        }
        publish(&status, session.state());
    }
}

fn handle_command(
    session: &mut Session,
    command: Command,
    status: &watch::Sender<ConnectionState>,
) -> ControlFlow<()> {
    match command {
        Command::Connect(reply) => {
            session.connect();
            publish(status, session.state());
            let _ = reply.send(());
        }
        Command::Disconnect(reply) => {
            session.disconnect();
            publish(status, session.state());
            let _ = reply.send(());
        }
        Command::Send { message, reply } => {
            let _ = reply.send(session.send(&message));
        }
        Command::Subscribe { sensor_ids, reply } => {
            let _ = reply.send(session.subscribe(sensor_ids));
        }
        Command::GetStatus(reply) => {
            let _ = reply.send(session.get_status());
        }
        Command::On {
            category,
            callback,
            reply,
        } => {
            let _ = reply.send(session.register(category, callback));
        }
        Command::Off {
            category,
            id,
            reply,
        } => {
            let _ = reply.send(session.off(category, id));
        }
        Command::Snapshot(reply) => {
            let heartbeat = session.heartbeat();
            let _ = reply.send(SessionSnapshot {
                state: session.state(),
                attempts: session.attempts(),
                last_round_trip: heartbeat.last_round_trip(),
                pings_sent: heartbeat.pings_sent(),
            });
        }
        Command::Shutdown(reply) => {
            debug!(event = "stream_shutdown_requested");
            session.disconnect();
            publish(status, session.state());
            let _ = reply.send(());
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

fn publish(status: &watch::Sender<ConnectionState>, state: ConnectionState) {
    status.send_if_modified(|current| {
        if *current == state {
            return false;
        }
        *current = state;
        true
    });
}
