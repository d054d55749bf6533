//! Connection lifecycle state machine.
//!
//! `ReconnectController` owns the single active [`Connection`], the attempt
//! counter and the pending retry timer. It performs transport and timer side
//! effects itself and returns a [`Transition`] describing what the rest of
//! the session (heartbeat, observers) has to react to.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::retry::ReconnectPolicy;
use crate::stream::timer::{Scheduler, TimerId};
use crate::stream::transport::{ConnectionId, Transport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or stopped by the caller.
    Idle,
    Connecting,
    Open,
    /// Caller-initiated teardown in progress.
    Closing,
    /// Lost; a retry may be pending.
    Closed,
    /// Retry ceiling reached. Only `disconnect()` leaves this state.
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

/// One connection attempt. Replaced, never reused, on every attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnectionId,
    pub address: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { attempt: usize, delay: Duration },
    Exhausted,
}

/// Outcome of one controller step.
#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    /// Stale signal, or a call that is a no-op in the current state.
    Ignored,
    Connecting(ConnectionId),
    Opened(ConnectionId),
    /// The transport refused to start opening.
    OpenFailed { error: String, retry: RetryDecision },
    TransportError { message: String },
    Closed {
        code: Option<u16>,
        reason: String,
        retry: RetryDecision,
    },
    /// Caller-initiated stop; `was_open` is set when a live connection was
    /// torn down.
    Disconnected { was_open: bool },
}

#[derive(Debug)]
pub struct ReconnectController {
    address: String,
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: usize,
    connection: Option<Connection>,
    next_connection: u64,
    retry_timer: Option<TimerId>,
}

impl ReconnectController {
    pub fn new(address: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            address: address.into(),
            policy,
            state: ConnectionState::Idle,
            attempts: 0,
            connection: None,
            next_connection: 0,
            retry_timer: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive retries since the last successful open.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn has_pending_retry(&self) -> bool {
        self.retry_timer.is_some()
    }

    /// The connection id frames may be written to, if open.
    pub fn open_connection(&self) -> Option<ConnectionId> {
        match (self.state, &self.connection) {
            (ConnectionState::Open, Some(connection)) => Some(connection.id),
            _ => None,
        }
    }

    fn is_current(&self, connection: ConnectionId) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|current| current.id == connection)
    }

    /// Starts a connection attempt. No-op unless `Idle` or `Closed`.
    pub fn connect<T, S>(&mut self, transport: &mut T, scheduler: &mut S) -> Transition
    where
        T: Transport,
        S: Scheduler,
    {
        if !matches!(self.state, ConnectionState::Idle | ConnectionState::Closed) {
            debug!(event = "connect_ignored", state = self.state.as_str());
            return Transition::Ignored;
        }

        self.cancel_retry(scheduler);
        self.next_connection += 1;
        let connection = Connection {
            id: ConnectionId(self.next_connection),
            address: self.address.clone(),
        };
        self.state = ConnectionState::Connecting;
        info!(
            event = "stream_connecting",
            connection = %connection.id,
            address = %connection.address,
            attempt = self.attempts
        );

        match transport.open(connection.id, &connection.address) {
            Ok(()) => {
                let id = connection.id;
                self.connection = Some(connection);
                Transition::Connecting(id)
            }
            Err(err) => {
                warn!(
                    event = "stream_open_failed",
                    connection = %connection.id,
                    error = %err
                );
                self.state = ConnectionState::Closed;
                let retry = self.schedule_retry(scheduler);
                Transition::OpenFailed {
                    error: err.to_string(),
                    retry,
                }
            }
        }
    }

    pub fn on_open(&mut self, connection: ConnectionId) -> Transition {
        if !self.is_current(connection) || self.state != ConnectionState::Connecting {
            return Transition::Ignored;
        }
        self.state = ConnectionState::Open;
        self.attempts = 0;
        info!(event = "stream_open", %connection);
        Transition::Opened(connection)
    }

    /// Reports a transport error. The close that follows drives the state.
    pub fn on_error(&mut self, connection: ConnectionId, message: String) -> Transition {
        if !self.is_current(connection)
            || !matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Open
            )
        {
            return Transition::Ignored;
        }
        warn!(event = "stream_transport_error", %connection, error = %message);
        Transition::TransportError { message }
    }

    pub fn on_close<S: Scheduler>(
        &mut self,
        connection: ConnectionId,
        code: Option<u16>,
        reason: String,
        scheduler: &mut S,
    ) -> Transition {
        if !self.is_current(connection)
            || !matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Open
            )
        {
            return Transition::Ignored;
        }
        self.connection = None;
        self.state = ConnectionState::Closed;
        info!(event = "stream_closed", %connection, code, reason = %reason);
        let retry = self.schedule_retry(scheduler);
        Transition::Closed {
            code,
            reason,
            retry,
        }
    }

    /// Handles an elapsed timer. Returns `None` when the timer is not the
    /// pending retry.
    pub fn on_timer<T, S>(
        &mut self,
        timer: TimerId,
        transport: &mut T,
        scheduler: &mut S,
    ) -> Option<Transition>
    where
        T: Transport,
        S: Scheduler,
    {
        if self.retry_timer != Some(timer) {
            return None;
        }
        self.retry_timer = None;
        Some(self.connect(transport, scheduler))
    }

    /// Stops everything. Valid from any state except `Idle`.
    pub fn disconnect<T, S>(&mut self, transport: &mut T, scheduler: &mut S) -> Transition
    where
        T: Transport,
        S: Scheduler,
    {
        if self.state == ConnectionState::Idle {
            return Transition::Ignored;
        }
        let was_open = self.state == ConnectionState::Open;
        self.state = ConnectionState::Closing;
        self.cancel_retry(scheduler);
        if let Some(connection) = self.connection.take() {
            transport.close(connection.id);
        }
        self.attempts = 0;
        self.state = ConnectionState::Idle;
        info!(event = "stream_disconnected", was_open);
        Transition::Disconnected { was_open }
    }

    fn schedule_retry<S: Scheduler>(&mut self, scheduler: &mut S) -> RetryDecision {
        let attempt = self.attempts + 1;
        if !self.policy.allows(attempt) {
            self.state = ConnectionState::Failed;
            warn!(
                event = "stream_retries_exhausted",
                max_attempts = self.policy.max_attempts
            );
            return RetryDecision::Exhausted;
        }

        let delay = self.policy.delay_for_attempt(attempt);
        self.attempts = attempt;
        self.retry_timer = Some(scheduler.schedule(delay));
        info!(
            event = "stream_retry_scheduled",
            attempt,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64
        );
        RetryDecision::Scheduled { attempt, delay }
    }

    fn cancel_retry<S: Scheduler>(&mut self, scheduler: &mut S) {
        if let Some(timer) = self.retry_timer.take() {
            scheduler.cancel(timer);
        }
    }
}
