//! In-memory transport and manual clock for driving sessions in unit tests.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::stream::timer::{Scheduler, TimerId};
use crate::stream::transport::{ConnectionId, Transport, TransportError};

/// Scheduler driven by [`ManualScheduler::advance`] instead of wall time.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    now: Duration,
    next_id: u64,
    pending: BTreeMap<TimerId, Duration>,
    scheduled: Vec<Duration>,
}

impl ManualScheduler {
    /// Moves the clock forward and returns the timers that elapsed, in
    /// deadline order. Returned timers are no longer pending.
    pub fn advance(&mut self, by: Duration) -> Vec<TimerId> {
        self.now += by;
        let mut due: Vec<(Duration, TimerId)> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= self.now)
            .map(|(timer, deadline)| (*deadline, *timer))
            .collect();
        due.sort();
        for (_, timer) in &due {
            self.pending.remove(timer);
        }
        due.into_iter().map(|(_, timer)| timer).collect()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Delays of every timer ever scheduled, in scheduling order.
    pub fn scheduled_delays(&self) -> Vec<Duration> {
        self.scheduled.clone()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&mut self, delay: Duration) -> TimerId {
        self.next_id += 1;
        let timer = TimerId(self.next_id);
        self.pending.insert(timer, self.now + delay);
        self.scheduled.push(delay);
        timer
    }

    fn cancel(&mut self, timer: TimerId) {
        self.pending.remove(&timer);
    }
}

/// Transport that records calls and never touches the network.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub opened: Vec<(ConnectionId, String)>,
    pub sent: Vec<(ConnectionId, String)>,
    pub closed: Vec<ConnectionId>,
    /// Number of upcoming `open` calls that fail synchronously.
    pub fail_opens: usize,
}

impl RecordingTransport {
    pub fn last_opened(&self) -> Option<ConnectionId> {
        self.opened.last().map(|(connection, _)| *connection)
    }

    pub fn sent_texts(&self) -> Vec<&str> {
        self.sent.iter().map(|(_, text)| text.as_str()).collect()
    }
}

impl Transport for RecordingTransport {
    fn open(&mut self, connection: ConnectionId, address: &str) -> Result<(), TransportError> {
        if self.fail_opens > 0 {
            self.fail_opens -= 1;
            return Err(TransportError::ChannelClosed);
        }
        self.opened.push((connection, address.to_string()));
        Ok(())
    }

    fn send(&mut self, connection: ConnectionId, text: String) -> Result<(), TransportError> {
        self.sent.push((connection, text));
        Ok(())
    }

    fn close(&mut self, connection: ConnectionId) {
        self.closed.push(connection);
    }
}
