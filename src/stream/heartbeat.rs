//! Keepalive pings for an open connection.
//!
//! Liveness is advisory: the monitor measures ping round trips but never
//! tears a connection down on its own.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::stream::timer::{Scheduler, TimerId};

/// Default period between `ping` messages.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30_000);

#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timer: Option<TimerId>,
    last_ping: Option<Instant>,
    last_round_trip: Option<Duration>,
    pings_sent: u64,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            timer: None,
            last_ping: None,
            last_round_trip: None,
            pings_sent: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    /// Whether `timer` is the currently armed heartbeat timer.
    pub fn owns(&self, timer: TimerId) -> bool {
        self.timer == Some(timer)
    }

    /// Round trip of the most recent answered ping.
    pub fn last_round_trip(&self) -> Option<Duration> {
        self.last_round_trip
    }

    pub fn pings_sent(&self) -> u64 {
        self.pings_sent
    }

    /// Arms the first ping one interval from now. Restarts if already running.
    pub fn start<S: Scheduler>(&mut self, scheduler: &mut S) {
        self.stop(scheduler);
        self.timer = Some(scheduler.schedule(self.interval));
        debug!(
            event = "heartbeat_started",
            interval_ms = self.interval.as_millis() as u64
        );
    }

    pub fn stop<S: Scheduler>(&mut self, scheduler: &mut S) {
        if let Some(timer) = self.timer.take() {
            scheduler.cancel(timer);
            debug!(event = "heartbeat_stopped");
        }
        self.last_ping = None;
    }

    /// Handles an elapsed timer.
    ///
    /// Returns `true` when `timer` was the heartbeat timer and a ping is due;
    /// the next ping is armed before returning.
    pub fn on_timer<S: Scheduler>(&mut self, timer: TimerId, scheduler: &mut S) -> bool {
        if !self.owns(timer) {
            return false;
        }
        self.timer = Some(scheduler.schedule(self.interval));
        true
    }

    /// Records that a ping went out.
    pub fn ping_sent(&mut self) {
        self.last_ping = Some(Instant::now());
        self.pings_sent += 1;
    }

    /// Records a `pong` reply.
    pub fn on_pong(&mut self) {
        match self.last_ping.take() {
            Some(sent_at) => {
                let round_trip = sent_at.elapsed();
                self.last_round_trip = Some(round_trip);
                debug!(
                    event = "heartbeat_pong",
                    round_trip_ms = round_trip.as_millis() as u64
                );
            }
            None => debug!(event = "heartbeat_unsolicited_pong"),
        }
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::HeartbeatMonitor;
    use crate::stream::testing::ManualScheduler;

    #[test]
    fn start_arms_one_timer_and_restart_replaces_it() {
        let mut scheduler = ManualScheduler::default();
        let mut heartbeat = HeartbeatMonitor::new(Duration::from_secs(30));

        heartbeat.start(&mut scheduler);
        heartbeat.start(&mut scheduler);

        assert!(heartbeat.is_running());
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.scheduled_delays(), vec![Duration::from_secs(30); 2]);
    }

    #[test]
    fn fires_every_interval_until_stopped() {
        let mut scheduler = ManualScheduler::default();
        let mut heartbeat = HeartbeatMonitor::new(Duration::from_secs(30));
        heartbeat.start(&mut scheduler);

        let mut pings = 0;
        for _ in 0..3 {
            for timer in scheduler.advance(Duration::from_secs(30)) {
                if heartbeat.on_timer(timer, &mut scheduler) {
                    pings += 1;
                }
            }
        }
        assert_eq!(pings, 3);

        heartbeat.stop(&mut scheduler);
        assert!(!heartbeat.is_running());
        assert_eq!(scheduler.pending(), 0);
        assert!(scheduler.advance(Duration::from_secs(120)).is_empty());
    }

    #[test]
    fn stale_timer_does_not_trigger_a_ping() {
        let mut scheduler = ManualScheduler::default();
        let mut heartbeat = HeartbeatMonitor::new(Duration::from_secs(30));
        heartbeat.start(&mut scheduler);
        let stale = scheduler.advance(Duration::from_secs(30));
        heartbeat.stop(&mut scheduler);
        heartbeat.start(&mut scheduler);

        for timer in stale {
            assert!(!heartbeat.on_timer(timer, &mut scheduler));
        }
    }

    #[test]
    fn pong_measures_round_trip_only_after_a_ping() {
        let mut heartbeat = HeartbeatMonitor::default();
        heartbeat.on_pong();
        assert_eq!(heartbeat.last_round_trip(), None);

        heartbeat.ping_sent();
        heartbeat.on_pong();
        assert!(heartbeat.last_round_trip().is_some());
        assert_eq!(heartbeat.pings_sent(), 1);
    }
}
