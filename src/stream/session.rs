//! Client facade over one reconnecting stream connection.
//!
//! `StreamSession` composes the reconnect controller, the heartbeat monitor
//! and the dispatcher. It performs no IO of its own: the owner feeds it
//! transport signals and elapsed timers, one at a time, and it reacts
//! synchronously. [`crate::stream::client::StreamClient`] is the `tokio`
//! owner used in production.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::stream::config::StreamConfig;
use crate::stream::controller::{ConnectionState, ReconnectController, RetryDecision, Transition};
use crate::stream::dispatch::{Callback, Category, Dispatch, Dispatcher, ObserverId, ObserverResult};
use crate::stream::heartbeat::HeartbeatMonitor;
use crate::stream::proto::ClientMessage;
use crate::stream::timer::{Scheduler, TimerId};
use crate::stream::transport::{ConnectionId, Transport, TransportEvent, TransportSignal};

/// One logical stream connection with reconnects, keepalive and observers.
///
/// Generic over the [`Transport`] that moves frames and the [`Scheduler`]
/// that arms timers, so the same state machine runs over a websocket in
/// production and over in-memory fakes in tests.
#[derive(Debug)]
pub struct StreamSession<T: Transport, S: Scheduler> {
    controller: ReconnectController,
    heartbeat: HeartbeatMonitor,
    dispatcher: Dispatcher,
    transport: T,
    scheduler: S,
}

impl<T: Transport, S: Scheduler> StreamSession<T, S> {
    /// Creates an `Idle` session. Nothing is opened until [`Self::connect`].
    pub fn new(config: &StreamConfig, transport: T, scheduler: S) -> Self {
        Self {
            controller: ReconnectController::new(config.address.clone(), config.reconnect.clone()),
            heartbeat: HeartbeatMonitor::new(config.heartbeat_interval),
            dispatcher: Dispatcher::new(),
            transport,
            scheduler,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.controller.state()
    }

    /// Consecutive reconnect attempts since the last successful open.
    pub fn attempts(&self) -> usize {
        self.controller.attempts()
    }

    /// Keepalive state, including the last measured round trip.
    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    /// Whether a retry or heartbeat timer is still armed.
    pub fn has_pending_timers(&self) -> bool {
        self.controller.has_pending_retry() || self.heartbeat.is_running()
    }

    /// Returns the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the timer scheduler.
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Returns the timer scheduler mutably, e.g. to advance a manual clock.
    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    /// Starts connecting. Returns immediately; the outcome arrives as
    /// transport signals.
    ///
    /// Ignored unless the session is `Idle` or `Closed`. A pending retry is
    /// replaced by this attempt.
    pub fn connect(&mut self) {
        let transition = self
            .controller
            .connect(&mut self.transport, &mut self.scheduler);
        self.apply(transition);
    }

    /// Stops the session: cancels timers, closes the transport, no retry.
    ///
    /// Observers get `disconnected` only if a connection was open. The
    /// session ends `Idle` with the attempt counter reset.
    pub fn disconnect(&mut self) {
        let transition = self
            .controller
            .disconnect(&mut self.transport, &mut self.scheduler);
        self.apply(transition);
    }

    /// Serializes and writes `message` if the connection is open.
    ///
    /// Returns `false` without queueing when it is not.
    pub fn send<M: Serialize + ?Sized>(&mut self, message: &M) -> bool {
        let Some(connection) = self.controller.open_connection() else {
            warn!(
                event = "send_while_not_open",
                state = self.controller.state().as_str()
            );
            return false;
        };
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "send_encode_failed", error = %err);
                return false;
            }
        };
        match self.transport.send(connection, text) {
            Ok(()) => true,
            Err(err) => {
                warn!(event = "send_failed", %connection, error = %err);
                false
            }
        }
    }

    /// Sends a `subscribe` request for `sensor_ids`.
    pub fn subscribe<I, Id>(&mut self, sensor_ids: I) -> bool
    where
        I: IntoIterator<Item = Id>,
        Id: Into<String>,
    {
        self.send(&ClientMessage::subscribe(sensor_ids))
    }

    /// Sends a `get_status` request.
    pub fn get_status(&mut self) -> bool {
        self.send(&ClientMessage::GetStatus)
    }

    /// Registers an observer for `category`.
    ///
    /// Observers of one category run in registration order. An observer
    /// that errors or panics is logged and skipped.
    pub fn on<F>(&mut self, category: Category, callback: F) -> ObserverId
    where
        F: FnMut(&Value) -> ObserverResult + Send + 'static,
    {
        self.dispatcher.on(category, callback)
    }

    pub(crate) fn register(&mut self, category: Category, callback: Callback) -> ObserverId {
        self.dispatcher.register(category, callback)
    }

    /// Removes an observer. Unknown ids are a no-op returning `false`.
    pub fn off(&mut self, category: Category, id: ObserverId) -> bool {
        self.dispatcher.off(category, id)
    }

    /// Applies one transport signal.
    ///
    /// Signals for a connection the session has already replaced are
    /// dropped.
    pub fn handle_transport(&mut self, signal: TransportSignal) {
        let TransportSignal { connection, event } = signal;
        let transition = match event {
            TransportEvent::Opened => self.controller.on_open(connection),
            TransportEvent::Frame(text) => {
                self.handle_frame(connection, &text);
                return;
            }
            TransportEvent::Error(message) => self.controller.on_error(connection, message),
            TransportEvent::Closed { code, reason } => {
                self.controller
                    .on_close(connection, code, reason, &mut self.scheduler)
            }
        };
        self.apply(transition);
    }

    /// Applies one elapsed timer: a heartbeat tick or a retry.
    pub fn handle_timer(&mut self, timer: TimerId) {
        if self.heartbeat.on_timer(timer, &mut self.scheduler) {
            if self.send(&ClientMessage::ping_now()) {
                self.heartbeat.ping_sent();
            }
            return;
        }

        match self
            .controller
            .on_timer(timer, &mut self.transport, &mut self.scheduler)
        {
            Some(transition) => self.apply(transition),
            None => debug!(event = "stale_timer_ignored", ?timer),
        }
    }

    fn handle_frame(&mut self, connection: ConnectionId, text: &str) {
        if self.controller.open_connection() != Some(connection) {
            debug!(event = "stale_frame_ignored", %connection);
            return;
        }
        if self.dispatcher.handle_frame(text) == Dispatch::Pong {
            self.heartbeat.on_pong();
        }
    }

    fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::Ignored | Transition::Connecting(_) | Transition::OpenFailed { .. } => {}
            Transition::Opened(connection) => {
                self.heartbeat.start(&mut self.scheduler);
                let payload = json!({
                    "address": self.controller.address(),
                    "connection": connection.get(),
                });
                self.dispatcher.emit(Category::Connected, &payload);
            }
            Transition::TransportError { message } => {
                self.dispatcher
                    .emit(Category::TransportError, &json!({ "message": message }));
            }
            Transition::Closed {
                code,
                reason,
                retry,
            } => {
                self.heartbeat.stop(&mut self.scheduler);
                let payload = disconnected_payload(code, &reason, retry);
                self.dispatcher.emit(Category::Disconnected, &payload);
            }
            Transition::Disconnected { was_open } => {
                self.heartbeat.stop(&mut self.scheduler);
                if was_open {
                    let payload = json!({
                        "code": 1000,
                        "reason": "client disconnect",
                        "retrying": false,
                    });
                    self.dispatcher.emit(Category::Disconnected, &payload);
                }
            }
        }
    }
}

impl<T: Transport, S: Scheduler> Drop for StreamSession<T, S> {
    fn drop(&mut self) {
        self.heartbeat.stop(&mut self.scheduler);
        self.controller
            .disconnect(&mut self.transport, &mut self.scheduler);
    }
}

fn disconnected_payload(code: Option<u16>, reason: &str, retry: RetryDecision) -> Value {
    match retry {
        RetryDecision::Scheduled { attempt, delay } => json!({
            "code": code,
            "reason": reason,
            "retrying": true,
            "attempt": attempt,
            "retry_in_ms": delay.as_millis() as u64,
        }),
        RetryDecision::Exhausted => json!({
            "code": code,
            "reason": reason,
            "retrying": false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::StreamSession;
    use crate::retry::ReconnectPolicy;
    use crate::stream::config::StreamConfig;
    use crate::stream::controller::ConnectionState;
    use crate::stream::dispatch::Category;
    use crate::stream::testing::{ManualScheduler, RecordingTransport};
    use crate::stream::transport::{TransportEvent, TransportSignal};

    type Session = StreamSession<RecordingTransport, ManualScheduler>;
    type Events = Arc<Mutex<Vec<(Category, Value)>>>;

    const HEARTBEAT: Duration = Duration::from_secs(30);
    const RETRY: Duration = Duration::from_millis(3000);

    fn session() -> Session {
        StreamSession::new(
            &StreamConfig::default(),
            RecordingTransport::default(),
            ManualScheduler::default(),
        )
    }

    fn record_all(session: &mut Session) -> Events {
        let events = Events::default();
        for category in Category::ALL {
            let events = Arc::clone(&events);
            session.on(category, move |payload: &Value| {
                events
                    .lock()
                    .expect("events lock")
                    .push((category, payload.clone()));
                Ok(())
            });
        }
        events
    }

    fn categories(events: &Events) -> Vec<Category> {
        events
            .lock()
            .expect("events lock")
            .iter()
            .map(|(category, _)| *category)
            .collect()
    }

    fn signal(session: &mut Session, event: TransportEvent) {
        let connection = session
            .transport()
            .last_opened()
            .expect("a connection was opened");
        session.handle_transport(TransportSignal { connection, event });
    }

    fn open(session: &mut Session) {
        session.connect();
        signal(session, TransportEvent::Opened);
    }

    fn close(session: &mut Session) {
        signal(
            session,
            TransportEvent::Closed {
                code: Some(1006),
                reason: "abnormal".to_string(),
            },
        );
    }

    fn advance(session: &mut Session, by: Duration) {
        let due = session.scheduler_mut().advance(by);
        for timer in due {
            session.handle_timer(timer);
        }
    }

    #[test]
    fn open_emits_connected_and_starts_heartbeat() {
        let mut session = session();
        let events = record_all(&mut session);

        open(&mut session);

        assert_eq!(session.state(), ConnectionState::Open);
        assert!(session.heartbeat().is_running());
        let events = events.lock().expect("events lock");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, Category::Connected);
        assert_eq!(events[0].1["address"], json!("ws://localhost:8081"));
    }

    #[test]
    fn heartbeat_sends_ping_every_interval_while_open() {
        let mut session = session();
        open(&mut session);

        advance(&mut session, HEARTBEAT);
        advance(&mut session, HEARTBEAT);

        let sent = session.transport().sent_texts();
        assert_eq!(sent.len(), 2);
        for text in sent {
            let ping: Value = serde_json::from_str(text).expect("ping json");
            assert_eq!(ping["type"], json!("ping"));
            assert!(ping["timestamp"].is_string());
        }
        assert_eq!(session.heartbeat().pings_sent(), 2);

        signal(&mut session, TransportEvent::Frame(r#"{"type":"pong"}"#.to_string()));
        assert!(session.heartbeat().last_round_trip().is_some());
    }

    #[test]
    fn heartbeat_stops_when_connection_is_lost() {
        let mut session = session();
        open(&mut session);
        close(&mut session);

        assert!(!session.heartbeat().is_running());
        advance(&mut session, HEARTBEAT * 4);
        assert!(session
            .transport()
            .sent_texts()
            .iter()
            .all(|text| !text.contains("\"ping\"")));
    }

    #[test]
    fn send_only_succeeds_while_open() {
        let mut session = session();
        assert!(!session.send(&json!({"type": "get_status"})));

        session.connect();
        assert!(!session.get_status());

        signal(&mut session, TransportEvent::Opened);
        assert!(session.get_status());
        assert!(session.subscribe(["WL001", "TEMP001"]));

        let sent: Vec<Value> = session
            .transport()
            .sent_texts()
            .into_iter()
            .map(|text| serde_json::from_str(text).expect("json"))
            .collect();
        assert_eq!(
            sent,
            vec![
                json!({"type": "get_status"}),
                json!({"type": "subscribe", "sensor_ids": ["WL001", "TEMP001"]}),
            ]
        );

        close(&mut session);
        assert!(!session.get_status());
        assert_eq!(session.transport().sent.len(), 2);
    }

    #[test]
    fn lost_connection_emits_disconnected_with_retry_details() {
        let mut session = session();
        let events = record_all(&mut session);
        open(&mut session);

        signal(&mut session, TransportEvent::Error("reset by peer".to_string()));
        close(&mut session);

        assert_eq!(
            categories(&events),
            vec![
                Category::Connected,
                Category::TransportError,
                Category::Disconnected
            ]
        );
        let events = events.lock().expect("events lock");
        assert_eq!(events[1].1, json!({"message": "reset by peer"}));
        assert_eq!(
            events[2].1,
            json!({
                "code": 1006,
                "reason": "abnormal",
                "retrying": true,
                "attempt": 1,
                "retry_in_ms": 3000
            })
        );
    }

    #[test]
    fn sixth_consecutive_loss_fails_without_new_timer() {
        let mut session = session();
        let events = record_all(&mut session);
        open(&mut session);

        for _ in 0..5 {
            close(&mut session);
            advance(&mut session, RETRY);
        }
        let retries = session
            .scheduler()
            .scheduled_delays()
            .into_iter()
            .filter(|delay| *delay == RETRY)
            .count();
        assert_eq!(retries, 5);

        close(&mut session);
        assert_eq!(session.state(), ConnectionState::Failed);
        assert!(!session.has_pending_timers());
        assert_eq!(session.scheduler().pending(), 0);
        assert_eq!(session.scheduler().scheduled_delays().len(), 6);

        let last = events.lock().expect("events lock").last().cloned();
        assert_eq!(
            last.map(|(_, payload)| payload["retrying"].clone()),
            Some(json!(false))
        );
    }

    #[test]
    fn reopen_after_failures_resets_attempts() {
        let mut session = session();
        open(&mut session);
        for _ in 0..3 {
            close(&mut session);
            advance(&mut session, RETRY);
        }
        assert_eq!(session.attempts(), 3);

        signal(&mut session, TransportEvent::Opened);
        assert_eq!(session.attempts(), 0);
        assert_eq!(session.state(), ConnectionState::Open);
    }

    #[test]
    fn disconnect_from_every_state_leaves_no_timers() {
        let scenarios: [(&str, fn(&mut Session)); 5] = [
            ("idle", |_: &mut Session| {}),
            ("connecting", |session: &mut Session| session.connect()),
            ("open", open),
            ("closed", |session: &mut Session| {
                open(session);
                close(session);
            }),
            ("failed", |session: &mut Session| {
                open(session);
                for _ in 0..5 {
                    close(session);
                    advance(session, RETRY);
                }
                close(session);
            }),
        ];

        for (name, setup) in scenarios {
            let mut session = session();
            setup(&mut session);
            session.disconnect();

            assert_eq!(session.state(), ConnectionState::Idle, "{name}");
            assert!(!session.has_pending_timers(), "{name}");
            assert_eq!(session.scheduler().pending(), 0, "{name}");
            assert!(
                session.scheduler_mut().advance(Duration::from_secs(600)).is_empty(),
                "{name}"
            );
        }
    }

    #[test]
    fn caller_disconnect_of_open_connection_notifies_once() {
        let mut session = session();
        let events = record_all(&mut session);
        open(&mut session);

        session.disconnect();
        session.disconnect();
        close(&mut session);

        assert_eq!(
            categories(&events),
            vec![Category::Connected, Category::Disconnected]
        );
        assert_eq!(session.transport().closed.len(), 1);
        assert_eq!(session.state(), ConnectionState::Idle);
    }

    #[test]
    fn frames_route_to_observers_in_registration_order() {
        let mut session = session();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            session.on(Category::SensorData, move |_: &Value| {
                order.lock().expect("order lock").push(label);
                Ok(())
            });
        }
        open(&mut session);

        signal(
            &mut session,
            TransportEvent::Frame(
                r#"{"type":"sensor_data","data":{"sensor_id":"WL001","value":12.3,"unit":"m"}}"#
                    .to_string(),
            ),
        );

        assert_eq!(
            *order.lock().expect("order lock"),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn frames_from_replaced_connection_are_ignored() {
        let mut session = session();
        let events = record_all(&mut session);
        open(&mut session);
        let stale = session.transport().last_opened().expect("opened");
        close(&mut session);
        advance(&mut session, RETRY);

        session.handle_transport(TransportSignal {
            connection: stale,
            event: TransportEvent::Frame(r#"{"type":"alert","data":{"title":"old"}}"#.to_string()),
        });

        assert!(!categories(&events).contains(&Category::Alert));
    }

    #[test]
    fn unknown_and_malformed_frames_change_nothing() {
        let mut session = session();
        let events = record_all(&mut session);
        open(&mut session);

        signal(&mut session, TransportEvent::Frame(r#"{"type":"unknown_kind"}"#.to_string()));
        signal(&mut session, TransportEvent::Frame("<<garbage>>".to_string()));

        assert_eq!(categories(&events), vec![Category::Connected]);
        assert_eq!(session.state(), ConnectionState::Open);
    }

    #[test]
    fn off_stops_delivery() {
        let mut session = session();
        let hits = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&hits);
        let id = session.on(Category::Alert, move |_: &Value| {
            *counter.lock().expect("hits lock") += 1;
            Ok(())
        });
        open(&mut session);

        let frame = r#"{"type":"alert","data":{"title":"t"}}"#;
        signal(&mut session, TransportEvent::Frame(frame.to_string()));
        assert!(session.off(Category::Alert, id));
        signal(&mut session, TransportEvent::Frame(frame.to_string()));

        assert_eq!(*hits.lock().expect("hits lock"), 1);
    }

    #[test]
    fn custom_policy_and_heartbeat_come_from_config() {
        let config = StreamConfig::new("ws://sensors.local:9001")
            .with_reconnect_policy(ReconnectPolicy::fixed(Duration::from_millis(500), 1))
            .with_heartbeat_interval(Duration::from_secs(5));
        let mut session = StreamSession::new(
            &config,
            RecordingTransport::default(),
            ManualScheduler::default(),
        );
        open(&mut session);
        assert_eq!(session.transport().opened[0].1, "ws://sensors.local:9001");

        advance(&mut session, Duration::from_secs(5));
        assert_eq!(session.heartbeat().pings_sent(), 1);

        close(&mut session);
        advance(&mut session, Duration::from_millis(500));
        close(&mut session);
        assert_eq!(session.state(), ConnectionState::Failed);
    }
}
