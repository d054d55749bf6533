//! Inbound frame classification and observer fan-out.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::stream::proto::{InboundMessage, MessageKind};

/// Event categories observers can register for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    SensorData,
    Alert,
    SystemStatus,
    Connected,
    Disconnected,
    TransportError,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::SensorData,
        Category::Alert,
        Category::SystemStatus,
        Category::Connected,
        Category::Disconnected,
        Category::TransportError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SensorData => "sensor-data",
            Self::Alert => "alert",
            Self::SystemStatus => "system-status",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::TransportError => "transport-error",
        }
    }

    /// Category that receives the payload of a message kind, if any.
    pub fn for_kind(kind: MessageKind) -> Option<Self> {
        match kind {
            MessageKind::SensorData => Some(Self::SensorData),
            MessageKind::Alert => Some(Self::Alert),
            MessageKind::SystemStatus => Some(Self::SystemStatus),
            MessageKind::Pong | MessageKind::Welcome | MessageKind::Unknown => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown event category `{0}`")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == value)
            .ok_or_else(|| UnknownCategory(value.to_string()))
    }
}

/// Error an observer may return; it is logged and otherwise ignored.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

pub type ObserverResult = Result<(), ObserverError>;

pub(crate) type Callback = Box<dyn FnMut(&Value) -> ObserverResult + Send>;

/// Handle identifying one registration, used to remove it again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

/// What happened to one inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Dispatch {
    /// Undecodable frame, dropped.
    Dropped,
    /// Payload handed to `observers` callbacks of `category`.
    Delivered { category: Category, observers: usize },
    Pong,
    Welcome,
    Unknown { type_name: String },
}

/// Ordered observer lists keyed by [`Category`].
#[derive(Default)]
pub struct Dispatcher {
    observers: HashMap<Category, Vec<(ObserverId, Callback)>>,
    next_id: u64,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for category in Category::ALL {
            map.entry(&category.as_str(), &self.observer_count(category));
        }
        map.finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an observer; observers run in registration order.
    pub fn on<F>(&mut self, category: Category, callback: F) -> ObserverId
    where
        F: FnMut(&Value) -> ObserverResult + Send + 'static,
    {
        self.register(category, Box::new(callback))
    }

    pub(crate) fn register(&mut self, category: Category, callback: Callback) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.observers
            .entry(category)
            .or_default()
            .push((id, callback));
        id
    }

    /// Removes the first registration matching `id`. Returns whether one was
    /// removed.
    pub fn off(&mut self, category: Category, id: ObserverId) -> bool {
        let Some(list) = self.observers.get_mut(&category) else {
            return false;
        };
        match list.iter().position(|(registered, _)| *registered == id) {
            Some(index) => {
                drop(list.remove(index));
                true
            }
            None => false,
        }
    }

    pub fn observer_count(&self, category: Category) -> usize {
        self.observers.get(&category).map_or(0, Vec::len)
    }

    /// Invokes every observer of `category` with `payload`.
    ///
    /// A failing or panicking observer is logged and skipped. Returns the
    /// number of observers invoked.
    pub fn emit(&mut self, category: Category, payload: &Value) -> usize {
        let Some(list) = self.observers.get_mut(&category) else {
            return 0;
        };
        for (id, callback) in list.iter_mut() {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    event = "observer_failed",
                    %category,
                    observer = id.0,
                    error = %err
                ),
                Err(_) => warn!(event = "observer_panicked", %category, observer = id.0),
            }
        }
        list.len()
    }

    /// Decodes, classifies and fans out one inbound text frame.
    pub fn handle_frame(&mut self, raw: &str) -> Dispatch {
        let message = match InboundMessage::from_text(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "frame_dropped", error = %err, frame_len = raw.len());
                return Dispatch::Dropped;
            }
        };

        if let Some(category) = Category::for_kind(message.kind) {
            let observers = self.emit(category, &message.payload);
            debug!(event = "frame_dispatched", %category, observers);
            return Dispatch::Delivered {
                category,
                observers,
            };
        }

        match message.kind {
            MessageKind::Pong => Dispatch::Pong,
            MessageKind::Welcome => {
                let greeting = message.payload.get("message").and_then(Value::as_str);
                debug!(event = "server_welcome", greeting = greeting.unwrap_or_default());
                Dispatch::Welcome
            }
            _ => {
                debug!(event = "frame_unknown_type", type_name = %message.type_name);
                Dispatch::Unknown {
                    type_name: message.type_name,
                }
            }
        }
    }
}
