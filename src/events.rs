//! Server event fan-in.
//!
//! The server owns one subscription list; every component emits through it.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use http::StatusCode;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Route,
    Start,
    Stop,
    Response,
    RequestError,
    Log,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// A route was added to the server
    Route {
        method: String,
        path: String,
        vhost: Vec<String>,
        plugin: Option<String>,
    },
    Start,
    Stop,
    /// A request finished transmitting
    Response {
        id: String,
        method: String,
        path: String,
        status: StatusCode,
        elapsed: Duration,
        failed: bool,
    },
    /// A request produced a 5xx error
    RequestError {
        id: String,
        status: StatusCode,
        message: String,
    },
    Log {
        tags: Vec<String>,
        data: JsonValue,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Route { .. } => EventKind::Route,
            Event::Start => EventKind::Start,
            Event::Stop => EventKind::Stop,
            Event::Response { .. } => EventKind::Response,
            Event::RequestError { .. } => EventKind::RequestError,
            Event::Log { .. } => EventKind::Log,
        }
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Events {
    listeners: Arc<RwLock<Vec<(Option<EventKind>, Listener)>>>,
}

impl Events {
    /// Subscribes to one kind of event.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(Some(kind), Arc::new(listener));
    }

    /// Subscribes to every event.
    pub fn on_any<F>(&self, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(None, Arc::new(listener));
    }

    fn subscribe(&self, kind: Option<EventKind>, listener: Listener) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push((kind, listener)),
            Err(e) => log::error!("Event listener list poisoned: {e}"),
        }
    }

    pub fn emit(&self, event: &Event) {
        let listeners: Vec<Listener> = match self.listeners.read() {
            Ok(listeners) => listeners
                .iter()
                .filter(|(kind, _)| kind.map_or(true, |k| k == event.kind()))
                .map(|(_, l)| l.clone())
                .collect(),
            Err(e) => {
                log::error!("Event listener list poisoned: {e}");
                return;
            }
        };

        for listener in listeners {
            listener(event);
        }
    }
}
