//! Request context management
//!
//! This module provides the [`Request`] record that holds per-request state
//! from connection accept until the response has been transmitted. It is
//! owned by the lifecycle driver for the whole duration of the request.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{body::PayloadStream, response::Response, Boom};
use crate::{lifecycle::auth::AuthMode, route::Route, utils::request as req_utils};

/// Lifecycle states a request moves through, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Idle,
    Routed,
    Authenticated,
    Validated,
    Prerequisites,
    Handled,
    PreResponse,
    Transmitting,
    Done,
}

/// Timing and connection metadata
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub received: Instant,
    pub host: Option<String>,
    pub remote_addr: Option<SocketAddr>,
    pub status: Option<StatusCode>,
    markers: Vec<(Stage, Duration)>,
}

impl RequestInfo {
    fn new(host: Option<String>) -> Self {
        Self {
            received: Instant::now(),
            host,
            remote_addr: None,
            status: None,
            markers: vec![(Stage::Idle, Duration::ZERO)],
        }
    }

    /// Records the elapsed time at which `stage` was entered.
    pub fn mark(&mut self, stage: Stage) {
        self.markers.push((stage, self.received.elapsed()));
    }

    pub fn marker(&self, stage: Stage) -> Option<Duration> {
        self.markers
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, elapsed)| *elapsed)
    }

    /// The most recently entered stage.
    pub fn stage(&self) -> Stage {
        self.markers.last().map_or(Stage::Idle, |(s, _)| *s)
    }

    pub fn markers(&self) -> &[(Stage, Duration)] {
        &self.markers
    }
}

/// Authentication outcome for one request
#[derive(Debug, Clone, Default)]
pub struct AuthInfo {
    pub is_authenticated: bool,
    pub is_injected: bool,
    pub mode: Option<AuthMode>,
    pub strategy: Option<String>,
    pub credentials: Option<JsonValue>,
    pub error: Option<String>,
}

/// Cancellation observer that can be moved into detached work
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A log entry recorded against a request
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub tags: Vec<String>,
    pub data: JsonValue,
    pub elapsed: Duration,
}

/// Per-request state and metadata
pub struct Request {
    pub id: String,
    pub method: Method,
    pub headers: HeaderMap,

    /// Parameters extracted from the route template
    pub params: BTreeMap<String, String>,

    pub query: BTreeMap<String, String>,

    /// Parsed payload (objects for JSON and forms, strings for text)
    pub payload: Option<JsonValue>,

    pub raw_payload: Option<Bytes>,

    pub auth: AuthInfo,

    /// Prerequisite results keyed by assignment name
    pub pre: HashMap<String, JsonValue>,

    /// Response in progress, visible from onPostHandler onwards
    pub response: Option<Response>,

    pub info: RequestInfo,

    uri: Uri,
    pub(crate) route: Option<Arc<Route>>,
    payload_stream: Mutex<Option<PayloadStream>>,

    /// Custom variables available to extensions (type-erased, thread-safe)
    vars: HashMap<String, Box<dyn Any + Send + Sync>>,

    logs: Vec<RequestLog>,
    cancellation: Cancellation,
    finished: Arc<AtomicBool>,
}

impl Request {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        let host = req_utils::get_request_host(&uri, &headers).map(|h| h.to_ascii_lowercase());
        let query = req_utils::parse_query(uri.query());

        Self {
            id: Uuid::new_v4().to_string(),
            method,
            headers,
            params: BTreeMap::new(),
            query,
            payload: None,
            raw_payload: None,
            auth: AuthInfo::default(),
            pre: HashMap::new(),
            response: None,
            info: RequestInfo::new(host),
            uri,
            route: None,
            payload_stream: Mutex::new(None),
            vars: HashMap::new(),
            logs: Vec::new(),
            cancellation: Cancellation::default(),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn host(&self) -> Option<&str> {
        self.info.host.as_deref()
    }

    /// Rewrites the request URL. Only meaningful before routing (onRequest).
    pub fn set_url(&mut self, url: &str) -> Result<(), Boom> {
        let uri: Uri = url
            .parse()
            .map_err(|e| Boom::bad_request(format!("Invalid URL: {e}")))?;
        self.query = req_utils::parse_query(uri.query());
        if let Some(host) = uri.host() {
            self.info.host = Some(host.to_ascii_lowercase());
        }
        self.uri = uri;
        Ok(())
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Retrieves a header value as a string slice.
    pub fn header(&self, name: &str) -> Option<&str> {
        req_utils::get_header_value(&self.headers, name)
    }

    /// The matched route, once routing has happened.
    pub fn route(&self) -> Option<&Arc<Route>> {
        self.route.as_ref()
    }

    /// Store a typed value into the request
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.vars.insert(key.into(), Box::new(value));
    }

    /// Get a typed reference from the request
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.vars.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Get a string slice if the stored value is a `String`
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get::<String>(key).map(|s| s.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Box<dyn Any + Send + Sync>> {
        self.vars.remove(key)
    }

    pub fn log(&mut self, tags: &[&str], data: JsonValue) {
        log::debug!("request {} log {:?}: {}", self.id, tags, data);
        self.logs.push(RequestLog {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            data,
            elapsed: self.info.received.elapsed(),
        });
    }

    pub fn logs(&self) -> &[RequestLog] {
        &self.logs
    }

    /// Takes the raw payload stream of a route configured with stream output.
    pub fn take_payload_stream(&self) -> Option<PayloadStream> {
        self.payload_stream
            .lock()
            .map(|mut guard| guard.take())
            .unwrap_or(None)
    }

    pub(crate) fn set_payload_stream(&self, stream: PayloadStream) {
        if let Ok(mut guard) = self.payload_stream.lock() {
            *guard = Some(stream);
        }
    }

    /// Handle that observes whether this request was cancelled.
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub(crate) fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Claims the single response slot. Returns false if it was already taken.
    pub(crate) fn mark_finished(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}
