//! In-process request injection, for tests and tooling.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{header::CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use serde_json::Value as JsonValue;

use super::Server;
use crate::{
    core::{Body, ServerError, ServerResult},
    lifecycle::{transmit::Outbound, Incoming},
    utils::response::content_type::APPLICATION_JSON,
};

/// A simulated request
#[derive(Debug, Clone)]
pub struct InjectOptions {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub payload: Option<Bytes>,
    /// Resolved credentials that skip authentication
    pub credentials: Option<JsonValue>,
    pub remote: SocketAddr,
}

impl InjectOptions {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            payload: None,
            credentials: None,
            remote: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Sends a JSON payload, setting the content type unless one is given.
    pub fn json(mut self, value: &JsonValue) -> Self {
        if !self
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case(CONTENT_TYPE.as_str()))
        {
            self.headers
                .push((CONTENT_TYPE.to_string(), APPLICATION_JSON.to_string()));
        }
        self.payload = Some(Bytes::from(value.to_string()));
        self
    }

    pub fn credentials(mut self, credentials: JsonValue) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn remote(mut self, remote: SocketAddr) -> Self {
        self.remote = remote;
        self
    }

    fn into_incoming(self) -> ServerResult<Incoming> {
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| ServerError::Configuration(format!("invalid method {}: {e}", self.method)))?;
        let uri: Uri = self
            .url
            .parse()
            .map_err(|e| ServerError::Configuration(format!("invalid url {}: {e}", self.url)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ServerError::Configuration(format!("invalid header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ServerError::Configuration(format!("invalid header value: {e}")))?;
            headers.append(name, value);
        }

        let mut incoming = Incoming::new(method, uri);
        incoming.headers = headers;
        incoming.body = self.payload.map_or(Body::Empty, Body::Full);
        incoming.remote_addr = Some(self.remote);
        incoming.credentials = self.credentials;
        Ok(incoming)
    }
}

impl From<&str> for InjectOptions {
    fn from(url: &str) -> Self {
        InjectOptions::new("GET", url)
    }
}

/// What the simulated client received
#[derive(Debug)]
pub struct InjectResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub raw_payload: Bytes,
    pub payload: String,
    /// Set when transmission was cut short
    pub aborted: Option<String>,
}

impl InjectResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json(&self) -> Option<JsonValue> {
        serde_json::from_slice(&self.raw_payload).ok()
    }
}

#[derive(Default)]
struct Collector {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    aborted: Option<String>,
}

#[async_trait]
impl Outbound for Collector {
    async fn head(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()> {
        self.status = Some(status);
        self.headers = headers.clone();
        Ok(())
    }

    async fn chunk(&mut self, data: Bytes) -> io::Result<()> {
        self.body.extend_from_slice(&data);
        Ok(())
    }

    async fn end(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn abort(&mut self, reason: &str) {
        self.aborted = Some(reason.to_string());
    }
}

impl Server {
    /// Runs a simulated request through the full lifecycle without a socket.
    ///
    /// # Errors
    /// Returns `Configuration` when the server is not initialized or the
    /// options do not form a valid request.
    pub async fn inject(&self, options: impl Into<InjectOptions>) -> ServerResult<InjectResponse> {
        self.inject_incoming(options.into().into_incoming()?).await
    }

    /// Like [`Server::inject`], for a prepared request such as one with a
    /// streaming body.
    pub async fn inject_incoming(&self, incoming: Incoming) -> ServerResult<InjectResponse> {
        let mut collector = Collector::default();
        let outcome = self.dispatch(incoming, &mut collector).await?;

        let raw_payload = collector.body.freeze();
        Ok(InjectResponse {
            status: collector.status.unwrap_or(outcome.status),
            headers: collector.headers,
            payload: String::from_utf8_lossy(&raw_payload).into_owned(),
            raw_payload,
            aborted: collector.aborted,
        })
    }
}
