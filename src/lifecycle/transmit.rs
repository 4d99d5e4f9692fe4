//! Response marshalling and transmission.
//!
//! [`Transmitter::prepare`] turns a [`Response`] into a status, validated
//! headers and a body, negotiating the content encoding. [`Transmitter::send`]
//! drains it onto an [`Outbound`] channel, awaiting every write so a slow
//! peer slows the source down. Every transmission ends with exactly one
//! `end` or `abort`.

use std::{future::Future, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};

use crate::{
    config::{CachePrivacy, CacheSettings, RouteSettings},
    core::{Boom, Encoder, ErrorKind, PayloadStream, Request, Response, Source, TimeoutKind},
    utils::{
        request::parse_weighted_list,
        response::{content_type, is_compressible, validate_header},
    },
    views::TemplateEngine,
};

const DEFAULT_CACHE_STATUSES: [u16; 2] = [200, 204];

/// The outbound half of a connection
#[async_trait]
pub trait Outbound: Send {
    async fn head(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()>;

    async fn chunk(&mut self, data: Bytes) -> io::Result<()>;

    async fn end(&mut self) -> io::Result<()>;

    /// Terminates the response early; the peer sees a truncated body.
    fn abort(&mut self, reason: &str);
}

pub(crate) enum Payload {
    Empty,
    Full(Bytes),
    Stream(PayloadStream),
}

impl Payload {
    fn into_stream(self) -> PayloadStream {
        match self {
            Payload::Empty => Box::pin(stream::empty()),
            Payload::Full(bytes) => Box::pin(stream::iter(vec![Ok(bytes)])),
            Payload::Stream(s) => s,
        }
    }
}

/// A response ready to be written
pub(crate) struct Prepared {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub payload: Payload,
}

/// What happened on the wire
#[derive(Debug)]
pub struct TransmitOutcome {
    pub status: StatusCode,
    pub bytes: usize,
    /// Set when the body could not be fully delivered
    pub error: Option<Boom>,
}

pub struct Transmitter {
    encoders: Vec<(String, Arc<dyn Encoder>)>,
    views: Option<Arc<dyn TemplateEngine>>,
    min_bytes: usize,
    expose: bool,
}

impl Transmitter {
    pub fn new(
        encoders: Vec<(String, Arc<dyn Encoder>)>,
        views: Option<Arc<dyn TemplateEngine>>,
        min_bytes: usize,
        expose: bool,
    ) -> Self {
        Self {
            encoders,
            views,
            min_bytes,
            expose,
        }
    }

    /// Marshals a response. A response that cannot be marshalled (invalid
    /// header, failed view) is replaced with the matching error response.
    pub(crate) fn prepare(
        &self,
        response: Response,
        req: &Request,
        route: Option<&RouteSettings>,
    ) -> Prepared {
        let boom = match self.try_prepare(response, req, route) {
            Ok(prepared) => return prepared,
            Err(boom) => boom,
        };

        log::warn!("request {} response rejected: {boom}", req.id);
        let replacement = Response::from_boom(boom.clone(), self.expose);
        match self.try_prepare(replacement, req, route) {
            Ok(prepared) => prepared,
            Err(_) => self.bare(&boom),
        }
    }

    fn bare(&self, boom: &Boom) -> Prepared {
        let body = Bytes::from(boom.envelope(self.expose).to_string());
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(content_type::APPLICATION_JSON),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        Prepared {
            status: boom.status(),
            headers,
            payload: Payload::Full(body),
        }
    }

    fn try_prepare(
        &self,
        response: Response,
        req: &Request,
        route: Option<&RouteSettings>,
    ) -> Result<Prepared, Boom> {
        let parts = response.into_parts();
        let status = parts.status;

        let mut headers = HeaderMap::new();
        for (name, value) in &parts.headers {
            let (name, value) = validate_header(name, value).map_err(Boom::bad_request)?;
            headers.append(name, value);
        }

        let (mut payload, default_type) = match parts.source {
            Source::Empty => (Payload::Empty, None),
            Source::Value(value) => {
                let body = serde_json::to_vec(&value)
                    .map_err(|e| Boom::internal(format!("Cannot serialize response: {e}")))?;
                (Payload::Full(body.into()), Some(content_type::APPLICATION_JSON))
            }
            Source::Text(text) => (Payload::Full(text.into()), Some(content_type::TEXT_HTML)),
            Source::Bytes(bytes) => (Payload::Full(bytes), Some(content_type::OCTET_STREAM)),
            Source::Stream(s) => (Payload::Stream(s), Some(content_type::OCTET_STREAM)),
            Source::View { template, context } => {
                let engine = self
                    .views
                    .as_ref()
                    .ok_or_else(|| Boom::internal("Cannot render view without a view manager"))?;
                let html = engine
                    .render(&template, &context)
                    .map_err(|e| Boom::internal(e.to_string()))?;
                (Payload::Full(html.into()), Some(content_type::TEXT_HTML))
            }
        };

        match parts.content_type {
            Some(ct) => {
                let (_, value) = validate_header("content-type", &ct).map_err(Boom::bad_request)?;
                headers.insert(header::CONTENT_TYPE, value);
            }
            None => {
                if let Some(ct) = default_type.filter(|_| !headers.contains_key(header::CONTENT_TYPE)) {
                    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(ct));
                }
            }
        }

        if !headers.contains_key(header::CACHE_CONTROL) {
            let value = cache_control(status, parts.ttl, route.and_then(|r| r.cache.as_ref()));
            let value = HeaderValue::from_str(&value).map_err(|e| Boom::internal(e.to_string()))?;
            headers.insert(header::CACHE_CONTROL, value);
        }

        if let Some(security) = route.and_then(|r| r.security.as_ref()) {
            for (name, value) in security.headers() {
                if !headers.contains_key(name) {
                    let (name, value) = validate_header(name, &value).map_err(Boom::internal)?;
                    headers.insert(name, value);
                }
            }
        }

        if !self.encoders.is_empty() {
            let varies = headers
                .get_all(header::VARY)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| v.to_ascii_lowercase().contains("accept-encoding"));
            if !varies {
                headers.append(header::VARY, HeaderValue::from_static("accept-encoding"));
            }
        }

        let no_body = req.method == Method::HEAD
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;

        let compressible = parts.compressible.unwrap_or(true)
            && route.map_or(true, |r| r.compression)
            && !no_body
            && !headers.contains_key(header::CONTENT_ENCODING)
            && headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map_or(false, is_compressible)
            && match &payload {
                Payload::Empty => false,
                Payload::Full(bytes) => bytes.len() >= self.min_bytes,
                Payload::Stream(_) => true,
            };

        if compressible {
            if let Some((name, encoder)) = self.negotiate(req.header(header::ACCEPT_ENCODING.as_str())) {
                let (_, value) = validate_header("content-encoding", name).map_err(Boom::internal)?;
                headers.insert(header::CONTENT_ENCODING, value);
                payload = Payload::Stream(encoder.encode(payload.into_stream()));
            }
        }

        if status != StatusCode::NO_CONTENT && status != StatusCode::NOT_MODIFIED {
            match &payload {
                Payload::Full(bytes) => {
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
                }
                Payload::Empty => {
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0usize));
                }
                Payload::Stream(_) => {}
            }
        }

        if no_body {
            payload = Payload::Empty;
        }

        Ok(Prepared {
            status,
            headers,
            payload,
        })
    }

    /// Picks the registered encoder with the highest client weight. Ties go
    /// to the encoder registered first.
    fn negotiate(&self, accept: Option<&str>) -> Option<(&str, &Arc<dyn Encoder>)> {
        let prefs = parse_weighted_list(accept?);
        let weight = |name: &str| {
            prefs
                .iter()
                .find(|(token, _)| token == name)
                .or_else(|| prefs.iter().find(|(token, _)| token == "*"))
                .map(|(_, q)| *q)
        };

        let mut best: Option<(f32, usize)> = None;
        for (idx, (name, _)) in self.encoders.iter().enumerate() {
            if let Some(q) = weight(name) {
                if q > 0.0 && best.map_or(true, |(bq, _)| q > bq) {
                    best = Some((q, idx));
                }
            }
        }

        best.map(|(_, idx)| {
            let (name, encoder) = &self.encoders[idx];
            (name.as_str(), encoder)
        })
    }

    /// Writes a prepared response, bounding every write (and every wait on
    /// a streaming source) by the socket timeout.
    pub(crate) async fn send(
        &self,
        prepared: Prepared,
        out: &mut dyn Outbound,
        socket_timeout: Option<Duration>,
    ) -> TransmitOutcome {
        let status = prepared.status;
        let mut bytes = 0;

        let result = async {
            guarded(socket_timeout, out.head(status, &prepared.headers)).await?;

            match prepared.payload {
                Payload::Empty => {}
                Payload::Full(body) => {
                    bytes = body.len();
                    if !body.is_empty() {
                        guarded(socket_timeout, out.chunk(body)).await?;
                    }
                }
                Payload::Stream(mut source) => loop {
                    let next = guarded(socket_timeout, async { Ok(source.next().await) }).await?;
                    match next {
                        None => break,
                        Some(Ok(chunk)) if chunk.is_empty() => {}
                        Some(Ok(chunk)) => {
                            bytes += chunk.len();
                            guarded(socket_timeout, out.chunk(chunk)).await?;
                        }
                        Some(Err(e)) => return Err(e),
                    }
                },
            }

            guarded(socket_timeout, out.end()).await
        }
        .await;

        let error = match result {
            Ok(()) => None,
            Err(e) => {
                log::warn!("response transmission failed after {bytes} bytes: {e}");
                out.abort(&e.to_string());
                Some(transmission_error(&e))
            }
        };

        TransmitOutcome {
            status,
            bytes,
            error,
        }
    }
}

async fn guarded<F, T>(limit: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "socket timeout"))),
    }
}

fn transmission_error(e: &io::Error) -> Boom {
    if e.kind() == io::ErrorKind::TimedOut {
        Boom::internal("Socket timeout").with_kind(ErrorKind::Timeout(TimeoutKind::Socket))
    } else {
        Boom::internal(format!("Stream transmission failed: {e}"))
            .with_kind(ErrorKind::StreamTransmissionFailed)
    }
}

fn cache_control(status: StatusCode, ttl: Option<Duration>, cache: Option<&CacheSettings>) -> String {
    let statuses = cache
        .map(|c| c.statuses.as_slice())
        .unwrap_or(&DEFAULT_CACHE_STATUSES);
    if !statuses.contains(&status.as_u16()) {
        return "no-cache".to_string();
    }

    match ttl.or_else(|| cache.map(|c| c.expires_in)) {
        Some(ttl) => {
            let privacy = match cache.map(|c| c.privacy).unwrap_or_default() {
                CachePrivacy::Default => "",
                CachePrivacy::Public => ", public",
                CachePrivacy::Private => ", private",
            };
            format!("max-age={}, must-revalidate{privacy}", ttl.as_secs())
        }
        None => "no-cache".to_string(),
    }
}
