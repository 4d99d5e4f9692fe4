//! Response under construction.
//!
//! Headers are kept as raw strings until transmission so a bad value set by
//! a handler surfaces as a 400 instead of being silently dropped.

use std::{fmt, io, time::Duration};

use bytes::Bytes;
use futures::Stream;
use http::StatusCode;
use serde_json::Value as JsonValue;

use super::{body::PayloadStream, Boom};

/// What the response body is produced from
pub enum Source {
    Empty,
    Value(JsonValue),
    Text(String),
    Bytes(Bytes),
    Stream(PayloadStream),
    View { template: String, context: JsonValue },
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Empty => write!(f, "Empty"),
            Source::Value(v) => write!(f, "Value({v})"),
            Source::Text(t) => write!(f, "Text({t:?})"),
            Source::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Source::Stream(_) => write!(f, "Stream"),
            Source::View { template, .. } => write!(f, "View({template})"),
        }
    }
}

/// A response taken apart for transmission
pub(crate) struct Parts {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub source: Source,
    pub content_type: Option<String>,
    pub compressible: Option<bool>,
    pub ttl: Option<Duration>,
}

#[derive(Debug)]
pub struct Response {
    status: Option<StatusCode>,
    headers: Vec<(String, String)>,
    source: Source,
    content_type: Option<String>,
    takeover: bool,
    compressible: Option<bool>,
    ttl: Option<Duration>,
    boom: Option<Boom>,
}

impl Response {
    fn from_source(source: Source) -> Self {
        Self {
            status: None,
            headers: Vec::new(),
            source,
            content_type: None,
            takeover: false,
            compressible: None,
            ttl: None,
            boom: None,
        }
    }

    pub fn value(value: JsonValue) -> Self {
        Self::from_source(Source::Value(value))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::from_source(Source::Text(text.into()))
    }

    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self::from_source(Source::Bytes(bytes.into()))
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Sync + 'static,
    {
        Self::from_source(Source::Stream(Box::pin(stream)))
    }

    pub fn empty() -> Self {
        Self::from_source(Source::Empty)
    }

    /// A response rendered by the server's template engine.
    pub fn view(template: impl Into<String>, context: JsonValue) -> Self {
        Self::from_source(Source::View {
            template: template.into(),
            context,
        })
    }

    /// Error envelope response.
    pub fn from_boom(boom: Boom, expose: bool) -> Self {
        let mut response = Self::value(boom.envelope(expose)).code(boom.status());
        response.headers = boom.headers().to_vec();
        response.boom = Some(boom);
        response
    }

    pub fn code(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets a header, replacing any previous value of the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn append_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// 201 with a `Location` header.
    pub fn created(self, location: impl Into<String>) -> Self {
        self.code(StatusCode::CREATED).header("location", location)
    }

    /// 302 redirect.
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::empty()
            .code(StatusCode::FOUND)
            .header("location", location)
    }

    /// Turns a redirect into a 301/308 (or back into 302/307).
    pub fn permanent(mut self, permanent: bool) -> Self {
        let rewrite = self.status.map(|s| s.as_u16()).unwrap_or(302) == 307
            || self.status == Some(StatusCode::PERMANENT_REDIRECT);
        self.status = Some(match (permanent, rewrite) {
            (true, false) => StatusCode::MOVED_PERMANENTLY,
            (true, true) => StatusCode::PERMANENT_REDIRECT,
            (false, false) => StatusCode::FOUND,
            (false, true) => StatusCode::TEMPORARY_REDIRECT,
        });
        self
    }

    /// Turns a redirect into a 307/308 that preserves the request method.
    pub fn rewritable(mut self, rewritable: bool) -> Self {
        let permanent = matches!(
            self.status,
            Some(StatusCode::MOVED_PERMANENTLY) | Some(StatusCode::PERMANENT_REDIRECT)
        );
        self.status = Some(match (permanent, rewritable) {
            (true, true) => StatusCode::MOVED_PERMANENTLY,
            (true, false) => StatusCode::PERMANENT_REDIRECT,
            (false, true) => StatusCode::FOUND,
            (false, false) => StatusCode::TEMPORARY_REDIRECT,
        });
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Skips the remaining extensions of the current point.
    pub fn takeover(mut self) -> Self {
        self.takeover = true;
        self
    }

    pub fn compressed(mut self, enabled: bool) -> Self {
        self.compressible = Some(enabled);
        self
    }

    /// Client cache lifetime, overrides the route cache policy.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Effective status: the explicit one, else 204 for empty bodies and 200
    /// otherwise.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(match self.source {
            Source::Empty => StatusCode::NO_CONTENT,
            _ => StatusCode::OK,
        })
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn get_content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn is_takeover(&self) -> bool {
        self.takeover
    }

    pub fn is_compressible(&self) -> Option<bool> {
        self.compressible
    }

    pub fn get_ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn boom(&self) -> Option<&Boom> {
        self.boom.as_ref()
    }

    pub fn is_error(&self) -> bool {
        self.boom.is_some()
    }

    /// The value assigned to the prerequisite bag.
    pub fn source_value(&self) -> JsonValue {
        match &self.source {
            Source::Value(v) => v.clone(),
            Source::Text(t) => JsonValue::String(t.clone()),
            Source::View { context, .. } => context.clone(),
            Source::Empty | Source::Bytes(_) | Source::Stream(_) => JsonValue::Null,
        }
    }

    pub(crate) fn into_parts(self) -> Parts {
        Parts {
            status: self.status(),
            headers: self.headers,
            source: self.source,
            content_type: self.content_type,
            compressible: self.compressible,
            ttl: self.ttl,
        }
    }
}

impl From<JsonValue> for Response {
    fn from(value: JsonValue) -> Self {
        Response::value(value)
    }
}

impl From<&str> for Response {
    fn from(value: &str) -> Self {
        Response::text(value)
    }
}

impl From<String> for Response {
    fn from(value: String) -> Self {
        Response::text(value)
    }
}
