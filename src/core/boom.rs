//! Per-request HTTP errors
//!
//! A [`Boom`] is the error half of every request-level operation. The
//! lifecycle driver never lets one escape: it is always rendered into the
//! `{statusCode, error, message}` envelope and transmitted.

use std::fmt;

use http::StatusCode;
use serde_json::{Map, Value as JsonValue};

use super::ServerError;

const GENERIC_INTERNAL_MESSAGE: &str = "An internal server error occurred";

/// Which timeout budget expired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The request body was not received in time
    Client,
    /// No response was produced in time after routing
    Server,
    /// The connection stayed idle for too long
    Socket,
}

/// Error taxonomy for request processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Unauthorized,
    Forbidden,
    ValidationFailed,
    PrerequisiteFailed,
    HandlerFailed,
    Timeout(TimeoutKind),
    PayloadTooLarge,
    UnsupportedMediaType,
    StreamTransmissionFailed,
    Internal,
}

/// HTTP-friendly error carried through the request lifecycle
#[derive(Debug, Clone)]
pub struct Boom {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
    data: Map<String, JsonValue>,
    headers: Vec<(String, String)>,
}

impl Boom {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        let kind = match status {
            StatusCode::NOT_FOUND => ErrorKind::NotFound,
            StatusCode::UNAUTHORIZED => ErrorKind::Unauthorized,
            StatusCode::FORBIDDEN => ErrorKind::Forbidden,
            StatusCode::PAYLOAD_TOO_LARGE => ErrorKind::PayloadTooLarge,
            StatusCode::UNSUPPORTED_MEDIA_TYPE => ErrorKind::UnsupportedMediaType,
            StatusCode::REQUEST_TIMEOUT => ErrorKind::Timeout(TimeoutKind::Client),
            s if s.is_server_error() => ErrorKind::Internal,
            _ => ErrorKind::BadRequest,
        };

        Self {
            status,
            kind,
            message: message.into(),
            data: Map::new(),
            headers: Vec::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// 401 with an optional `WWW-Authenticate` challenge.
    pub fn unauthorized(message: impl Into<String>, scheme: Option<&str>) -> Self {
        let boom = Self::new(StatusCode::UNAUTHORIZED, message);
        match scheme {
            Some(scheme) => boom.with_header("WWW-Authenticate", scheme),
            None => boom,
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not Found")
    }

    pub fn request_timeout() -> Self {
        Self::new(StatusCode::REQUEST_TIMEOUT, "Request Timeout")
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    pub fn unsupported_media_type(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, message)
    }

    pub fn server_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    /// 500 whose message is only shown when error exposure is enabled.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Adds a field to the rendered envelope.
    pub fn with_data(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn data(&self) -> &Map<String, JsonValue> {
        &self.data
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn is_server(&self) -> bool {
        self.status.is_server_error()
    }

    /// Short error label, the canonical reason phrase of the status.
    pub fn label(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("Unknown")
    }

    /// Renders the `{statusCode, error, message}` envelope.
    ///
    /// The message of a 500 is replaced with a generic text unless `expose`
    /// is set.
    pub fn envelope(&self, expose: bool) -> JsonValue {
        let message = if self.status == StatusCode::INTERNAL_SERVER_ERROR && !expose {
            GENERIC_INTERNAL_MESSAGE.to_string()
        } else {
            self.message.clone()
        };

        let mut body = Map::new();
        body.insert("statusCode".into(), self.status.as_u16().into());
        body.insert("error".into(), self.label().into());
        body.insert("message".into(), message.into());
        for (key, value) in &self.data {
            body.insert(key.clone(), value.clone());
        }

        JsonValue::Object(body)
    }
}

impl fmt::Display for Boom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.status.as_u16(), self.label(), self.message)
    }
}

impl std::error::Error for Boom {}

impl From<ServerError> for Boom {
    fn from(err: ServerError) -> Self {
        Boom::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_hides_internal_messages() {
        let boom = Boom::internal("database exploded");
        assert_eq!(
            boom.envelope(false),
            json!({
                "statusCode": 500,
                "error": "Internal Server Error",
                "message": "An internal server error occurred"
            })
        );
        assert_eq!(boom.envelope(true)["message"], "database exploded");
    }

    #[test]
    fn test_envelope_includes_data() {
        let boom = Boom::bad_request("child \"id\" fails")
            .with_kind(ErrorKind::ValidationFailed)
            .with_data("validation", json!({"source": "params", "keys": ["id"]}));

        let body = boom.envelope(false);
        assert_eq!(body["statusCode"], 400);
        assert_eq!(body["error"], "Bad Request");
        assert_eq!(body["validation"]["source"], "params");
        assert_eq!(boom.kind(), ErrorKind::ValidationFailed);
    }

    #[test]
    fn test_kind_from_status() {
        assert_eq!(Boom::not_found().kind(), ErrorKind::NotFound);
        assert_eq!(
            Boom::request_timeout().kind(),
            ErrorKind::Timeout(TimeoutKind::Client)
        );
        assert_eq!(
            Boom::unauthorized("Missing", Some("Basic")).headers()[0].1,
            "Basic"
        );
    }
}
