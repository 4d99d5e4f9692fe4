//! Request payload reading and parsing.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::{header, Method};
use serde_json::{Map, Value as JsonValue};

use crate::{
    config::{PayloadOutput, PayloadSettings},
    core::{Body, Boom, ErrorKind, Request, TimeoutKind},
    utils::response::essence,
};

const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Reads the body into `req` according to the route payload settings.
pub(crate) async fn read(req: &mut Request, body: Body, settings: &PayloadSettings) -> Result<(), Boom> {
    if req.method == Method::GET || req.method == Method::HEAD {
        return Ok(());
    }

    if settings.output == PayloadOutput::Stream {
        req.set_payload_stream(body.into_stream());
        return Ok(());
    }

    if let Some(length) = req
        .header(header::CONTENT_LENGTH.as_str())
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        if length > settings.max_bytes {
            return Err(too_large(settings.max_bytes));
        }
    }

    let raw = match tokio::time::timeout(settings.timeout, collect(body, settings.max_bytes)).await
    {
        Ok(raw) => raw?,
        Err(_) => {
            log::debug!("request {} payload not received within {:?}", req.id, settings.timeout);
            return Err(Boom::request_timeout().with_kind(ErrorKind::Timeout(TimeoutKind::Client)));
        }
    };
    req.raw_payload = Some(raw.clone());

    if !settings.parse || raw.is_empty() {
        return Ok(());
    }

    let mime = req
        .header(header::CONTENT_TYPE.as_str())
        .map(essence)
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

    if let Some(allow) = &settings.allow {
        if !allow.iter().any(|a| essence(a) == mime) {
            return Err(Boom::unsupported_media_type(format!(
                "Unsupported Media Type: {mime}"
            )));
        }
    }

    req.payload = parse(&mime, &raw)?;
    Ok(())
}

async fn collect(body: Body, max_bytes: usize) -> Result<Bytes, Boom> {
    let mut stream = match body {
        Body::Empty => return Ok(Bytes::new()),
        Body::Full(bytes) if bytes.len() > max_bytes => return Err(too_large(max_bytes)),
        Body::Full(bytes) => return Ok(bytes),
        Body::Stream(stream) => stream,
    };

    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Boom::bad_request(format!("Invalid request payload: {e}")))?;
        if buf.len() + chunk.len() > max_bytes {
            return Err(too_large(max_bytes));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn too_large(max_bytes: usize) -> Boom {
    Boom::payload_too_large(format!(
        "Payload content length greater than maximum allowed: {max_bytes}"
    ))
}

fn parse(mime: &str, raw: &Bytes) -> Result<Option<JsonValue>, Boom> {
    match mime {
        "application/json" => serde_json::from_slice(raw)
            .map(Some)
            .map_err(|_| Boom::bad_request("Invalid request payload JSON format")),
        m if m.ends_with("+json") => serde_json::from_slice(raw)
            .map(Some)
            .map_err(|_| Boom::bad_request("Invalid request payload JSON format")),
        "application/x-www-form-urlencoded" => {
            let mut map = Map::new();
            for (k, v) in url::form_urlencoded::parse(raw) {
                map.entry(k.into_owned())
                    .or_insert_with(|| JsonValue::String(v.into_owned()));
            }
            Ok(Some(JsonValue::Object(map)))
        }
        m if m.starts_with("text/") => String::from_utf8(raw.to_vec())
            .map(|s| Some(JsonValue::String(s)))
            .map_err(|_| Boom::bad_request("Invalid request payload encoding")),
        "application/octet-stream" => Ok(None),
        other => Err(Boom::unsupported_media_type(format!(
            "Unsupported Media Type: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use http::{HeaderMap, StatusCode};
    use serde_json::json;
    use std::{io, time::Duration};

    fn settings() -> PayloadSettings {
        PayloadSettings {
            parse: true,
            output: PayloadOutput::Data,
            max_bytes: 16,
            timeout: Duration::from_millis(100),
            allow: None,
        }
    }

    fn post(content_type: Option<&str>) -> Request {
        let mut headers = HeaderMap::new();
        if let Some(ct) = content_type {
            headers.insert(header::CONTENT_TYPE, ct.parse().unwrap());
        }
        Request::new(Method::POST, "/".parse().unwrap(), headers)
    }

    #[tokio::test]
    async fn test_json_and_default_type() {
        let mut req = post(None);
        read(&mut req, Body::from(r#"{"a":1}"#), &settings()).await.unwrap();
        assert_eq!(req.payload, Some(json!({"a": 1})));
        assert_eq!(req.raw_payload.as_deref(), Some(&b"{\"a\":1}"[..]));

        let mut req = post(Some("application/json"));
        let err = read(&mut req, Body::from("{oops"), &settings()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_form_text_and_binary() {
        let mut req = post(Some("application/x-www-form-urlencoded"));
        read(&mut req, Body::from("a=1&b=x+y"), &settings()).await.unwrap();
        assert_eq!(req.payload, Some(json!({"a": "1", "b": "x y"})));

        let mut req = post(Some("text/plain; charset=utf-8"));
        read(&mut req, Body::from("hello"), &settings()).await.unwrap();
        assert_eq!(req.payload, Some(json!("hello")));

        let mut req = post(Some("application/octet-stream"));
        read(&mut req, Body::from("raw"), &settings()).await.unwrap();
        assert!(req.payload.is_none());
        assert!(req.raw_payload.is_some());

        let mut req = post(Some("image/png"));
        let err = read(&mut req, Body::from("x"), &settings()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_max_bytes() {
        let mut req = post(None);
        let err = read(&mut req, Body::from("x".repeat(17)), &settings())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let chunks = vec![Ok(Bytes::from("0123456789")), Ok(Bytes::from("0123456789"))];
        let mut req = post(None);
        let err = read(&mut req, Body::stream(stream::iter(chunks)), &settings())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_allow_list() {
        let mut s = settings();
        s.allow = Some(vec!["text/plain".into()]);
        let mut req = post(Some("application/json"));
        let err = read(&mut req, Body::from("{}"), &s).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_timeout() {
        let stalled = stream::pending::<io::Result<Bytes>>();
        let mut req = post(None);
        let err = read(&mut req, Body::stream(stalled), &settings()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(err.kind(), ErrorKind::Timeout(TimeoutKind::Client));
    }

    #[tokio::test]
    async fn test_stream_output() {
        let mut s = settings();
        s.output = PayloadOutput::Stream;
        let mut req = post(None);
        read(&mut req, Body::from("x".repeat(64)), &s).await.unwrap();
        assert!(req.raw_payload.is_none());
        assert!(req.take_payload_stream().is_some());
    }
}
