//! Response helpers shared by the transmitter and built-in plugins.

use http::{HeaderName, HeaderValue};

/// Standard content types
pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
    pub const TEXT_HTML: &str = "text/html; charset=utf-8";
    pub const APPLICATION_JSON: &str = "application/json; charset=utf-8";
    pub const OCTET_STREAM: &str = "application/octet-stream";
    pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
}

/// Returns the media type without parameters, lowercased.
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Whether a body of this content type benefits from compression.
pub fn is_compressible(content_type: &str) -> bool {
    let mime = essence(content_type);
    mime.starts_with("text/")
        || mime.ends_with("+json")
        || mime.ends_with("+xml")
        || matches!(
            mime.as_str(),
            "application/json"
                | "application/javascript"
                | "application/xml"
                | "application/x-www-form-urlencoded"
                | "image/svg+xml"
        )
}

/// Validates a raw header pair.
///
/// Rejects anything `http` would refuse, which includes embedded CR/LF and
/// therefore response splitting attempts.
pub fn validate_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), String> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| format!("Invalid header name: {name:?}"))?;
    if value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
        return Err(format!("Invalid header value for {name}"));
    }
    let header_value =
        HeaderValue::from_str(value).map_err(|_| format!("Invalid header value for {name}"))?;
    Ok((header_name, header_value))
}
