use std::{collections::BTreeMap, net::SocketAddr};

use http::{HeaderMap, HeaderName, Uri};
use once_cell::sync::Lazy;
use url::form_urlencoded;

/// Parses a query string into a key/value map.
///
/// Values are percent-decoded and `+` is treated as a space. Returns the first
/// occurrence of a repeated key.
pub fn parse_query(query: Option<&str>) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    if let Some(query) = query {
        for (k, v) in form_urlencoded::parse(query.as_bytes()) {
            params.entry(k.into_owned()).or_insert_with(|| v.into_owned());
        }
    }
    params
}

/// Extracts the value of a specific query parameter from the request URI.
pub fn get_query_value<'a>(uri: &'a Uri, name: &str) -> Option<&'a str> {
    uri.query().and_then(|query| {
        query.split('&').find_map(|pair| match pair.split_once('=') {
            Some((k, v)) if k == name => Some(v.trim()),
            None if pair == name => Some(""),
            _ => None,
        })
    })
}

/// Decodes `%XX` escapes in a path segment.
///
/// Returns `None` for malformed escapes or when the decoded bytes are not
/// valid UTF-8. Unlike form decoding, `+` is kept as is.
pub fn percent_decode(segment: &str) -> Option<String> {
    if !segment.contains('%') {
        return Some(segment.to_string());
    }

    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).ok()
}

/// Retrieves the value of a specific header.
///
/// Returns `None` if the header is not present or its value is not valid UTF-8.
pub fn get_header_value<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key).and_then(|value| value.to_str().ok())
}

/// Retrieves the value of a specific cookie from the `Cookie` header.
///
/// Simple `key=value` parsing, returns the first occurrence.
pub fn get_cookie_value<'a>(headers: &'a HeaderMap, cookie_name: &str) -> Option<&'a str> {
    let cookie_header_value = get_header_value(headers, "Cookie")?;
    for item in cookie_header_value.split(';') {
        if let Some((k, v)) = item.trim().split_once('=') {
            if k.trim() == cookie_name {
                return Some(v.trim());
            }
        }
    }
    log::debug!("Cookie '{cookie_name}' not found within Cookie header");
    None
}

/// Retrieves the request host (domain name).
///
/// Prefers the host from the URI, falls back to the `Host` header.
/// Removes the port number if present in the `Host` header.
pub fn get_request_host<'a>(uri: &'a Uri, headers: &'a HeaderMap) -> Option<&'a str> {
    if let Some(host) = uri.host() {
        if !host.is_empty() {
            return Some(host);
        }
    }

    let host = get_header_value(headers, http::header::HOST.as_str())?;
    let host = host.split(':').next().unwrap_or("").trim();
    (!host.is_empty()).then_some(host)
}

static HTTP_HEADER_X_FORWARDED_FOR: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-forwarded-for"));

static HTTP_HEADER_X_REAL_IP: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("x-real-ip"));

/// Gets the client's apparent IP address.
///
/// The order of precedence is:
/// 1. `X-Forwarded-For` (first IP in the list)
/// 2. `X-Real-IP`
/// 3. Remote connection address
///
/// Returns an empty string if no IP address can be determined.
pub fn get_client_ip(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get(&*HTTP_HEADER_X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(ip) = forwarded.split(',').next() {
            let ip = ip.trim();
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }

    if let Some(real_ip) = headers
        .get(&*HTTP_HEADER_X_REAL_IP)
        .and_then(|v| v.to_str().ok())
    {
        let ip = real_ip.trim();
        if !ip.is_empty() {
            return ip.to_string();
        }
    }

    remote_addr.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

/// Parses an `Accept-Encoding` style header into `(token, q)` pairs.
///
/// Tokens are lowercased. Entries with an unparsable weight get `q = 0`.
pub fn parse_weighted_list(value: &str) -> Vec<(String, f32)> {
    value
        .split(',')
        .filter_map(|item| {
            let mut parts = item.split(';');
            let token = parts.next()?.trim().to_ascii_lowercase();
            if token.is_empty() {
                return None;
            }
            let mut q = 1.0;
            for param in parts {
                if let Some((k, v)) = param.split_once('=') {
                    if k.trim().eq_ignore_ascii_case("q") {
                        q = v.trim().parse().unwrap_or(0.0);
                    }
                }
            }
            Some((token, q))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let q = parse_query(Some("a=1&b=hello+world&a=2&c=%2Fx"));
        assert_eq!(q.get("a").map(String::as_str), Some("1"));
        assert_eq!(q.get("b").map(String::as_str), Some("hello world"));
        assert_eq!(q.get("c").map(String::as_str), Some("/x"));
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%20b").as_deref(), Some("a b"));
        assert_eq!(percent_decode("a+b").as_deref(), Some("a+b"));
        assert_eq!(percent_decode("%E2%82%AC").as_deref(), Some("€"));
        assert_eq!(percent_decode("bad%2"), None);
        assert_eq!(percent_decode("%zz"), None);
    }

    #[test]
    fn test_get_request_host() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, "api.example.com:8080".parse().unwrap());
        let uri: Uri = "/path".parse().unwrap();
        assert_eq!(get_request_host(&uri, &headers), Some("api.example.com"));

        let uri: Uri = "http://other.example.com/path".parse().unwrap();
        assert_eq!(get_request_host(&uri, &headers), Some("other.example.com"));
    }

    #[test]
    fn test_get_client_ip() {
        let mut headers = HeaderMap::new();
        let addr: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        assert_eq!(get_client_ip(&headers, Some(addr)), "10.0.0.1");

        headers.insert("x-real-ip", "192.168.1.2".parse().unwrap());
        assert_eq!(get_client_ip(&headers, Some(addr)), "192.168.1.2");

        headers.insert("x-forwarded-for", "1.2.3.4, 5.6.7.8".parse().unwrap());
        assert_eq!(get_client_ip(&headers, Some(addr)), "1.2.3.4");
    }

    #[test]
    fn test_cookie_and_query_value() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", "a=1; session = abc ".parse().unwrap());
        assert_eq!(get_cookie_value(&headers, "session"), Some("abc"));
        assert_eq!(get_cookie_value(&headers, "missing"), None);

        let uri: Uri = "/x?apikey=k1&flag".parse().unwrap();
        assert_eq!(get_query_value(&uri, "apikey"), Some("k1"));
        assert_eq!(get_query_value(&uri, "flag"), Some(""));
    }

    #[test]
    fn test_parse_weighted_list() {
        let list = parse_weighted_list("gzip;q=0.5, br, identity;q=0");
        assert_eq!(list[0], ("gzip".to_string(), 0.5));
        assert_eq!(list[1], ("br".to_string(), 1.0));
        assert_eq!(list[2], ("identity".to_string(), 0.0));
    }
}
