//! HTTP header processing: outbound request shaping, hop-by-hop removal,
//! host rewriting, and response header classification.
//!
//! Implements the header-level requirements of RFC 7230 Section 6.1
//! (hop-by-hop header handling). Request headers whose names start with
//! `x-` are internal to the proxy tier and never forwarded to backends.

use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};

/// Removes all hop-by-hop headers from the given header map.
///
/// Strips the standard set defined in RFC 7230 Section 6.1 (`Connection`,
/// `Keep-Alive`, `Proxy-Authenticate`, `Proxy-Authorization`, `TE`,
/// `Trailers`, `Transfer-Encoding`, `Upgrade`), plus any additional
/// header names declared in the `Connection` header value.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let conn: Vec<HeaderName> = headers
        .get("connection")
        .and_then(|val| val.to_str().ok())
        .map(|val| {
            val.split(',')
                .filter_map(|s| HeaderName::from_bytes(s.trim().as_bytes()).ok())
                .collect()
        })
        .unwrap_or_default();

    conn.iter().for_each(|name| {
        headers.remove(name);
    });

    [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ]
    .iter()
    .for_each(|name| {
        headers.remove(*name);
    });
}

/// Returns `true` for headers that stay on the proxy tier: anything
/// prefixed `x-` and the client's own framing.
fn is_internal(name: &HeaderName) -> bool {
    // Header names are stored lowercased.
    name.as_str().starts_with("x-") || name == header::CONTENT_LENGTH || name == header::HOST
}

/// Rewrites the `Host` header to the backend hostname.
///
/// This ensures the backend receives the correct `Host` value regardless
/// of what the client originally sent, and regardless of whether the
/// connection targets an IP override.
pub fn rewrite_host(headers: &mut HeaderMap, host: &str) {
    if let Ok(val) = HeaderValue::from_str(host) {
        headers.insert(header::HOST, val);
    }
}

/// Builds the header set for one outbound attempt.
///
/// Copies `source` except internal and hop-by-hop headers, forces `Host`
/// to `host` and `Connection: close`, and sets `Content-Length` for a
/// non-empty body, supplying `application/octet-stream` when the client
/// sent no `Content-Type`.
pub fn outbound_headers(source: &HeaderMap, host: &str, body_len: usize) -> HeaderMap {
    let mut headers = source.clone();
    strip_hop_by_hop(&mut headers);

    let internal: Vec<HeaderName> = headers.keys().filter(|n| is_internal(n)).cloned().collect();
    internal.iter().for_each(|name| {
        headers.remove(name);
    });

    rewrite_host(&mut headers, host);

    if body_len > 0 {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
        if !headers.contains_key(header::CONTENT_TYPE) {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
        }
    }

    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    headers
}

/// Splits `headers` into (`content-*` headers, all other headers).
pub fn split_content_headers(headers: HeaderMap) -> (HeaderMap, HeaderMap) {
    let mut content = HeaderMap::new();
    let mut rest = HeaderMap::new();
    let mut current: Option<HeaderName> = None;

    // `into_iter` yields `None` names for repeated values of the last name.
    for (name, value) in headers {
        if let Some(name) = name {
            current = Some(name);
        }
        let Some(name) = current.clone() else {
            continue;
        };
        if name.as_str().starts_with("content-") {
            content.append(name, value);
        } else {
            rest.append(name, value);
        }
    }
    (content, rest)
}

/// Extracts the `charset` parameter of a `Content-Type` header value.
pub fn charset(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, value)| value.trim().trim_matches('"').to_ascii_lowercase())
        .filter(|value| !value.is_empty())
}

/// Charsets whose bytes are forwarded as-is without further inspection.
const KNOWN_CHARSETS: &[&str] = &[
    "utf-8",
    "utf8",
    "us-ascii",
    "ascii",
    "iso-8859-1",
    "latin1",
    "windows-1252",
    "utf-16",
    "utf-16le",
    "utf-16be",
];

/// Returns `true` if `charset` is one the proxy recognises.
pub fn is_known_charset(charset: &str) -> bool {
    KNOWN_CHARSETS.contains(&charset.to_ascii_lowercase().as_str())
}
