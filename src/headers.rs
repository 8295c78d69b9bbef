// Clippy complains that these are interior-mutable.
// We don't mutate them, so silence it.
// https://rust-lang.github.io/rust-clippy/master/index.html#/declare_interior_mutable_const
#![allow(clippy::declare_interior_mutable_const)]
#![allow(clippy::borrow_interior_mutable_const)]

use http::{
    Uri,
    header::{
        CONNECTION, HOST, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
    },
};

#[macro_export]
macro_rules! hname {
    ($id:expr) => {{ http::header::HeaderName::from_static($id) }};
}

#[macro_export]
macro_rules! hval {
    ($id:expr) => {{ http::header::HeaderValue::from_static($id) }};
}

// Header names
pub const X_CACHE: HeaderName = hname!("x-cache");

// Warning values (RFC 7234 §5.5)
pub const WARN_110_RESPONSE_IS_STALE: HeaderValue = hval!("110 - \"Response is Stale\"");
pub const WARN_111_REVALIDATION_FAILED: HeaderValue = hval!("111 - \"Revalidation Failed\"");
pub const WARN_113_HEURISTIC_EXPIRATION: HeaderValue = hval!("113 - \"Heuristic Expiration\"");

static HOP_BY_HOP_HEADERS: [HeaderName; 9] = [
    hname!("keep-alive"),
    hname!("trailers"),
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
    CONNECTION,
];

/// Strips hop-by-hop headers so that only end-to-end fields cross this hop.
/// Fields named by `Connection` are connection-scoped too and get removed.
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    if let Some(connection) = headers.get(CONNECTION).cloned() {
        if let Ok(connection) = connection.to_str() {
            // A `Connection` header may carry a comma-separated list of other
            // header names that are meant for only this specific connection.
            for name in connection.split(',') {
                headers.remove(name.trim());
            }
        }
    }

    for header in &HOP_BY_HOP_HEADERS {
        headers.remove(header);
    }
}

/// Calculate very approximate HTTP request/response headers size in bytes.
/// More or less accurate only for http/1.1 since in h2 headers are HPACK-compressed.
pub fn calc_headers_size(h: &HeaderMap) -> usize {
    h.iter().map(|(k, v)| k.as_str().len() + v.len() + 2).sum()
}

/// Attempts to extract "host" from "host:port" format.
/// Host can be either FQDN or IPv4/IPv6 address.
pub fn extract_host(host_port: &str) -> Option<&str> {
    if host_port.is_empty() {
        return None;
    }

    // Cover IPv6 case
    if host_port.as_bytes()[0] == b'[' {
        host_port.find(']').map(|i| &host_port[0..=i])
    } else {
        host_port.split(':').next()
    }
}

/// Attempts to extract the port from "host:port" format
pub fn extract_port(host_port: &str) -> Option<u16> {
    let rest = if host_port.as_bytes().first() == Some(&b'[') {
        &host_port[host_port.find(']')? + 1..]
    } else {
        host_port.split_once(':').map_or("", |x| x.1)
    };

    rest.trim_start_matches(':').parse().ok()
}

/// Attempts to extract the authority from the request target or,
/// for origin-form targets, from the HTTP/1.1 "Host" header
pub fn extract_authority<'a>(uri: &'a Uri, headers: &'a HeaderMap) -> Option<&'a str> {
    uri.authority().map(|x| x.as_str()).or_else(|| {
        headers
            .get(HOST)
            .and_then(|x| x.to_str().ok())
            .filter(|x| !x.is_empty())
    })
}
