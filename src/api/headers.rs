//! Hop-by-hop header filtering for the proxied exchange.

use axum::http::header::{HeaderMap, CONTENT_LENGTH, HOST};

/// Headers that describe one TCP hop and must not be forwarded.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

/// Request headers forwarded upstream: everything except the hop-by-hop
/// set and `Host` (the client set it for us, not for the backend).
pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) || name == HOST {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Response headers returned to the client: everything except the
/// hop-by-hop set and `Content-Length`, which no longer holds once the
/// body is re-framed by the relay.
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) || name == CONTENT_LENGTH {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}
