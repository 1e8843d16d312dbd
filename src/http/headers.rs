//! Hop-by-hop header handling.
//!
//! Framing and connection-management headers only mean something on a single
//! hop, and several of them are illegal on an HTTP/2 stream. They are removed
//! whenever a message crosses from one connection to another.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, TE};

/// Headers that never cross a hop.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
];

/// Which way a message is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local client → upstream.
    Request,
    /// Upstream → local client.
    Response,
}

/// True if any `TE` value lists the `trailers` token.
fn accepts_trailers(headers: &HeaderMap) -> bool {
    headers
        .get_all(TE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("trailers"))
}

/// Remove hop-by-hop headers in place.
///
/// Headers named by `Connection` are removed too. On requests `TE: trailers`
/// survives since HTTP/2 allows exactly that value. Every other header keeps
/// its values and their order.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, direction: Direction) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    let keep_te = direction == Direction::Request && accepts_trailers(headers);

    for name in listed {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }

    if keep_te {
        headers.insert(TE, HeaderValue::from_static("trailers"));
    }
}
