//! Response relay back to the local client.
//!
//! # Responsibilities
//! - Translate the response head to HTTP/1.1 (drop per-hop framing headers)
//! - Stream the body frame by frame, trailers included
//!
//! Synthesized gateway failures go through the same path as real upstream
//! responses. Nothing is buffered: a frame is polled from upstream only when
//! the inbound connection asks for the next one, so a client that goes away
//! stops the upstream read as soon as the response is dropped.

use axum::body::Body;
use axum::http::{Response, Version};
use bytes::Bytes;
use http_body_util::BodyExt;

use crate::http::headers::{strip_hop_by_hop, Direction};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Prepare a response for the inbound connection.
pub fn relay<B>(response: Response<B>) -> Response<Body>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let (mut parts, body) = response.into_parts();

    strip_hop_by_hop(&mut parts.headers, Direction::Response);
    parts.version = Version::HTTP_11;

    let body = body.map_err(|err| {
        let err: BoxError = err.into();
        tracing::debug!(error = %err, "Upstream body ended with an error");
        err
    });

    Response::from_parts(parts, Body::new(body))
}
