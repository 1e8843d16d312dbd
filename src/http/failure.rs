//! Gateway failure responses.
//!
//! When forwarding fails before a response head arrives there is no upstream
//! response to relay, so one is synthesized here: 504 for timeouts, 502 for
//! everything else. No retry is attempted.

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;

use crate::upstream::ForwardError;

/// A synthesized 5xx response describing a failed forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayFailure {
    status: StatusCode,
    reason: String,
}

impl GatewayFailure {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl From<&ForwardError> for GatewayFailure {
    fn from(err: &ForwardError) -> Self {
        let status = if err.is_timeout() {
            StatusCode::GATEWAY_TIMEOUT
        } else {
            StatusCode::BAD_GATEWAY
        };
        Self {
            status,
            reason: err.to_string(),
        }
    }
}

impl IntoResponse for GatewayFailure {
    fn into_response(self) -> Response<Body> {
        let body = format!(
            "{} {}: {}\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("Gateway Failure"),
            self.reason
        );
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}
