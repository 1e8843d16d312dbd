//! Request rewrite towards the upstream.
//!
//! The only changes made to a request are its scheme, its authority and the
//! `Host` header. Method, path, query, other headers, extensions and the body
//! move into the outbound request untouched.

use axum::http::header::{HeaderValue, HOST};
use axum::http::uri::{Authority, PathAndQuery, Scheme, Uri};
use axum::http::Request;

use crate::config::validation::{validate_upstream_host, ValidationError};

/// Rewrites inbound requests to target the configured upstream over https.
#[derive(Debug, Clone)]
pub struct Director {
    authority: Authority,
    host: HeaderValue,
    root: Uri,
}

impl Director {
    /// Validate the upstream host once so `rewrite` cannot fail.
    pub fn new(upstream_host: &str) -> Result<Self, ValidationError> {
        let authority = validate_upstream_host(upstream_host)?;
        let invalid = || ValidationError::UpstreamHost(upstream_host.to_string());

        let host = HeaderValue::from_str(authority.as_str()).map_err(|_| invalid())?;
        let root = Uri::builder()
            .scheme(Scheme::HTTPS)
            .authority(authority.clone())
            .path_and_query("/")
            .build()
            .map_err(|_| invalid())?;

        Ok(Self {
            authority,
            host,
            root,
        })
    }

    /// The authority every request is sent to.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Point `request` at the upstream. Applying it twice changes nothing.
    pub fn rewrite<B>(&self, request: Request<B>) -> Request<B> {
        let (mut parts, body) = request.into_parts();

        let mut uri = std::mem::take(&mut parts.uri).into_parts();
        uri.scheme = Some(Scheme::HTTPS);
        uri.authority = Some(self.authority.clone());
        if uri.path_and_query.is_none() {
            uri.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        // Scheme, authority and path are all present, so this cannot fail.
        parts.uri = Uri::from_parts(uri).unwrap_or_else(|_| self.root.clone());

        parts.headers.insert(HOST, self.host.clone());

        Request::from_parts(parts, body)
    }
}
