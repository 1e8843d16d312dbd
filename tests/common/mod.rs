//! Shared utilities for integration testing: a TLS upstream double and proxy setup.
#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_rustls::TlsAcceptor;

use h2_fanin_proxy::{lifecycle, ProxyConfig, RunningProxy, Transport};

pub type UpstreamBody = UnsyncBoxBody<Bytes, Infallible>;

/// Protocols the upstream double offers over ALPN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alpn {
    /// Offers `h2` and `http/1.1`.
    H2,
    /// Offers `http/1.1` only.
    Http1,
}

/// A running upstream double.
pub struct Upstream {
    pub addr: SocketAddr,
    pub cert: CertificateDer<'static>,
    /// TCP connections accepted.
    pub accepted: Arc<AtomicUsize>,
    /// Connections that negotiated `h2`.
    pub negotiated_h2: Arc<AtomicUsize>,
    /// Wakes every connection task, which then drops its connection.
    pub kill: Arc<Notify>,
}

impl Upstream {
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn negotiated_h2(&self) -> usize {
        self.negotiated_h2.load(Ordering::SeqCst)
    }
}

pub fn full(body: impl Into<Bytes>) -> UpstreamBody {
    Full::new(body.into()).boxed_unsync()
}

/// A body fed chunk by chunk from a channel; dropping it closes the channel.
pub fn channel_body(rx: mpsc::Receiver<Bytes>) -> UpstreamBody {
    let frames = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, Infallible>(Frame::data(chunk)), rx))
    });
    StreamBody::new(frames).boxed_unsync()
}

/// Start a TLS upstream on an ephemeral port answering with `handler`.
pub async fn start_upstream<F, Fut>(alpn: Alpn, handler: F) -> Upstream
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<UpstreamBody>> + Send + 'static,
{
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let mut server_config =
        rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], key)
            .unwrap();
    server_config.alpn_protocols = match alpn {
        Alpn::H2 => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        Alpn::Http1 => vec![b"http/1.1".to_vec()],
    };
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accepted = Arc::new(AtomicUsize::new(0));
    let negotiated_h2 = Arc::new(AtomicUsize::new(0));
    let kill = Arc::new(Notify::new());
    let handler = Arc::new(handler);

    {
        let accepted = accepted.clone();
        let negotiated_h2 = negotiated_h2.clone();
        let kill = kill.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                let acceptor = acceptor.clone();
                let handler = handler.clone();
                let negotiated_h2 = negotiated_h2.clone();
                let kill = kill.clone();

                tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(tcp).await else {
                        return;
                    };
                    let is_h2 = tls.get_ref().1.alpn_protocol() == Some(&b"h2"[..]);

                    let service = service_fn(move |request| {
                        let handler = handler.clone();
                        async move { Ok::<_, Infallible>((*handler)(request).await) }
                    });
                    let io = TokioIo::new(tls);

                    if is_h2 {
                        negotiated_h2.fetch_add(1, Ordering::SeqCst);
                        let conn = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                            .serve_connection(io, service);
                        tokio::select! {
                            _ = conn => {}
                            _ = kill.notified() => {}
                        }
                    } else {
                        let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);
                        tokio::select! {
                            _ = conn => {}
                            _ = kill.notified() => {}
                        }
                    }
                });
            }
        });
    }

    Upstream {
        addr,
        cert,
        accepted,
        negotiated_h2,
        kill,
    }
}

/// Client TLS settings trusting only the upstream double's certificate.
pub fn trusting(cert: &CertificateDer<'static>) -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.clone()).unwrap();
    rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Config pointing at `upstream`, listening on an ephemeral local port.
pub fn proxy_config(upstream: &Upstream) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.upstream.host = format!("localhost:{}", upstream.addr.port());
    config.lifecycle.shutdown_grace_secs = 1;
    config
}

/// Start a proxy in front of `upstream` that trusts its certificate.
pub async fn start_proxy(upstream: &Upstream, tweak: impl FnOnce(&mut ProxyConfig)) -> RunningProxy {
    let mut config = proxy_config(upstream);
    tweak(&mut config);
    let transport = Transport::with_tls_config(&config, trusting(&upstream.cert));
    lifecycle::start_with_transport(config, transport).await.unwrap()
}

/// Plain HTTP/1.1 client for talking to the proxy.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

pub fn url(proxy: &RunningProxy, path: &str) -> String {
    format!("http://{}{}", proxy.local_addr(), path)
}
