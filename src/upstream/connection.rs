//! Physical upstream connections.
//!
//! # Responsibilities
//! - Put one deadline on TCP connect plus TLS handshake
//! - Tag each connection with the protocol ALPN settled on
//! - Count opened and live connections (RAII guard per connection)
//! - Hold back new connects while an HTTP/2 connection is alive
//!
//! The pool itself lives in the `hyper-util` client; this module only sees a
//! connection when it is created and when the pool finally drops it.
//!
//! # Cold start
//! Until ALPN has answered once, the client cannot know whether the upstream
//! multiplexes, so every request waiting on the pool asks for a connection.
//! Connects are therefore admitted one at a time until a protocol is known.
//! Once an HTTP/2 connection is up, a pending connect waits for it to go
//! away instead of dialing; the pool checkout hands that request the shared
//! connection first. HTTP/1.1 upstreams connect in parallel.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::http::Uri;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection};
use tokio::sync::{Notify, Semaphore};
use tower::Service;

use crate::observability::metrics;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Wire protocol negotiated on an upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// One exchange at a time.
    Http1,
    /// Multiplexed streams.
    Http2,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http/1.1",
            Protocol::Http2 => "h2",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when connect plus handshake exceeds its deadline.
#[derive(Debug, thiserror::Error)]
#[error("connecting to upstream timed out after {0:?}")]
pub struct ConnectTimeout(pub Duration);

/// Point-in-time view of [`UpstreamStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Physical connections opened since start.
    pub opened: u64,
    /// Of those, how many negotiated HTTP/2.
    pub multiplexed: u64,
    /// Connections currently alive.
    pub active: usize,
}

/// Counters over all physical upstream connections.
#[derive(Debug, Default)]
pub struct UpstreamStats {
    opened: AtomicU64,
    multiplexed: AtomicU64,
    active: AtomicUsize,
    /// Live connections that negotiated HTTP/2.
    live_multiplexed: AtomicUsize,
    /// The most recent connection fell back to HTTP/1.1.
    speaks_http1: AtomicBool,
    /// Woken when the last live HTTP/2 connection closes.
    multiplexed_closed: Notify,
}

impl UpstreamStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            opened: self.opened.load(Ordering::SeqCst),
            multiplexed: self.multiplexed.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
        }
    }

    /// Resolve once no HTTP/2 connection is alive.
    async fn multiplexed_gone(&self) {
        loop {
            let closed = self.multiplexed_closed.notified();
            tokio::pin!(closed);
            closed.as_mut().enable();
            if self.live_multiplexed.load(Ordering::SeqCst) == 0 {
                return;
            }
            closed.await;
        }
    }

    fn track(self: &Arc<Self>, protocol: Protocol) -> UpstreamConnectionGuard {
        let id = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        if protocol == Protocol::Http2 {
            self.multiplexed.fetch_add(1, Ordering::SeqCst);
            self.live_multiplexed.fetch_add(1, Ordering::SeqCst);
        }
        self.speaks_http1
            .store(protocol == Protocol::Http1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        metrics::upstream_connection_opened(protocol.as_str());

        UpstreamConnectionGuard {
            stats: Arc::clone(self),
            protocol,
            id,
        }
    }
}

/// Decrements the live count when the pool drops the connection.
#[derive(Debug)]
pub struct UpstreamConnectionGuard {
    stats: Arc<UpstreamStats>,
    protocol: Protocol,
    id: u64,
}

impl Drop for UpstreamConnectionGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        if self.protocol == Protocol::Http2
            && self.stats.live_multiplexed.fetch_sub(1, Ordering::SeqCst) == 1
        {
            self.stats.multiplexed_closed.notify_waiters();
        }
        metrics::upstream_connection_closed();
        tracing::debug!(
            upstream_connection = self.id,
            protocol = %self.protocol,
            "Upstream connection closed"
        );
    }
}

/// Connector wrapper that applies the connect deadline and tracks connections.
#[derive(Debug, Clone)]
pub struct UpstreamConnector<C> {
    inner: C,
    connect_timeout: Duration,
    stats: Arc<UpstreamStats>,
    /// One connect at a time while the upstream protocol is unknown.
    admission: Arc<Semaphore>,
}

impl<C> UpstreamConnector<C> {
    pub fn new(inner: C, connect_timeout: Duration, stats: Arc<UpstreamStats>) -> Self {
        Self {
            inner,
            connect_timeout,
            stats,
            admission: Arc::new(Semaphore::new(1)),
        }
    }
}

impl<C> Service<Uri> for UpstreamConnector<C>
where
    C: Service<Uri>,
    C::Response: Read + Write + Connection + Unpin + Send + 'static,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
{
    type Response = TrackedConnection<C::Response>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        // Connector futures do no work until polled, so dialing waits for admission.
        let connecting = self.inner.call(uri.clone());
        let deadline = self.connect_timeout;
        let stats = Arc::clone(&self.stats);
        let admission = Arc::clone(&self.admission);

        Box::pin(async move {
            let admitted = async {
                let permit = loop {
                    stats.multiplexed_gone().await;
                    if stats.speaks_http1.load(Ordering::SeqCst) {
                        break None;
                    }
                    let permit = Arc::clone(&admission).acquire_owned().await?;
                    if stats.live_multiplexed.load(Ordering::SeqCst) == 0 {
                        break Some(permit);
                    }
                };
                let io = connecting.await.map_err(Into::<BoxError>::into)?;
                Ok::<_, BoxError>((io, permit))
            };

            // The permit is released only after the connection is counted.
            let (io, _permit) = match tokio::time::timeout(deadline, admitted).await {
                Ok(Ok(admitted)) => admitted,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(Box::new(ConnectTimeout(deadline)) as BoxError),
            };

            let protocol = if io.connected().is_negotiated_h2() {
                Protocol::Http2
            } else {
                Protocol::Http1
            };
            let guard = stats.track(protocol);

            tracing::info!(
                upstream = %uri,
                upstream_connection = guard.id,
                protocol = %protocol,
                "Upstream connection established"
            );

            Ok(TrackedConnection { inner: io, guard })
        })
    }
}

/// An upstream stream plus the guard recording its lifetime.
#[derive(Debug)]
pub struct TrackedConnection<T> {
    inner: T,
    guard: UpstreamConnectionGuard,
}

impl<T: Connection> Connection for TrackedConnection<T> {
    fn connected(&self) -> Connected {
        self.inner.connected()
    }
}

impl<T: Read + Unpin> Read for TrackedConnection<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<T: Write + Unpin> Write for TrackedConnection<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_live_connections() {
        let stats = Arc::new(UpstreamStats::default());

        let h2 = stats.track(Protocol::Http2);
        let h1 = stats.track(Protocol::Http1);
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                opened: 2,
                multiplexed: 1,
                active: 2
            }
        );

        drop(h2);
        drop(h1);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.opened, 2);
    }

    #[test]
    fn connection_ids_are_sequential() {
        let stats = Arc::new(UpstreamStats::default());
        let first = stats.track(Protocol::Http1);
        let second = stats.track(Protocol::Http1);
        assert_eq!((first.id, second.id), (1, 2));
    }

    #[derive(Clone)]
    struct NeverConnects;

    impl Service<Uri> for NeverConnects {
        type Response = hyper_util::rt::TokioIo<tokio::net::TcpStream>;
        type Error = io::Error;
        type Future = Pin<Box<dyn Future<Output = io::Result<Self::Response>> + Send>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _: Uri) -> Self::Future {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn connect_deadline_is_enforced() {
        let stats = Arc::new(UpstreamStats::default());
        let mut connector =
            UpstreamConnector::new(NeverConnects, Duration::from_millis(20), Arc::clone(&stats));

        let err = connector
            .call(Uri::from_static("https://upstream.test"))
            .await
            .unwrap_err();

        assert!(err.downcast_ref::<ConnectTimeout>().is_some());
        assert_eq!(stats.snapshot().opened, 0);
    }

    /// Stream that never yields data, tagged with a negotiated protocol.
    struct StubIo {
        h2: bool,
    }

    impl Connection for StubIo {
        fn connected(&self) -> Connected {
            let connected = Connected::new();
            if self.h2 {
                connected.negotiated_h2()
            } else {
                connected
            }
        }
    }

    impl Read for StubIo {
        fn poll_read(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: ReadBufCursor<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl Write for StubIo {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Counts dials; each takes a little while, like a real handshake.
    #[derive(Clone)]
    struct CountingConnector {
        dials: Arc<AtomicUsize>,
        h2: bool,
    }

    impl Service<Uri> for CountingConnector {
        type Response = StubIo;
        type Error = io::Error;
        type Future = Pin<Box<dyn Future<Output = io::Result<StubIo>> + Send>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _: Uri) -> Self::Future {
            let dials = Arc::clone(&self.dials);
            let h2 = self.h2;
            Box::pin(async move {
                dials.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(StubIo { h2 })
            })
        }
    }

    fn counting(h2: bool) -> (UpstreamConnector<CountingConnector>, Arc<AtomicUsize>, Arc<UpstreamStats>) {
        let dials = Arc::new(AtomicUsize::new(0));
        let stats = Arc::new(UpstreamStats::default());
        let connector = UpstreamConnector::new(
            CountingConnector {
                dials: Arc::clone(&dials),
                h2,
            },
            Duration::from_secs(5),
            Arc::clone(&stats),
        );
        (connector, dials, stats)
    }

    #[tokio::test]
    async fn cold_burst_dials_once_while_h2_is_alive() {
        let (mut connector, dials, stats) = counting(true);
        let uri = Uri::from_static("https://upstream.test");

        let first = connector.call(uri.clone());
        let waiting: Vec<_> = (0..9).map(|_| tokio::spawn(connector.call(uri.clone()))).collect();

        let shared = first.await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert!(waiting.iter().all(|handle| !handle.is_finished()));

        // Losing the shared connection lets exactly one waiter replace it.
        drop(shared);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert_eq!(stats.snapshot().multiplexed, 2);

        for handle in waiting {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn http1_upstream_dials_in_parallel_once_known() {
        let (mut connector, dials, stats) = counting(false);
        let uri = Uri::from_static("https://upstream.test");

        let first = connector.call(uri.clone()).await.unwrap();

        let started = std::time::Instant::now();
        let burst: Vec<_> = (0..5).map(|_| tokio::spawn(connector.call(uri.clone()))).collect();
        let mut connections = vec![first];
        for handle in burst {
            connections.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(dials.load(Ordering::SeqCst), 6);
        assert!(started.elapsed() < Duration::from_millis(90));
        assert_eq!(stats.snapshot().active, 6);
        assert_eq!(stats.snapshot().multiplexed, 0);
    }
}
