//! Physical connection establishment.
//!
//! The [`Dialer`] opens one TCP connection to a resolved address, writes the
//! optional connection-type prefix byte, and hands the raw stream to the
//! configured [`TlsWrapper`] when TLS applies to the destination. The whole
//! sequence runs under a single deadline.
//!
//! A server dialing into another datacenter can instead go through that
//! datacenter's mesh gateway: the stream goes to the gateway address and is
//! wrapped by the [`AlpnWrapper`], whose negotiated protocol replaces the
//! prefix byte.
//!
//! The pool never dials through tonic's own HTTP connector: every logical
//! connection installs a [`DialConnector`] so that reconnects made by the
//! HTTP/2 layer go through the same prefix and TLS steps.

use std::{
    fmt, io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::future::BoxFuture;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};
use tonic::transport::Uri;
use tower::Service;
use tracing::{debug, warn};

use crate::{
    config::DialerConfig,
    endpoint::ResolvedAddress,
    error::{
        AlpnSnafu, ConnectSnafu, DialError, GatewayUnavailableSnafu, PrefixSnafu, TimeoutSnafu,
        TlsSnafu, TlsWrapperMissingSnafu,
    },
    metrics::{ConnectionEvent, PoolMetrics, default_metrics},
};

/// Byte stream the dialer produces and the TLS wrapper consumes.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased [`Stream`].
pub type BoxedStream = Box<dyn Stream>;

/// Decides per datacenter whether outbound connections use TLS.
pub type TlsPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Wraps a closure as a [`TlsPredicate`].
pub fn tls_predicate(predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> TlsPredicate {
    Arc::new(predicate)
}

/// Layers TLS over an established stream.
///
/// The wrapper takes ownership of the raw stream. On failure it must drop the
/// stream, which closes the socket.
pub trait TlsWrapper: Send + Sync + fmt::Debug {
    /// Performs the client handshake with `server_name` over `stream`.
    fn wrap(&self, server_name: &str, stream: BoxedStream)
    -> BoxFuture<'static, io::Result<BoxedStream>>;
}

/// Maps a datacenter to the address of its mesh gateway.
pub type GatewayResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Wraps a closure as a [`GatewayResolver`].
pub fn gateway_resolver(
    resolve: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
) -> GatewayResolver {
    Arc::new(resolve)
}

/// ALPN protocol requested for gRPC through a mesh gateway.
pub const GRPC_ALPN_PROTOCOL: &str = "ledger/rpc-grpc";

/// Layers TLS with ALPN over a stream to a mesh gateway.
///
/// Same ownership contract as [`TlsWrapper`].
pub trait AlpnWrapper: Send + Sync + fmt::Debug {
    /// Performs the handshake for `node_name` in `datacenter`, negotiating `protocol`.
    fn wrap(
        &self,
        datacenter: &str,
        node_name: &str,
        protocol: &str,
        stream: BoxedStream,
    ) -> BoxFuture<'static, io::Result<BoxedStream>>;
}

/// Establishes physical connections.
///
/// Safe for concurrent use. Cloning is cheap and clones share configuration.
#[derive(Debug, Clone)]
pub struct Dialer {
    config: Arc<DialerConfig>,
    metrics: Arc<dyn PoolMetrics>,
}

impl Dialer {
    /// Creates a dialer with no-op metrics.
    #[must_use]
    pub fn new(config: DialerConfig) -> Self {
        Self::with_metrics(config, default_metrics())
    }

    /// Creates a dialer reporting connection events to `metrics`.
    #[must_use]
    pub fn with_metrics(config: DialerConfig, metrics: Arc<dyn PoolMetrics>) -> Self {
        Self { config: Arc::new(config), metrics }
    }

    /// Returns the dialer configuration.
    #[must_use]
    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    /// Returns whether a direct connection to `address` in `datacenter` needs TLS.
    ///
    /// Both the endpoint's flag and the datacenter predicate must ask for it.
    #[must_use]
    pub fn uses_tls(&self, datacenter: &str, address: &ResolvedAddress) -> bool {
        address.use_tls && self.config.use_tls_for_dc(datacenter)
    }

    /// Dials `address`, returning a stream ready for HTTP/2.
    ///
    /// Dropping the returned future at any point releases the socket.
    ///
    /// # Errors
    ///
    /// Returns a [`DialError`] if the connect, the prefix write or the TLS
    /// wrap fails, if TLS is needed but no wrapper is configured, if a
    /// remote datacenter has no gateway, or if the dial does not finish
    /// within the dial timeout.
    pub async fn dial(
        &self,
        datacenter: &str,
        address: &ResolvedAddress,
    ) -> Result<BoxedStream, DialError> {
        let timeout = self.config.timeout();
        let result = match tokio::time::timeout(timeout, self.establish(datacenter, address)).await
        {
            Ok(result) => result,
            Err(_) => {
                TimeoutSnafu { address: &address.address, timeout_ms: millis(timeout) }.fail()
            },
        };

        match result {
            Ok(stream) => {
                debug!(datacenter, address = %address.address, "Dialed server");
                self.metrics.record_connection(&address.address, ConnectionEvent::Connected);
                Ok(Box::new(TrackedStream {
                    inner: stream,
                    address: address.address.clone(),
                    metrics: Arc::clone(&self.metrics),
                }))
            },
            Err(e) => {
                warn!(datacenter, address = %address.address, error = %e, "Dial failed");
                self.metrics.record_connection(&address.address, ConnectionEvent::Failed);
                Err(e)
            },
        }
    }

    async fn establish(
        &self,
        datacenter: &str,
        address: &ResolvedAddress,
    ) -> Result<BoxedStream, DialError> {
        if self.config.routes_via_gateway(datacenter)
            && let Some(alpn) = self.config.alpn_wrapper()
        {
            return self.establish_via_gateway(datacenter, address, alpn.as_ref()).await;
        }

        let mut stream = connect(&address.address).await?;
        if let Some(prefix) = self.config.prefix() {
            stream.write_all(&[prefix]).await.context(PrefixSnafu { address: &address.address })?;
        }

        if !self.uses_tls(datacenter, address) {
            return Ok(stream);
        }
        // Dropping the stream on the error path closes the socket.
        let wrapper =
            self.config.tls_wrapper().context(TlsWrapperMissingSnafu { address: &address.address })?;
        wrapper
            .wrap(&address.server_name, stream)
            .await
            .context(TlsSnafu { server_name: &address.server_name })
    }

    async fn establish_via_gateway(
        &self,
        datacenter: &str,
        address: &ResolvedAddress,
        alpn: &dyn AlpnWrapper,
    ) -> Result<BoxedStream, DialError> {
        let gateway =
            self.config.gateway_for(datacenter).context(GatewayUnavailableSnafu { datacenter })?;
        debug!(
            datacenter,
            gateway = %gateway,
            node_name = %address.server_name,
            "Dialing through mesh gateway"
        );

        let stream = connect(&gateway).await?;
        alpn.wrap(datacenter, &address.server_name, GRPC_ALPN_PROTOCOL, stream)
            .await
            .context(AlpnSnafu { gateway: &gateway, node_name: &address.server_name })
    }
}

async fn connect(address: &str) -> Result<BoxedStream, DialError> {
    let tcp = TcpStream::connect(address).await.context(ConnectSnafu { address })?;
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(address, error = %e, "Failed to set TCP_NODELAY");
    }
    Ok(Box::new(tcp))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Dialed stream that reports its own teardown.
struct TrackedStream {
    inner: BoxedStream,
    address: String,
    metrics: Arc<dyn PoolMetrics>,
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.metrics.record_connection(&self.address, ConnectionEvent::Disconnected);
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Tower connector bound to one address.
///
/// The first connection handed to tonic is the stream dialed while picking
/// the address; every later call (HTTP/2 reconnects) dials afresh.
#[derive(Clone)]
pub(crate) struct DialConnector {
    dialer: Dialer,
    datacenter: Arc<str>,
    address: ResolvedAddress,
    primed: Arc<Mutex<Option<BoxedStream>>>,
}

impl DialConnector {
    pub(crate) fn primed(
        dialer: Dialer,
        datacenter: &str,
        address: ResolvedAddress,
        stream: BoxedStream,
    ) -> Self {
        Self {
            dialer,
            datacenter: Arc::from(datacenter),
            address,
            primed: Arc::new(Mutex::new(Some(stream))),
        }
    }
}

impl Service<Uri> for DialConnector {
    type Response = TokioIo<BoxedStream>;
    type Error = DialError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let primed = self.primed.lock().take();
        let dialer = self.dialer.clone();
        let datacenter = Arc::clone(&self.datacenter);
        let address = self.address.clone();

        Box::pin(async move {
            let stream = match primed {
                Some(stream) => stream,
                None => dialer.dial(&datacenter, &address).await?,
            };
            Ok(TokioIo::new(stream))
        })
    }
}
