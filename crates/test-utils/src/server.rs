//! In-process gRPC server for connection tests.
//!
//! A [`TestServer`] listens on an ephemeral loopback port and serves the
//! standard gRPC health service. Every response carries the serving node's
//! name and datacenter as metadata, so a test can tell which server a
//! logical connection is currently pinned to. The server also counts
//! accepted TCP connections and, when configured, strips and records a
//! leading connection-type byte.

// Test utilities are expected to panic on setup failure
#![allow(clippy::expect_used)]

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use futures::{Stream, future::BoxFuture};
use http::{HeaderName, HeaderValue};
use parking_lot::Mutex;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tonic::{metadata::MetadataMap, transport::Server};
use tower::{Layer, Service};

/// Response metadata key carrying the serving node's name.
pub const SERVER_NAME_HEADER: &str = "x-server-name";

/// Response metadata key carrying the serving node's datacenter.
pub const DATACENTER_HEADER: &str = "x-datacenter";

/// How long the server waits for an expected prefix byte.
const PREFIX_TIMEOUT: Duration = Duration::from_secs(2);

/// Options for starting a [`TestServer`].
#[derive(Debug, Clone, bon::Builder)]
pub struct TestServerConfig {
    /// Node name reported in responses.
    #[builder(into)]
    name: String,
    /// Datacenter reported in responses.
    #[builder(into)]
    datacenter: String,
    /// Read one connection-type byte from every accepted connection before
    /// handing it to HTTP/2.
    #[builder(default)]
    expect_prefix: bool,
}

impl TestServerConfig {
    /// Starts a server with these options.
    ///
    /// # Panics
    ///
    /// Panics if the loopback listener cannot be bound.
    pub async fn start(self) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback listener");
        let address = listener.local_addr().expect("listener address");

        let accepted = Arc::new(AtomicUsize::new(0));
        let prefixes = Arc::new(Mutex::new(Vec::new()));
        let incoming = incoming(
            listener,
            Arc::clone(&accepted),
            self.expect_prefix.then(|| Arc::clone(&prefixes)),
        );

        let identity = IdentityLayer {
            name: HeaderValue::from_str(&self.name).expect("name is a valid header value"),
            datacenter: HeaderValue::from_str(&self.datacenter)
                .expect("datacenter is a valid header value"),
        };
        let (_reporter, health) = tonic_health::server::health_reporter();

        let (shutdown, signal) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let result = Server::builder()
                .layer(identity)
                .add_service(health)
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = signal.await;
                })
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, "Test server exited with error");
            }
        });

        tracing::debug!(name = %self.name, %address, "Test server listening");
        TestServer {
            name: self.name,
            datacenter: self.datacenter,
            address,
            accepted,
            prefixes,
            shutdown: Some(shutdown),
            handle: Some(handle),
        }
    }
}

/// Running test server. Shuts down when stopped or dropped.
#[derive(Debug)]
pub struct TestServer {
    name: String,
    datacenter: String,
    address: SocketAddr,
    accepted: Arc<AtomicUsize>,
    prefixes: Arc<Mutex<Vec<u8>>>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Starts a plain server named `name` in `datacenter`.
    pub async fn start(name: impl Into<String>, datacenter: impl Into<String>) -> Self {
        TestServerConfig::builder().name(name).datacenter(datacenter).build().start().await
    }

    /// Returns the node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the datacenter.
    #[must_use]
    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    /// Returns the listening address as `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        self.address.to_string()
    }

    /// Returns the number of TCP connections accepted so far.
    #[must_use]
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Returns the prefix bytes read so far, one per connection.
    #[must_use]
    pub fn prefixes(&self) -> Vec<u8> {
        self.prefixes.lock().clone()
    }

    /// Extracts the serving node's name from response metadata.
    #[must_use]
    pub fn served_by(metadata: &MetadataMap) -> Option<String> {
        metadata.get(SERVER_NAME_HEADER)?.to_str().ok().map(str::to_owned)
    }

    /// Extracts the serving node's datacenter from response metadata.
    #[must_use]
    pub fn served_from(metadata: &MetadataMap) -> Option<String> {
        metadata.get(DATACENTER_HEADER)?.to_str().ok().map(str::to_owned)
    }

    /// Stops accepting requests and waits briefly for the server to exit.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take()
            && tokio::time::timeout(Duration::from_secs(2), handle).await.is_err()
        {
            tracing::debug!(name = %self.name, "Test server did not stop in time");
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Accepted connections, counted and optionally stripped of their prefix.
///
/// Each prefix is read on its own task so a silent client never holds up
/// the accept loop. The loop ends once the server drops the stream.
fn incoming(
    listener: TcpListener,
    accepted: Arc<AtomicUsize>,
    prefixes: Option<Arc<Mutex<Vec<u8>>>>,
) -> impl Stream<Item = io::Result<TcpStream>> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let conn = tokio::select! {
                () = tx.closed() => return,
                conn = listener.accept() => conn,
            };
            let mut stream = match conn {
                Ok((stream, _)) => stream,
                Err(e) => {
                    if tx.send(Err(e)).is_err() {
                        return;
                    }
                    continue;
                },
            };
            accepted.fetch_add(1, Ordering::SeqCst);

            let Some(prefixes) = prefixes.clone() else {
                let _ = tx.send(Ok(stream));
                continue;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut prefix = [0u8; 1];
                // Closed or silent before sending a prefix; drop it.
                if let Ok(Ok(_)) =
                    tokio::time::timeout(PREFIX_TIMEOUT, stream.read_exact(&mut prefix)).await
                {
                    prefixes.lock().push(prefix[0]);
                    let _ = tx.send(Ok(stream));
                }
            });
        }
    });

    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|conn| (conn, rx)) })
}

/// Adds the identity headers to every response.
#[derive(Debug, Clone)]
struct IdentityLayer {
    name: HeaderValue,
    datacenter: HeaderValue,
}

impl<S> Layer<S> for IdentityLayer {
    type Service = Identity<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Identity { inner, name: self.name.clone(), datacenter: self.datacenter.clone() }
    }
}

#[derive(Debug, Clone)]
struct Identity<S> {
    inner: S,
    name: HeaderValue,
    datacenter: HeaderValue,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for Identity<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<ReqBody>) -> Self::Future {
        let response = self.inner.call(request);
        let name = self.name.clone();
        let datacenter = self.datacenter.clone();

        Box::pin(async move {
            let mut response = response.await?;
            let headers = response.headers_mut();
            headers.insert(HeaderName::from_static(SERVER_NAME_HEADER), name);
            headers.insert(HeaderName::from_static(DATACENTER_HEADER), datacenter);
            Ok(response)
        })
    }
}
