//! Test harness for pool integration tests.
//!
//! Wires a [`ConnectionPool`] to a fresh registry and starts in-process
//! servers that report their identity on every response.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use inferadb_ledger_rpc_pool::{
    AlpnWrapper, BoxedStream, BuilderRegistry, ClientConn, ConnectionEvent, ConnectionPool,
    DialerConfig, PoolConfig, PoolMetrics, ResolverBuilder, ServerEndpoint, TlsWrapper,
};
use inferadb_ledger_test_utils::TestServer;
use parking_lot::Mutex;
use tonic::Status;
use tonic_health::pb::{HealthCheckRequest, health_client::HealthClient};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound for conditions that depend on background work.
pub const WAIT: Duration = Duration::from_secs(5);

/// Installs a test-writer subscriber once per test binary.
///
/// Filtered by `RUST_LOG`, defaulting to warnings from this crate.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("inferadb_ledger_rpc_pool=warn"));
    // A second install in the same binary fails harmlessly.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}

/// A pool plus the builder feeding it.
pub struct Harness {
    pub pool: ConnectionPool,
    pub builder: ResolverBuilder,
    pub metrics: Arc<RecordingMetrics>,
}

impl Harness {
    /// Pool with default dialer settings and `dc1` as the local datacenter.
    pub fn new(authority: &str) -> Self {
        Self::with_dialer(authority, DialerConfig::default())
    }

    pub fn with_dialer(authority: &str, dialer: DialerConfig) -> Self {
        init_tracing();
        let metrics = Arc::new(RecordingMetrics::default());
        let builder = ResolverBuilder::with_metrics(authority, metrics.clone());
        let builders = BuilderRegistry::new();
        builders.register(builder.clone());

        let config = PoolConfig::builder()
            .authority(authority)
            .local_datacenter("dc1")
            .reconnect_min_backoff(Duration::from_millis(10))
            .reconnect_max_backoff(Duration::from_millis(100))
            .dialer(dialer)
            .metrics(metrics.clone())
            .build()
            .unwrap();

        Self { pool: ConnectionPool::new(config, builders), builder, metrics }
    }

    /// Announces `server` to the registry.
    pub fn add(&self, server: &TestServer) {
        self.builder.add_server(endpoint_for(server));
    }

    /// Withdraws `server` from the registry.
    pub fn remove(&self, server: &TestServer) {
        self.builder.remove_server(server.name(), server.datacenter());
    }
}

pub fn endpoint_for(server: &TestServer) -> ServerEndpoint {
    ServerEndpoint::builder()
        .id(server.name())
        .name(server.name())
        .datacenter(server.datacenter())
        .address(server.address())
        .build()
}

/// Starts `count` servers named `{prefix}-{n}` in `datacenter`.
pub async fn start_servers(prefix: &str, datacenter: &str, count: usize) -> Vec<TestServer> {
    let mut servers = Vec::with_capacity(count);
    for n in 0..count {
        servers.push(TestServer::start(format!("{prefix}-{n}"), datacenter).await);
    }
    servers
}

/// Issues one health check and returns the name of the server that answered.
pub async fn served_by(conn: &ClientConn) -> Result<String, Status> {
    let response = HealthClient::new(conn.clone())
        .check(HealthCheckRequest { service: String::new() })
        .await?;
    Ok(TestServer::served_by(response.metadata()).expect("identity header"))
}

/// Issues one health check and returns the datacenter of the server that answered.
pub async fn served_from(conn: &ClientConn) -> Result<String, Status> {
    let response = HealthClient::new(conn.clone())
        .check(HealthCheckRequest { service: String::new() })
        .await?;
    Ok(TestServer::served_from(response.metadata()).expect("identity header"))
}

/// Metrics sink that keeps what it is told.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    pub connections: Mutex<Vec<(String, ConnectionEvent)>>,
    pub picks: Mutex<Vec<(String, String)>>,
    pub rebalances: AtomicUsize,
}

impl RecordingMetrics {
    pub fn connected(&self, address: &str) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|(a, e)| a == address && *e == ConnectionEvent::Connected)
            .count()
    }

    pub fn picked(&self) -> Vec<String> {
        self.picks.lock().iter().map(|(_, address)| address.clone()).collect()
    }
}

impl PoolMetrics for RecordingMetrics {
    fn record_connection(&self, address: &str, event: ConnectionEvent) {
        self.connections.lock().push((address.to_owned(), event));
    }

    fn record_pick(&self, target: &str, address: &str) {
        self.picks.lock().push((target.to_owned(), address.to_owned()));
    }

    fn record_rebalance(&self, _datacenter: &str, _servers: usize) {
        self.rebalances.fetch_add(1, Ordering::SeqCst);
    }
}

/// TLS stand-in that records each handshake and passes the stream through.
#[derive(Debug, Default)]
pub struct PassthroughTls {
    pub server_names: Mutex<Vec<String>>,
}

impl TlsWrapper for PassthroughTls {
    fn wrap(
        &self,
        server_name: &str,
        stream: BoxedStream,
    ) -> BoxFuture<'static, io::Result<BoxedStream>> {
        self.server_names.lock().push(server_name.to_owned());
        Box::pin(async move { Ok(stream) })
    }
}

/// Gateway stand-in that records each ALPN handshake and passes the stream through.
#[derive(Debug, Default)]
pub struct PassthroughAlpn {
    pub handshakes: Mutex<Vec<(String, String, String)>>,
}

impl AlpnWrapper for PassthroughAlpn {
    fn wrap(
        &self,
        datacenter: &str,
        node_name: &str,
        protocol: &str,
        stream: BoxedStream,
    ) -> BoxFuture<'static, io::Result<BoxedStream>> {
        self.handshakes.lock().push((
            datacenter.to_owned(),
            node_name.to_owned(),
            protocol.to_owned(),
        ));
        Box::pin(async move { Ok(stream) })
    }
}
