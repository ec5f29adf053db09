//! Per-destination transport options: connection prefix and TLS selection.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::Arc;

use inferadb_ledger_rpc_pool::{
    DialError, DialerConfig, GRPC_ALPN_PROTOCOL, PoolError, ServerEndpoint, gateway_resolver,
    tls_predicate,
};
use inferadb_ledger_test_utils::{TestServer, TestServerConfig, assert_eventually};

use crate::common::{Harness, PassthroughAlpn, PassthroughTls, WAIT, served_by};

fn tls_endpoint(server: &TestServer, name: &str) -> ServerEndpoint {
    ServerEndpoint::builder()
        .id(server.name())
        .name(name)
        .datacenter(server.datacenter())
        .address(server.address())
        .use_tls(true)
        .build()
}

#[tokio::test]
async fn test_prefix_written_once_per_connection() {
    let harness = Harness::with_dialer("prefix", DialerConfig::builder().prefix(0x03).build());
    let server = TestServerConfig::builder()
        .name("prefixed")
        .datacenter("dc1")
        .expect_prefix(true)
        .build()
        .start()
        .await;
    harness.add(&server);

    let conn = harness.pool.client_conn("dc1").await.unwrap();
    for _ in 0..3 {
        assert_eq!(served_by(&conn).await.unwrap(), "prefixed");
    }

    assert_eq!(server.prefixes(), [0x03]);
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn test_tls_selected_per_datacenter() {
    let tls = Arc::new(PassthroughTls::default());
    let dialer = DialerConfig::builder()
        .use_tls_for_dc(tls_predicate(|dc| dc == "dc2"))
        .tls_wrapper(tls.clone())
        .build();
    let harness = Harness::with_dialer("tls-per-dc", dialer);

    // Both endpoints ask for TLS; only dc2's predicate agrees.
    let local = TestServer::start("local", "dc1").await;
    let remote = TestServer::start("remote", "dc2").await;
    harness.builder.add_server(tls_endpoint(&local, "local"));
    harness.builder.add_server(tls_endpoint(&remote, "remote"));

    let local_conn = harness.pool.client_conn("dc1").await.unwrap();
    let remote_conn = harness.pool.client_conn("dc2").await.unwrap();
    assert_eq!(served_by(&local_conn).await.unwrap(), "local");
    assert_eq!(served_by(&remote_conn).await.unwrap(), "remote");

    assert_eq!(*tls.server_names.lock(), ["remote"]);
}

#[tokio::test]
async fn test_endpoint_flag_without_predicate_dials_plaintext() {
    let tls = Arc::new(PassthroughTls::default());
    let harness =
        Harness::with_dialer("tls-flag", DialerConfig::builder().tls_wrapper(tls.clone()).build());

    let server = TestServer::start("secure", "dc1").await;
    harness.builder.add_server(tls_endpoint(&server, "secure.dc1.internal"));

    let conn = harness.pool.client_conn("dc1").await.unwrap();
    assert_eq!(served_by(&conn).await.unwrap(), "secure");
    assert!(tls.server_names.lock().is_empty());
}

#[tokio::test]
async fn test_tls_without_wrapper_fails_acquisition() {
    let dialer = DialerConfig::builder().use_tls_for_dc(tls_predicate(|_| true)).build();
    let harness = Harness::with_dialer("tls-missing", dialer);

    let server = TestServer::start("secure", "dc1").await;
    harness.builder.add_server(tls_endpoint(&server, "secure"));

    let err = harness.pool.client_conn("dc1").await.unwrap_err();
    assert!(
        matches!(err, PoolError::Dial { source: DialError::TlsWrapperMissing { .. }, .. }),
        "got {err}"
    );
    assert!(harness.pool.active_keys().is_empty());
}

#[tokio::test]
async fn test_leader_identity_drives_tls_server_name() {
    let tls = Arc::new(PassthroughTls::default());
    let dialer = DialerConfig::builder()
        .use_tls_for_dc(tls_predicate(|_| true))
        .tls_wrapper(tls.clone())
        .build();
    let harness = Harness::with_dialer("tls-leader", dialer);

    let leader = TestServer::start("leader", "dc1").await;
    harness.builder.add_server(tls_endpoint(&leader, "leader.dc1.internal"));
    harness.builder.update_leader_addr("dc1", &leader.address());

    let conn = harness.pool.client_conn_leader().await.unwrap();
    assert_eq!(served_by(&conn).await.unwrap(), "leader");
    assert_eq!(*tls.server_names.lock(), ["leader.dc1.internal"]);
}

#[tokio::test]
async fn test_bare_leader_dials_plaintext() {
    let tls = Arc::new(PassthroughTls::default());
    let dialer = DialerConfig::builder()
        .use_tls_for_dc(tls_predicate(|_| true))
        .tls_wrapper(tls.clone())
        .build();
    let harness = Harness::with_dialer("bare-leader", dialer);

    // Leader announced without a server record: no TLS flag to honor.
    let leader = TestServer::start("leader", "dc1").await;
    harness.builder.update_leader_addr("dc1", &leader.address());

    let conn = harness.pool.client_conn_leader().await.unwrap();
    assert_eq!(served_by(&conn).await.unwrap(), "leader");
    assert!(tls.server_names.lock().is_empty());
}

#[tokio::test]
async fn test_server_reaches_remote_datacenter_through_gateway() {
    let gateway = TestServer::start("gateway", "dc2").await;
    let gateway_address = gateway.address();
    let alpn = Arc::new(PassthroughAlpn::default());
    let dialer = DialerConfig::builder()
        .gateway_resolver(gateway_resolver(move |dc| {
            (dc == "dc2").then(|| gateway_address.clone())
        }))
        .alpn_wrapper(alpn.clone())
        .dialing_from_server(true)
        .build();
    let harness = Harness::with_dialer("gateway", dialer);

    // The remote server's own address is not reachable from here.
    let unreachable = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_address = unreachable.local_addr().unwrap().to_string();
    drop(unreachable);
    harness.builder.add_server(
        ServerEndpoint::builder()
            .id("remote-1")
            .name("remote-1")
            .datacenter("dc2")
            .address(remote_address)
            .build(),
    );
    let local = TestServer::start("local", "dc1").await;
    harness.add(&local);

    let remote_conn = harness.pool.client_conn("dc2").await.unwrap();
    assert_eq!(served_by(&remote_conn).await.unwrap(), "gateway");
    assert_eq!(
        *alpn.handshakes.lock(),
        [("dc2".to_owned(), "remote-1".to_owned(), GRPC_ALPN_PROTOCOL.to_owned())]
    );

    let local_conn = harness.pool.client_conn("dc1").await.unwrap();
    assert_eq!(served_by(&local_conn).await.unwrap(), "local");
    assert_eq!(alpn.handshakes.lock().len(), 1);
}

#[tokio::test]
async fn test_connection_metrics_track_dials() {
    let harness = Harness::new("dial-metrics");
    let server = TestServer::start("counted", "dc1").await;
    harness.add(&server);

    let conn = harness.pool.client_conn("dc1").await.unwrap();
    served_by(&conn).await.unwrap();
    assert_eq!(harness.metrics.connected(&server.address()), 1);

    harness.pool.shutdown();
    drop(conn);
    assert!(assert_eventually(WAIT, || {
        harness.metrics.connections.lock().iter().any(|(address, event)| {
            *address == server.address()
                && *event == inferadb_ledger_rpc_pool::ConnectionEvent::Disconnected
        })
    })
    .await);
}
