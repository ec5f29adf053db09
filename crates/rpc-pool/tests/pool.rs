//! Pool-level behavior: multi-datacenter routing, concurrent acquisition and
//! shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use inferadb_ledger_rpc_pool::{PoolError, PoolKey, TargetKind};
use inferadb_ledger_test_utils::{TestServer, assert_eventually};
use tonic::Code;

use crate::common::{Harness, WAIT, served_by, served_from};

#[tokio::test]
async fn test_one_authority_serves_every_datacenter() {
    let harness = Harness::new("multi-dc");
    let mut servers = Vec::new();
    for dc in ["dc1", "dc2", "dc3"] {
        let server = TestServer::start(format!("node-{dc}"), dc).await;
        harness.add(&server);
        servers.push(server);
    }

    for dc in ["dc1", "dc2", "dc3"] {
        let conn = harness.pool.client_conn(dc).await.unwrap();
        assert_eq!(conn.target().datacenter(), dc);
        assert_eq!(served_from(&conn).await.unwrap(), dc);
    }

    assert_eq!(
        harness.pool.active_keys(),
        [
            PoolKey::new("dc1", TargetKind::Server),
            PoolKey::new("dc2", TargetKind::Server),
            PoolKey::new("dc3", TargetKind::Server),
        ]
    );
    for server in &servers {
        assert_eq!(server.accepted(), 1);
    }
}

#[tokio::test]
async fn test_concurrent_acquisition_shares_one_connection() {
    let harness = Harness::new("concurrent");
    let server = TestServer::start("shared", "dc1").await;
    harness.add(&server);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let pool = harness.pool.clone();
            tokio::spawn(async move { pool.client_conn("dc1").await })
        })
        .collect();

    for task in tasks {
        let conn = task.await.unwrap().unwrap();
        assert_eq!(served_by(&conn).await.unwrap(), "shared");
    }
    assert_eq!(server.accepted(), 1);
    assert_eq!(harness.builder.registry().subscription_count("dc1"), 1);
}

#[tokio::test]
async fn test_server_and_leader_targets_are_separate() {
    let harness = Harness::new("kinds");
    let server = TestServer::start("both", "dc1").await;
    harness.add(&server);
    harness.builder.update_leader_addr("dc1", &server.address());

    let any = harness.pool.client_conn("dc1").await.unwrap();
    let leader = harness.pool.client_conn_leader().await.unwrap();
    assert_eq!(any.target().kind(), TargetKind::Server);
    assert_eq!(leader.target().kind(), TargetKind::Leader);

    assert_eq!(served_by(&any).await.unwrap(), "both");
    assert_eq!(served_by(&leader).await.unwrap(), "both");
    assert!(assert_eventually(WAIT, || server.accepted() == 2).await);
}

#[tokio::test]
async fn test_shutdown_fails_outstanding_handles() {
    let harness = Harness::new("shutdown");
    let server = TestServer::start("node", "dc1").await;
    harness.add(&server);

    let conn = harness.pool.client_conn("dc1").await.unwrap();
    assert_eq!(served_by(&conn).await.unwrap(), "node");

    harness.pool.shutdown();
    assert!(conn.is_closed());
    assert_eq!(served_by(&conn).await.unwrap_err().code(), Code::Unavailable);
    assert_eq!(harness.builder.registry().subscription_count("dc1"), 0);

    let err = harness.pool.client_conn("dc1").await.unwrap_err();
    assert!(matches!(err, PoolError::Shutdown));
    assert!(!err.is_retryable());
}
