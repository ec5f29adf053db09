//! Datacenter-aware gRPC connection pool for InferaDB Ledger nodes.
//!
//! Nodes of a multi-datacenter cluster talk to each other through this crate.
//! It discovers live servers per datacenter from an in-process registry,
//! pins each logical connection to one server while that server stays known
//! and healthy, fails over transparently when it disappears, routes to the
//! current leader when asked, and reshuffles deliberately to spread load.
//!
//! # Features
//!
//! - **Registry-driven resolution**: membership and leader changes are pushed
//!   to every live connection of the datacenter without blocking the writer
//! - **Pick-first with failover**: one physical connection per target, moved
//!   to the next address on removal or transport failure
//! - **Leader routing**: leader targets resolve to the announced leader only
//! - **Deliberate rebalancing**: uniform random reshuffles on demand or on a
//!   timer
//! - **Per-destination transport**: optional connection prefix byte and an
//!   injected TLS wrap function selected per datacenter
//! - **Mesh gateways**: servers reach remote datacenters through a gateway
//!   address with an injected ALPN wrap function
//!
//! # Quick Start
//!
//! ```no_run
//! use inferadb_ledger_rpc_pool::{
//!     BuilderRegistry, ConnectionPool, PoolConfig, ResolverBuilder, ServerEndpoint,
//! };
//!
//! # async fn example() -> inferadb_ledger_rpc_pool::Result<()> {
//! let builder = ResolverBuilder::new("cluster-a");
//! builder.add_server(
//!     ServerEndpoint::builder()
//!         .id("a1")
//!         .name("server-1")
//!         .datacenter("dc1")
//!         .address("10.0.0.1:8300")
//!         .build(),
//! );
//! builder.update_leader_addr("dc1", "10.0.0.1:8300");
//!
//! let builders = BuilderRegistry::new();
//! builders.register(builder.clone());
//!
//! let config = PoolConfig::builder().authority("cluster-a").local_datacenter("dc1").build()?;
//! let pool = ConnectionPool::new(config, builders);
//!
//! // Any tonic generated client accepts a `ClientConn`.
//! let conn = pool.client_conn_leader().await?;
//! # drop(conn);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionPool (Public API)                 │
//! │   .client_conn(dc) │ .client_conn_leader() │ .shutdown()    │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  ClientConn (pick-first)                    │
//! │   tower::Service │ Driver task │ Failover │ Backoff (backon)│
//! ├───────────────────────────────┬─────────────────────────────┤
//! │  AddressResolver              │  Dialer                     │
//! │  Watch subscription │ Re-resolve │ Prefix byte │ TLS wrap   │
//! ├───────────────────────────────┴─────────────────────────────┤
//! │        ServerRegistry ◄── ResolverBuilder ◄── Rebalancer    │
//! │   Per-datacenter order │ Leader address │ Subscriptions     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod config;
mod connection;
mod dialer;
mod endpoint;
mod error;
mod metrics;
mod pool;
mod rebalance;
mod registry;
mod resolver;
mod target;

// Public API exports
pub use builder::{BuilderRegistry, ResolverBuilder};
pub use config::{
    DEFAULT_DIAL_TIMEOUT, DEFAULT_FAILOVER_WAIT, DEFAULT_KEEPALIVE_INTERVAL,
    DEFAULT_KEEPALIVE_TIMEOUT, DEFAULT_RECONNECT_MAX_BACKOFF, DEFAULT_RECONNECT_MIN_BACKOFF,
    DialerConfig, PoolConfig,
};
pub use connection::ClientConn;
pub use dialer::{
    AlpnWrapper, BoxedStream, Dialer, GRPC_ALPN_PROTOCOL, GatewayResolver, Stream, TlsPredicate,
    TlsWrapper, gateway_resolver, tls_predicate,
};
pub use endpoint::{ResolvedAddress, ServerEndpoint};
pub use error::{DialError, PoolError, Result};
pub use metrics::{ConnectionEvent, MetricsPoolMetrics, NoopPoolMetrics, PoolMetrics};
pub use pool::{ConnectionPool, PoolKey};
pub use rebalance::{PeriodicRebalance, Rebalancer};
pub use registry::ServerRegistry;
pub use resolver::{AddressResolver, ResolverState};
pub use target::{SCHEME, TargetKind, TargetName};
