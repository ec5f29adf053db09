//! Cache of logical connections keyed by datacenter and target kind.
//!
//! The [`ConnectionPool`] hands out one [`ClientConn`] per `(datacenter, kind)`
//! pair and reuses it for every later caller. Connections are built eagerly:
//! resolution and dial failures surface at acquisition, and a failed
//! acquisition leaves nothing cached, so the next call tries again.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;
use snafu::ensure;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::{
    builder::BuilderRegistry,
    config::PoolConfig,
    connection::ClientConn,
    dialer::Dialer,
    error::{Result, ShutdownSnafu},
    target::{TargetKind, TargetName},
};

/// Cache key of a logical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    /// Target datacenter.
    pub datacenter: String,
    /// Any server or the leader.
    pub kind: TargetKind,
}

impl PoolKey {
    /// Creates a key.
    #[must_use]
    pub fn new(datacenter: impl Into<String>, kind: TargetKind) -> Self {
        Self { datacenter: datacenter.into(), kind }
    }
}

/// Datacenter-aware connection pool.
///
/// Cloning is cheap and every clone shares the same cache.
///
/// # Example
///
/// ```no_run
/// # use inferadb_ledger_rpc_pool::{BuilderRegistry, ConnectionPool, PoolConfig, ResolverBuilder};
/// # async fn example() -> inferadb_ledger_rpc_pool::Result<()> {
/// let builders = BuilderRegistry::new();
/// builders.register(ResolverBuilder::new("cluster-a"));
///
/// let config = PoolConfig::builder().authority("cluster-a").local_datacenter("dc1").build()?;
/// let pool = ConnectionPool::new(config, builders);
///
/// let remote = pool.client_conn("dc2").await?;
/// let leader = pool.client_conn_leader().await?;
/// # drop((remote, leader));
/// pool.shutdown();
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    config: PoolConfig,
    builders: BuilderRegistry,
    dialer: Dialer,
    connections: DashMap<PoolKey, Arc<OnceCell<ClientConn>>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Creates a pool resolving targets through `builders`.
    ///
    /// No connection is made until the first acquisition.
    #[must_use]
    pub fn new(config: PoolConfig, builders: BuilderRegistry) -> Self {
        let dialer = Dialer::with_metrics(config.dialer().clone(), Arc::clone(config.metrics()));
        Self {
            inner: Arc::new(PoolInner {
                config,
                builders,
                dialer,
                connections: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Returns the connection to any server of `datacenter`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Resolution`](crate::PoolError::Resolution) if no
    /// server is known in `datacenter`, a dial or transport error if none can
    /// be reached, [`PoolError::UnknownAuthority`](crate::PoolError::UnknownAuthority)
    /// if the configured authority has no registered builder, or
    /// [`PoolError::Shutdown`](crate::PoolError::Shutdown) after shutdown.
    pub async fn client_conn(&self, datacenter: &str) -> Result<ClientConn> {
        self.get_or_connect(PoolKey::new(datacenter, TargetKind::Server)).await
    }

    /// Returns the connection to the leader of the local datacenter.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Resolution`](crate::PoolError::Resolution) while
    /// no leader address is known, and otherwise fails like
    /// [`client_conn`](Self::client_conn).
    pub async fn client_conn_leader(&self) -> Result<ClientConn> {
        let datacenter = self.inner.config.local_datacenter().to_owned();
        self.get_or_connect(PoolKey::new(datacenter, TargetKind::Leader)).await
    }

    /// Closes and forgets the local leader connection.
    ///
    /// The next [`client_conn_leader`](Self::client_conn_leader) builds a
    /// fresh one. Leader changes are followed without this; it exists for
    /// callers that want a clean connection after a leadership transfer.
    pub fn reset_leader(&self) {
        let key = PoolKey::new(self.inner.config.local_datacenter(), TargetKind::Leader);
        if let Some((_, cell)) = self.inner.connections.remove(&key)
            && let Some(conn) = cell.get()
        {
            conn.close();
            debug!(datacenter = %key.datacenter, "Reset leader connection");
        }
    }

    /// Returns the keys of every established connection, sorted.
    #[must_use]
    pub fn active_keys(&self) -> Vec<PoolKey> {
        let mut keys: Vec<_> = self
            .inner
            .connections
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Returns whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes every cached connection exactly once and rejects later
    /// acquisitions. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let keys: Vec<_> = self.inner.connections.iter().map(|entry| entry.key().clone()).collect();
        let mut closed = 0usize;
        for key in keys {
            if let Some((_, cell)) = self.inner.connections.remove(&key)
                && let Some(conn) = cell.get()
            {
                conn.close();
                closed += 1;
            }
        }
        info!(connections = closed, "Connection pool shut down");
    }

    async fn get_or_connect(&self, key: PoolKey) -> Result<ClientConn> {
        ensure!(!self.is_shutdown(), ShutdownSnafu);

        let cell = Arc::clone(&self.inner.connections.entry(key.clone()).or_default());
        let conn = cell.get_or_try_init(|| self.connect(&key)).await?.clone();

        // Lost a race with shutdown: the drain may have missed this cell.
        if self.is_shutdown() {
            conn.close();
            return ShutdownSnafu.fail();
        }
        Ok(conn)
    }

    async fn connect(&self, key: &PoolKey) -> Result<ClientConn> {
        let target = TargetName::new(self.inner.config.authority(), key.kind, &key.datacenter);
        let resolver = self.inner.builders.build(&target)?;
        debug!(target_name = %target, "Creating client connection");

        ClientConn::connect(
            resolver,
            self.inner.dialer.clone(),
            self.inner.config.connection_settings(),
            Arc::clone(self.inner.config.metrics()),
        )
        .await
    }
}
