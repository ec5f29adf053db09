//! Pool-side metrics for observability and operational monitoring.
//!
//! This module provides a pluggable metrics trait (`PoolMetrics`) that the
//! owning process can implement to collect telemetry from the pool. Two
//! implementations are included:
//!
//! - [`NoopPoolMetrics`]: Zero-overhead default that discards all metrics.
//! - [`MetricsPoolMetrics`]: Integration with the [`metrics`](https://docs.rs/metrics) crate facade,
//!   forwarding to whatever recorder is installed (Prometheus, StatsD, etc.).
//!
//! # Metric Names
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `ledger_rpc_pool_connections_total` | Counter | `address`, `event` | Physical connection lifecycle |
//! | `ledger_rpc_pool_picks_total` | Counter | `target` | Logical connection moved to a new address |
//! | `ledger_rpc_pool_rebalances_total` | Counter | `datacenter` | Rebalance invocations |
//! | `ledger_rpc_pool_rebalance_servers` | Gauge | `datacenter` | Servers shuffled by the last rebalance |
//! | `ledger_rpc_pool_stale_subscriptions_total` | Counter | `datacenter` | Subscriptions pruned because the resolver was gone |

use std::{fmt, sync::Arc};

/// Events for physical connection lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A new connection was established.
    Connected,
    /// A connection was closed or dropped.
    Disconnected,
    /// A connection attempt failed.
    Failed,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Trait for pool-side metrics collection.
///
/// All methods have default no-op implementations, so implementors only
/// override what they care about.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: one instance is shared by the
/// registry, the dialer and every logical connection.
pub trait PoolMetrics: Send + Sync + fmt::Debug {
    /// Records a physical connection lifecycle event for `address`.
    fn record_connection(&self, address: &str, event: ConnectionEvent) {
        let _ = (address, event);
    }

    /// Records that the logical connection for `target` now uses `address`.
    fn record_pick(&self, target: &str, address: &str) {
        let _ = (target, address);
    }

    /// Records a rebalance of `datacenter` over `servers` known servers.
    fn record_rebalance(&self, datacenter: &str, servers: usize) {
        let _ = (datacenter, servers);
    }

    /// Records a subscription pruned because its resolver disappeared without closing.
    fn record_stale_subscription(&self, datacenter: &str) {
        let _ = datacenter;
    }
}

/// No-op metrics implementation.
#[derive(Debug, Clone, Copy)]
pub struct NoopPoolMetrics;

impl PoolMetrics for NoopPoolMetrics {}

/// Metrics implementation using the [`metrics`](https://docs.rs/metrics) crate facade.
///
/// All metric names use the `ledger_rpc_pool_` prefix.
#[derive(Debug, Clone, Copy)]
pub struct MetricsPoolMetrics;

mod metric_names {
    pub const CONNECTIONS_TOTAL: &str = "ledger_rpc_pool_connections_total";
    pub const PICKS_TOTAL: &str = "ledger_rpc_pool_picks_total";
    pub const REBALANCES_TOTAL: &str = "ledger_rpc_pool_rebalances_total";
    pub const REBALANCE_SERVERS: &str = "ledger_rpc_pool_rebalance_servers";
    pub const STALE_SUBSCRIPTIONS_TOTAL: &str = "ledger_rpc_pool_stale_subscriptions_total";
}

impl PoolMetrics for MetricsPoolMetrics {
    fn record_connection(&self, address: &str, event: ConnectionEvent) {
        metrics::counter!(
            metric_names::CONNECTIONS_TOTAL,
            "address" => address.to_owned(),
            "event" => event.to_string(),
        )
        .increment(1);
    }

    fn record_pick(&self, target: &str, _address: &str) {
        metrics::counter!(metric_names::PICKS_TOTAL, "target" => target.to_owned()).increment(1);
    }

    fn record_rebalance(&self, datacenter: &str, servers: usize) {
        metrics::counter!(metric_names::REBALANCES_TOTAL, "datacenter" => datacenter.to_owned())
            .increment(1);
        metrics::gauge!(metric_names::REBALANCE_SERVERS, "datacenter" => datacenter.to_owned())
            .set(servers as f64);
    }

    fn record_stale_subscription(&self, datacenter: &str) {
        metrics::counter!(
            metric_names::STALE_SUBSCRIPTIONS_TOTAL,
            "datacenter" => datacenter.to_owned(),
        )
        .increment(1);
    }
}

/// Creates the default metrics instance (no-op).
pub(crate) fn default_metrics() -> Arc<dyn PoolMetrics> {
    Arc::new(NoopPoolMetrics)
}
