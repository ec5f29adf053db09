//! Pool and dialer configuration.
//!
//! Provides type-safe configuration for the connection pool including:
//! - Target authority and local datacenter
//! - Dial timeout, TLS selection and connection prefix
//! - HTTP/2 keep-alive settings
//! - Reconnect backoff after every address of a target failed
//!
//! Configuration is immutable once the pool is built.

use std::{fmt, sync::Arc, time::Duration};

use backon::ExponentialBuilder;
use snafu::ensure;

use crate::{
    dialer::{AlpnWrapper, GatewayResolver, TlsPredicate, TlsWrapper},
    error::{ConfigSnafu, Result},
    metrics::{PoolMetrics, default_metrics},
};

/// Default dial timeout (5 seconds).
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP/2 keep-alive interval for idle connections.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// HTTP/2 keep-alive timeout.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a request waits for a pending re-pick to settle.
pub const DEFAULT_FAILOVER_WAIT: Duration = Duration::from_secs(2);

/// Default initial delay before re-picking after every address failed.
pub const DEFAULT_RECONNECT_MIN_BACKOFF: Duration = Duration::from_millis(100);

/// Default cap on the re-pick delay.
pub const DEFAULT_RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(10);

fn default_tls_predicate() -> TlsPredicate {
    Arc::new(|_| false)
}

/// Dialer settings.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use inferadb_ledger_rpc_pool::{DialerConfig, tls_predicate};
///
/// let config = DialerConfig::builder()
///     .use_tls_for_dc(tls_predicate(|dc| dc != "dc-local"))
///     .prefix(0x02)
///     .timeout(Duration::from_secs(2))
///     .build();
/// assert!(config.use_tls_for_dc("dc-remote"));
/// assert_eq!(config.prefix(), Some(0x02));
/// ```
#[derive(Clone, bon::Builder)]
pub struct DialerConfig {
    /// Whether connections into a datacenter use TLS. Defaults to never.
    #[builder(default = default_tls_predicate())]
    use_tls_for_dc: TlsPredicate,

    /// TLS wrap function. A dial that needs TLS fails without one.
    tls_wrapper: Option<Arc<dyn TlsWrapper>>,

    /// Maps a remote datacenter to its mesh gateway address.
    gateway_resolver: Option<GatewayResolver>,

    /// TLS-with-ALPN wrap function for dials through a mesh gateway.
    alpn_wrapper: Option<Arc<dyn AlpnWrapper>>,

    /// Whether this process is a server. Only servers dial through gateways.
    #[builder(default)]
    dialing_from_server: bool,

    /// Datacenter the dials originate from. The pool fills it in from its
    /// own local datacenter when unset.
    #[builder(into)]
    local_datacenter: Option<String>,

    /// Connection-type byte written once at the start of every connection.
    prefix: Option<u8>,

    /// Deadline covering connect, prefix write and TLS handshake.
    #[builder(default = DEFAULT_DIAL_TIMEOUT)]
    timeout: Duration,
}

impl DialerConfig {
    /// Returns whether the predicate selects TLS for `datacenter`.
    #[must_use]
    pub fn use_tls_for_dc(&self, datacenter: &str) -> bool {
        (self.use_tls_for_dc)(datacenter)
    }

    /// Returns the TLS wrap function, if configured.
    #[must_use]
    pub fn tls_wrapper(&self) -> Option<&Arc<dyn TlsWrapper>> {
        self.tls_wrapper.as_ref()
    }

    /// Returns the mesh gateway address for `datacenter`, if one is known.
    ///
    /// An empty address counts as unknown.
    #[must_use]
    pub fn gateway_for(&self, datacenter: &str) -> Option<String> {
        self.gateway_resolver
            .as_ref()
            .and_then(|resolve| resolve(datacenter))
            .filter(|address| !address.is_empty())
    }

    /// Returns the ALPN wrap function, if configured.
    #[must_use]
    pub fn alpn_wrapper(&self) -> Option<&Arc<dyn AlpnWrapper>> {
        self.alpn_wrapper.as_ref()
    }

    /// Returns whether dials originate from a server.
    #[must_use]
    pub fn dialing_from_server(&self) -> bool {
        self.dialing_from_server
    }

    /// Returns the datacenter dials originate from, if known.
    #[must_use]
    pub fn local_datacenter(&self) -> Option<&str> {
        self.local_datacenter.as_deref()
    }

    /// Returns whether dials into `datacenter` go through a mesh gateway.
    ///
    /// Only a server with both a gateway resolver and an ALPN wrapper routes
    /// through gateways, and only for datacenters other than its own.
    #[must_use]
    pub fn routes_via_gateway(&self, datacenter: &str) -> bool {
        self.dialing_from_server
            && self.gateway_resolver.is_some()
            && self.alpn_wrapper.is_some()
            && self.local_datacenter.as_deref().is_some_and(|local| local != datacenter)
    }

    /// Returns the connection prefix byte, if configured.
    #[must_use]
    pub fn prefix(&self) -> Option<u8> {
        self.prefix
    }

    /// Returns the dial timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for DialerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialerConfig")
            .field("tls_wrapper", &self.tls_wrapper)
            .field("alpn_wrapper", &self.alpn_wrapper)
            .field("dialing_from_server", &self.dialing_from_server)
            .field("local_datacenter", &self.local_datacenter)
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Connection pool configuration.
///
/// # Validation Rules
///
/// - `authority` and `local_datacenter` must be non-empty
/// - `authority` cannot contain `/`
/// - keep-alive interval and timeout must be non-zero
/// - `request_timeout`, when set, must be non-zero
/// - `reconnect_min_backoff` must not exceed `reconnect_max_backoff`
/// - the dial timeout must be non-zero
/// - the dialer's local datacenter, when set, must match `local_datacenter`
///
/// # Example
///
/// ```
/// use inferadb_ledger_rpc_pool::PoolConfig;
///
/// let config = PoolConfig::builder()
///     .authority("cluster-a")
///     .local_datacenter("dc1")
///     .build()
///     .expect("valid pool config");
/// assert_eq!(config.local_datacenter(), "dc1");
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    authority: String,
    local_datacenter: String,
    request_timeout: Option<Duration>,
    keepalive_interval: Duration,
    keepalive_timeout: Duration,
    failover_wait: Duration,
    reconnect_min_backoff: Duration,
    reconnect_max_backoff: Duration,
    dialer: DialerConfig,
    metrics: Arc<dyn PoolMetrics>,
}

#[bon::bon]
impl PoolConfig {
    /// Creates a validated pool configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Config`](crate::PoolError::Config) if any
    /// validation rule is violated.
    #[builder]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        #[builder(into)] authority: String,
        #[builder(into)] local_datacenter: String,
        request_timeout: Option<Duration>,
        #[builder(default = DEFAULT_KEEPALIVE_INTERVAL)] keepalive_interval: Duration,
        #[builder(default = DEFAULT_KEEPALIVE_TIMEOUT)] keepalive_timeout: Duration,
        #[builder(default = DEFAULT_FAILOVER_WAIT)] failover_wait: Duration,
        #[builder(default = DEFAULT_RECONNECT_MIN_BACKOFF)] reconnect_min_backoff: Duration,
        #[builder(default = DEFAULT_RECONNECT_MAX_BACKOFF)] reconnect_max_backoff: Duration,
        #[builder(default)] dialer: DialerConfig,
        #[builder(default = default_metrics())] metrics: Arc<dyn PoolMetrics>,
    ) -> Result<Self> {
        let mut dialer = dialer;
        dialer.local_datacenter.get_or_insert_with(|| local_datacenter.clone());
        let config = Self {
            authority,
            local_datacenter,
            request_timeout,
            keepalive_interval,
            keepalive_timeout,
            failover_wait,
            reconnect_min_backoff,
            reconnect_max_backoff,
            dialer,
            metrics,
        };
        config.validate()?;
        Ok(config)
    }
}

impl PoolConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Config`](crate::PoolError::Config) if any value
    /// is out of range.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.authority.is_empty(), ConfigSnafu { message: "authority cannot be empty" });
        ensure!(
            !self.authority.contains('/'),
            ConfigSnafu { message: format!("authority '{}' cannot contain '/'", self.authority) }
        );
        ensure!(
            !self.local_datacenter.is_empty(),
            ConfigSnafu { message: "local_datacenter cannot be empty" }
        );
        ensure!(
            !self.keepalive_interval.is_zero(),
            ConfigSnafu { message: "keepalive_interval cannot be zero" }
        );
        ensure!(
            !self.keepalive_timeout.is_zero(),
            ConfigSnafu { message: "keepalive_timeout cannot be zero" }
        );
        ensure!(
            self.request_timeout.is_none_or(|timeout| !timeout.is_zero()),
            ConfigSnafu { message: "request_timeout cannot be zero" }
        );
        ensure!(
            self.reconnect_min_backoff <= self.reconnect_max_backoff,
            ConfigSnafu {
                message: format!(
                    "reconnect_min_backoff ({:?}) must not exceed reconnect_max_backoff ({:?})",
                    self.reconnect_min_backoff, self.reconnect_max_backoff
                ),
            }
        );
        ensure!(
            !self.dialer.timeout().is_zero(),
            ConfigSnafu { message: "dial timeout cannot be zero" }
        );
        ensure!(
            self.dialer.local_datacenter().is_none_or(|dc| dc == self.local_datacenter),
            ConfigSnafu { message: "dialer local_datacenter must match the pool's" }
        );
        Ok(())
    }

    /// Returns the authority of every target the pool builds.
    #[must_use]
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Returns the datacenter whose leader `client_conn_leader` targets.
    #[must_use]
    pub fn local_datacenter(&self) -> &str {
        &self.local_datacenter
    }

    /// Returns the per-request timeout, if any.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Returns the HTTP/2 keep-alive interval.
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    /// Returns the HTTP/2 keep-alive timeout.
    #[must_use]
    pub fn keepalive_timeout(&self) -> Duration {
        self.keepalive_timeout
    }

    /// Returns how long a request waits for a pending re-pick.
    #[must_use]
    pub fn failover_wait(&self) -> Duration {
        self.failover_wait
    }

    /// Returns the dialer settings.
    #[must_use]
    pub fn dialer(&self) -> &DialerConfig {
        &self.dialer
    }

    /// Returns the metrics sink.
    #[must_use]
    pub fn metrics(&self) -> &Arc<dyn PoolMetrics> {
        &self.metrics
    }

    pub(crate) fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: self.dialer.timeout(),
            request_timeout: self.request_timeout,
            keepalive_interval: self.keepalive_interval,
            keepalive_timeout: self.keepalive_timeout,
            failover_wait: self.failover_wait,
            reconnect_backoff: ExponentialBuilder::new()
                .with_min_delay(self.reconnect_min_backoff)
                .with_max_delay(self.reconnect_max_backoff)
                .with_jitter()
                .without_max_times(),
        }
    }
}

/// Per-connection settings derived from [`PoolConfig`].
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Option<Duration>,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub failover_wait: Duration,
    pub reconnect_backoff: ExponentialBuilder,
}
