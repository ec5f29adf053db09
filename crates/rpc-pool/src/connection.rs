//! Logical connections with pick-first address selection.
//!
//! A [`ClientConn`] is bound to one target. It holds at most one tonic
//! [`Channel`], connected to the first address of the resolver's list that
//! can be dialed, and keeps using it while it stays in the list and healthy.
//!
//! # Architecture
//!
//! ```text
//! registry push ──► watch ──► driver task ──► pick() ──► Dialer + tonic Channel
//!                                                 │
//! request ──► settle ──► current channel ◄────────┘
//!                  │
//!        transport error ──► mark failed + resolve_now
//! ```
//!
//! The driver re-picks on every push. Requests wait (bounded by the failover
//! wait) until the driver has applied the latest push, so a request issued
//! right after a registry change lands on the new pick.

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use arc_swap::ArcSwapOption;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures::future::BoxFuture;
use snafu::ResultExt;
use tokio::sync::watch;
use tonic::{
    Status,
    body::Body,
    transport::{Channel, Endpoint},
};
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, info, warn};

use crate::{
    config::ConnectionSettings,
    dialer::{DialConnector, Dialer},
    endpoint::ResolvedAddress,
    error::{DialSnafu, PoolError, ResolutionSnafu, Result, TransportSnafu},
    metrics::PoolMetrics,
    resolver::{AddressResolver, ResolverState},
    target::{TargetKind, TargetName},
};

struct Picked {
    address: ResolvedAddress,
    channel: Channel,
}

struct Inner {
    target: TargetName,
    resolver: AddressResolver,
    dialer: Dialer,
    settings: ConnectionSettings,
    metrics: Arc<dyn PoolMetrics>,
    current: ArcSwapOption<Picked>,
    /// Set when a request on the current channel hit a transport error.
    failed: AtomicBool,
    /// Generation of the last resolver state the driver applied.
    applied: watch::Sender<u64>,
    closed: AtomicBool,
}

/// Logical connection to one target.
///
/// Implements [`tower::Service`] over gRPC requests, so any tonic generated
/// client can be constructed on top of it. Cloning is cheap and every clone
/// shares the same physical connection.
///
/// # Example
///
/// ```ignore
/// let conn = pool.client_conn("dc1").await?;
/// let mut health = HealthClient::new(conn.clone());
/// health.check(HealthCheckRequest { service: String::new() }).await?;
/// ```
#[derive(Clone)]
pub struct ClientConn {
    inner: Arc<Inner>,
}

impl ClientConn {
    /// Connects to the first dialable address of `resolver` and starts
    /// following its updates.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Resolution`] if the resolver has no address, or
    /// the last dial/transport error if every address failed.
    pub(crate) async fn connect(
        resolver: AddressResolver,
        dialer: Dialer,
        settings: ConnectionSettings,
        metrics: Arc<dyn PoolMetrics>,
    ) -> Result<Self> {
        let mut updates = resolver.watch();
        let initial = updates.borrow_and_update().clone();
        let backoff = settings.reconnect_backoff.clone();

        let inner = Arc::new(Inner {
            target: resolver.target().clone(),
            resolver,
            dialer,
            settings,
            metrics,
            current: ArcSwapOption::empty(),
            failed: AtomicBool::new(false),
            applied: watch::Sender::new(initial.generation),
            closed: AtomicBool::new(false),
        });

        inner.apply(&initial).await?;
        tokio::spawn(drive(Arc::downgrade(&inner), updates, backoff));

        Ok(Self { inner })
    }

    /// Returns the target this connection serves.
    #[must_use]
    pub fn target(&self) -> &TargetName {
        &self.inner.target
    }

    /// Returns the address currently in use, if any.
    #[must_use]
    pub fn current_address(&self) -> Option<String> {
        self.inner.current.load_full().map(|picked| picked.address.address.clone())
    }

    /// Closes the connection. Idempotent.
    ///
    /// Unsubscribes the resolver and drops the physical connection once
    /// in-flight requests finish. Later requests fail with `UNAVAILABLE`.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.resolver.close();
        self.inner.current.store(None);
        debug!(target_name = %self.inner.target, "Closed client connection");
    }

    /// Returns whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConn")
            .field("target", &self.inner.target)
            .field("current_address", &self.current_address())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Re-picks for `state` and records it as applied, whatever the outcome.
    async fn apply(&self, state: &ResolverState) -> Result<()> {
        let outcome = self.pick(&state.addresses).await;
        self.applied.send_replace(state.generation);
        outcome
    }

    async fn pick(&self, addresses: &[ResolvedAddress]) -> Result<()> {
        let current = self.current.load_full();
        let failed = self.failed.load(Ordering::Acquire);
        let mut last_error = None;

        // Keyed on the network address alone. A changed identity for the same
        // address keeps the live connection and applies on its next dial.
        for address in addresses {
            let is_current =
                current.as_ref().is_some_and(|picked| picked.address.address == address.address);
            if is_current && !failed {
                return Ok(());
            }
            match self.open(address).await {
                Ok(channel) => {
                    self.switch_to(address, channel);
                    return Ok(());
                },
                Err(e) => last_error = Some(e),
            }
        }

        if current.is_some() {
            self.current.store(None);
            info!(target_name = %self.target, "No usable address, dropped connection");
        }

        match last_error {
            Some(e) => Err(e),
            None => ResolutionSnafu {
                target: self.target.to_string(),
                message: match self.target.kind() {
                    TargetKind::Server => "no servers known in datacenter",
                    TargetKind::Leader => "leader address unknown",
                },
            }
            .fail(),
        }
    }

    async fn open(&self, address: &ResolvedAddress) -> Result<Channel> {
        let url = address.url();
        let endpoint = Endpoint::from_shared(url.clone())
            .map_err(|e| PoolError::InvalidUrl { url, message: e.to_string() })?;

        let datacenter = self.target.datacenter();
        let stream = self.dialer.dial(datacenter, address).await.context(DialSnafu)?;
        let connector =
            DialConnector::primed(self.dialer.clone(), datacenter, address.clone(), stream);

        configure_endpoint(endpoint, &self.settings)
            .connect_with_connector(connector)
            .await
            .context(TransportSnafu)
    }

    fn switch_to(&self, address: &ResolvedAddress, channel: Channel) {
        if self.is_closed() {
            return;
        }
        let previous =
            self.current.swap(Some(Arc::new(Picked { address: address.clone(), channel })));
        self.failed.store(false, Ordering::Release);

        info!(
            target_name = %self.target,
            address = %address.address,
            previous = ?previous.as_ref().map(|picked| picked.address.address.as_str()),
            "Picked address"
        );
        self.metrics.record_pick(&self.target.to_string(), &address.address);
    }

    /// Waits until the driver has applied the resolver's latest state.
    async fn settle(&self) {
        let pending = self.resolver.generation();
        let mut applied = self.applied.subscribe();
        let settled = tokio::time::timeout(
            self.settings.failover_wait,
            applied.wait_for(|generation| *generation >= pending),
        )
        .await
        .map(|result| result.is_ok());

        if !matches!(settled, Ok(true)) {
            debug!(target_name = %self.target, pending, "Proceeding before re-pick settled");
        }
    }

    fn report_failure(&self, picked: &Arc<Picked>, error: &tonic::transport::Error) {
        let still_current =
            self.current.load_full().is_some_and(|current| Arc::ptr_eq(&current, picked));
        if !still_current || self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(
            target_name = %self.target,
            address = %picked.address.address,
            error = %error,
            "Request failed, re-resolving"
        );
        self.resolver.resolve_now();
    }
}

/// Applies keep-alive and timeout settings to an endpoint.
fn configure_endpoint(endpoint: Endpoint, settings: &ConnectionSettings) -> Endpoint {
    let endpoint = endpoint
        .connect_timeout(settings.connect_timeout)
        .http2_keep_alive_interval(settings.keepalive_interval)
        .keep_alive_timeout(settings.keepalive_timeout)
        .keep_alive_while_idle(true);

    match settings.request_timeout {
        Some(timeout) => endpoint.timeout(timeout),
        None => endpoint,
    }
}

/// Follows resolver pushes until the resolver closes or the connection is gone.
///
/// After a pick where every address failed, the latest state is re-applied
/// on an exponential backoff until a push arrives or a pick succeeds.
async fn drive(
    conn: Weak<Inner>,
    mut updates: watch::Receiver<ResolverState>,
    backoff: ExponentialBuilder,
) {
    let mut retries = None;
    let mut retry_in: Option<Duration> = None;

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            () = sleep_for(retry_in) => {}
        }

        let state = updates.borrow_and_update().clone();
        let Some(inner) = conn.upgrade() else { break };
        if inner.is_closed() {
            break;
        }

        match inner.apply(&state).await {
            Ok(()) => {
                retries = None;
                retry_in = None;
            },
            Err(e @ PoolError::Resolution { .. }) => {
                // Only a registry push can fix an empty list.
                debug!(target_name = %inner.target, error = %e, "Waiting for addresses");
                retries = None;
                retry_in = None;
            },
            Err(e) => {
                retry_in = retries.get_or_insert_with(|| backoff.clone().build()).next();
                debug!(
                    target_name = %inner.target,
                    error = %e,
                    retry_in = ?retry_in,
                    "Every address failed, will retry"
                );
            },
        }
    }

    debug!("Connection driver stopped");
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

impl Service<http::Request<Body>> for ClientConn {
    type Response = http::Response<Body>;
    type Error = BoxError;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        Box::pin(send(Arc::clone(&self.inner), request))
    }
}

async fn send(
    inner: Arc<Inner>,
    request: http::Request<Body>,
) -> std::result::Result<http::Response<Body>, BoxError> {
    if inner.is_closed() {
        return Err(Box::new(Status::unavailable(format!("{} is closed", inner.target))));
    }
    inner.settle().await;

    let Some(picked) = inner.current.load_full() else {
        return Err(Box::new(Status::unavailable(format!(
            "no usable address for {}",
            inner.target
        ))));
    };

    let mut channel = picked.channel.clone();
    let response = match channel.ready().await {
        Ok(ready) => ready.call(request).await,
        Err(e) => Err(e),
    };
    response.map_err(|e| {
        inner.report_failure(&picked, &e);
        BoxError::from(e)
    })
}
