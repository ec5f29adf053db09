//! Deliberate reshuffling of a datacenter's failover order.
//!
//! Logical connections stick to the first healthy address of their list.
//! Without periodic shuffling every client of a static membership would pile
//! onto the first few servers. A [`Rebalancer`] shuffles the list uniformly
//! at random and makes every live resolver of the datacenter re-resolve, so
//! connections settle on the (possibly different) new first address.
//!
//! Rebalancing is not health-aware: it shuffles regardless of which servers
//! currently work.

use std::{sync::Arc, time::Duration};

use tokio::{sync::Notify, task::JoinHandle};
use tracing::debug;

use crate::registry::ServerRegistry;

/// Rebalance trigger for one datacenter.
///
/// The value captures the registry handle and the datacenter, so a scheduler
/// can hold and invoke it without knowing anything about resolvers.
#[derive(Debug, Clone)]
pub struct Rebalancer {
    registry: Arc<ServerRegistry>,
    datacenter: String,
}

impl Rebalancer {
    pub(crate) fn new(registry: Arc<ServerRegistry>, datacenter: impl Into<String>) -> Self {
        Self { registry, datacenter: datacenter.into() }
    }

    /// Returns the datacenter this rebalancer shuffles.
    #[must_use]
    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    /// Shuffles the datacenter's servers and re-resolves its live resolvers.
    ///
    /// Safe with zero, one or many servers, and a no-op for a datacenter the
    /// registry has never seen.
    pub fn trigger(&self) {
        self.registry.rebalance(&self.datacenter);
    }

    /// Triggers this rebalancer every `interval` on a background task.
    ///
    /// The first rebalance happens one full interval after spawning.
    #[must_use]
    pub fn spawn_periodic(&self, interval: Duration) -> PeriodicRebalance {
        let rebalancer = self.clone();
        let shutdown = Arc::new(Notify::new());
        let stop = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => rebalancer.trigger(),
                    () = stop.notified() => {
                        debug!(datacenter = %rebalancer.datacenter, "Periodic rebalance stopping");
                        break;
                    }
                }
            }
        });

        PeriodicRebalance { shutdown, handle }
    }
}

/// Handle to a periodic rebalance task.
///
/// Dropping the handle leaves the task running; call [`stop`](Self::stop).
#[derive(Debug)]
pub struct PeriodicRebalance {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl PeriodicRebalance {
    /// Stops the task and waits for it to exit.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Periodic rebalance task failed");
        }
    }

    /// Returns whether the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
