//! Address resolvers bound to one target.
//!
//! An [`AddressResolver`] is the live subscription behind one logical
//! connection. It exposes the current address list, lets the connection ask
//! for an explicit re-resolve, and unsubscribes from the registry when closed
//! or dropped.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::watch;

use crate::{
    endpoint::ResolvedAddress,
    registry::{ServerRegistry, SubscriptionId},
    target::{TargetKind, TargetName},
};

/// Snapshot of a resolver's address list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverState {
    /// Monotonic counter bumped on every push to this resolver.
    pub generation: u64,
    /// Candidate addresses in failover order.
    pub addresses: Vec<ResolvedAddress>,
}

/// Resolver for one [`TargetName`].
///
/// For [`TargetKind::Server`] targets the list is every known server of the
/// datacenter in registry order. For [`TargetKind::Leader`] targets it is the
/// single leader address, or empty while no leader is known; an empty leader
/// list never falls back to ordinary servers.
#[derive(Debug)]
pub struct AddressResolver {
    target: TargetName,
    subscription: SubscriptionId,
    registry: Arc<ServerRegistry>,
    updates: watch::Receiver<ResolverState>,
    closed: AtomicBool,
}

impl AddressResolver {
    /// Subscribes to `registry` for `target`.
    pub(crate) fn subscribe(registry: Arc<ServerRegistry>, target: TargetName) -> Self {
        let (subscription, updates) = registry.subscribe(target.datacenter(), target.kind());
        Self { target, subscription, registry, updates, closed: AtomicBool::new(false) }
    }

    /// Returns the target this resolver serves.
    #[must_use]
    pub fn target(&self) -> &TargetName {
        &self.target
    }

    /// Returns the target kind.
    #[must_use]
    pub fn kind(&self) -> TargetKind {
        self.target.kind()
    }

    /// Returns the most recently pushed address list.
    #[must_use]
    pub fn addresses(&self) -> Vec<ResolvedAddress> {
        self.updates.borrow().addresses.clone()
    }

    /// Returns the most recently pushed state.
    #[must_use]
    pub fn state(&self) -> ResolverState {
        self.updates.borrow().clone()
    }

    /// Returns the generation of the most recently pushed state.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.updates.borrow().generation
    }

    /// Returns a receiver that observes every subsequent push.
    ///
    /// The receiver reports closure once this resolver is closed.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ResolverState> {
        self.updates.clone()
    }

    /// Re-reads the registry and pushes the current list to this resolver.
    ///
    /// No-op once closed.
    pub fn resolve_now(&self) {
        if self.is_closed() {
            return;
        }
        self.registry.resolve_now(self.target.datacenter(), self.subscription);
    }

    /// Returns whether the resolver has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Unsubscribes from the registry. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.unsubscribe(self.target.datacenter(), self.subscription);
    }
}

impl Drop for AddressResolver {
    fn drop(&mut self) {
        self.close();
    }
}
