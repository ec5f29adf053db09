//! Per-datacenter registry of known servers and leaders.
//!
//! The registry is the single owner of endpoint membership. External
//! membership events (gossip joins/leaves, leader elections) mutate it; live
//! resolvers subscribe to it and receive every resulting address list.
//!
//! # Delivery
//!
//! Each subscription owns a [`tokio::sync::watch`] channel. Publishing
//! replaces the single buffered value and never waits on the receiver, so a
//! stalled resolver cannot hold up mutations for anyone else. A burst of
//! mutations may coalesce into its final state from a resolver's point of
//! view; resolvers always re-derive from the latest list.
//!
//! ```text
//! add_server / remove_server / update_leader_addr / rebalance
//!       │
//!       ▼
//! DatacenterState (servers, leader) ──► Subscription ──► watch::Receiver
//!                                   └─► Subscription ──► watch::Receiver
//! ```

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::{
    endpoint::{ResolvedAddress, ServerEndpoint},
    metrics::{PoolMetrics, default_metrics},
    resolver::ResolverState,
    target::TargetKind,
};

/// Identifier of one resolver subscription.
pub(crate) type SubscriptionId = u64;

#[derive(Debug)]
struct Subscription {
    kind: TargetKind,
    updates: watch::Sender<ResolverState>,
}

impl Subscription {
    /// Pushes a fresh address list, bumping the generation.
    fn publish(&self, addresses: Vec<ResolvedAddress>) {
        self.updates.send_modify(|state| {
            state.generation += 1;
            state.addresses = addresses;
        });
    }
}

/// Mutable state of one datacenter.
#[derive(Debug, Default)]
struct DatacenterState {
    /// Known servers in failover order. IDs are unique.
    servers: Vec<ServerEndpoint>,
    /// Bare leader address, if one has been announced.
    leader: Option<String>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

impl DatacenterState {
    fn server_addresses(&self) -> Vec<ResolvedAddress> {
        self.servers.iter().map(ResolvedAddress::from).collect()
    }

    /// The leader address, enriched with the matching server's identity when known.
    ///
    /// A connection already on this address keeps its dial identity when the
    /// record appears later.
    fn leader_address(&self) -> Option<ResolvedAddress> {
        let leader = self.leader.as_deref()?;
        let resolved = self
            .servers
            .iter()
            .find(|server| server.address() == leader)
            .map_or_else(|| ResolvedAddress::bare(leader), ResolvedAddress::from);
        Some(resolved)
    }

    fn addresses(&self, kind: TargetKind) -> Vec<ResolvedAddress> {
        match kind {
            TargetKind::Server => self.server_addresses(),
            TargetKind::Leader => self.leader_address().into_iter().collect(),
        }
    }

    /// Publishes the current lists to every subscription, pruning dead ones.
    ///
    /// Returns the number of subscriptions pruned.
    fn notify_all(&mut self) -> usize {
        let servers = self.server_addresses();
        let leader: Vec<_> = self.leader_address().into_iter().collect();

        let before = self.subscriptions.len();
        self.subscriptions.retain(|id, subscription| {
            if subscription.updates.is_closed() {
                trace!(subscription = id, "Pruning subscription with no receivers");
                return false;
            }
            let addresses = match subscription.kind {
                TargetKind::Server => servers.clone(),
                TargetKind::Leader => leader.clone(),
            };
            subscription.publish(addresses);
            true
        });
        before - self.subscriptions.len()
    }
}

/// Thread-safe registry of servers and leaders, keyed by datacenter.
///
/// All mutation and subscription iteration happens under one lock, so a
/// mutation and the notifications it produces are atomic with respect to
/// other mutations and to resolver creation and destruction.
///
/// Unknown datacenters are created on first use by any operation.
#[derive(Debug)]
pub struct ServerRegistry {
    datacenters: Mutex<HashMap<String, DatacenterState>>,
    next_subscription: AtomicU64,
    metrics: Arc<dyn PoolMetrics>,
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_metrics(default_metrics())
    }

    /// Creates an empty registry reporting to `metrics`.
    #[must_use]
    pub fn with_metrics(metrics: Arc<dyn PoolMetrics>) -> Self {
        Self {
            datacenters: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            metrics,
        }
    }

    /// Adds a server, or replaces the server with the same ID in place.
    ///
    /// A new ID is appended to the end of the datacenter's failover order.
    pub fn add_server(&self, server: ServerEndpoint) {
        let datacenter = server.datacenter().to_owned();
        self.mutate(&datacenter, |state| {
            match state.servers.iter_mut().find(|existing| existing.id() == server.id()) {
                Some(existing) => *existing = server,
                None => state.servers.push(server),
            }
            true
        });
    }

    /// Removes the server with `id` from `datacenter`.
    ///
    /// Relative order of the remaining servers is preserved. Removing an
    /// unknown ID is a no-op and notifies nobody.
    pub fn remove_server(&self, id: &str, datacenter: &str) {
        self.mutate(datacenter, |state| {
            match state.servers.iter().position(|server| server.id() == id) {
                Some(index) => {
                    state.servers.remove(index);
                    true
                },
                None => false,
            }
        });
    }

    /// Sets the leader address for `datacenter`.
    ///
    /// An empty address clears the leader, after which leader targets
    /// resolve to no addresses.
    pub fn update_leader_addr(&self, datacenter: &str, address: &str) {
        let leader = (!address.is_empty()).then(|| address.to_owned());
        self.mutate(datacenter, |state| {
            state.leader = leader;
            true
        });
    }

    /// Shuffles the failover order of `datacenter` and re-resolves its subscribers.
    ///
    /// A datacenter that has never been seen is left untouched.
    pub fn rebalance(&self, datacenter: &str) {
        let mut datacenters = self.datacenters.lock();
        let Some(state) = datacenters.get_mut(datacenter) else {
            trace!(datacenter, "Rebalance of unknown datacenter ignored");
            return;
        };

        state.servers.shuffle(&mut rand::rng());
        let pruned = state.notify_all();
        let servers = state.servers.len();
        let subscribers = state.subscriptions.len();
        drop(datacenters);

        self.record_pruned(datacenter, pruned);
        self.metrics.record_rebalance(datacenter, servers);
        debug!(datacenter, servers, subscribers, "Rebalanced datacenter");
    }

    /// Returns the servers of `datacenter` in failover order.
    #[must_use]
    pub fn servers(&self, datacenter: &str) -> Vec<ServerEndpoint> {
        self.datacenters
            .lock()
            .get(datacenter)
            .map(|state| state.servers.clone())
            .unwrap_or_default()
    }

    /// Returns the leader address of `datacenter`, if known.
    #[must_use]
    pub fn leader_addr(&self, datacenter: &str) -> Option<String> {
        self.datacenters.lock().get(datacenter).and_then(|state| state.leader.clone())
    }

    /// Returns the addresses a `kind` target for `datacenter` currently resolves to.
    #[must_use]
    pub fn addresses(&self, datacenter: &str, kind: TargetKind) -> Vec<ResolvedAddress> {
        self.datacenters
            .lock()
            .get(datacenter)
            .map(|state| state.addresses(kind))
            .unwrap_or_default()
    }

    /// Returns every datacenter the registry has state for.
    #[must_use]
    pub fn datacenters(&self) -> Vec<String> {
        let mut names: Vec<_> = self.datacenters.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of live subscriptions for `datacenter`.
    #[must_use]
    pub fn subscription_count(&self, datacenter: &str) -> usize {
        self.datacenters.lock().get(datacenter).map_or(0, |state| state.subscriptions.len())
    }

    /// Registers a subscription and returns its receiver primed with the current list.
    pub(crate) fn subscribe(
        &self,
        datacenter: &str,
        kind: TargetKind,
    ) -> (SubscriptionId, watch::Receiver<ResolverState>) {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);

        let mut datacenters = self.datacenters.lock();
        let state = datacenters.entry(datacenter.to_owned()).or_default();
        let initial = ResolverState { generation: 0, addresses: state.addresses(kind) };
        let (updates, receiver) = watch::channel(initial);
        state.subscriptions.insert(id, Subscription { kind, updates });

        debug!(datacenter, %kind, subscription = id, "Resolver subscribed");
        (id, receiver)
    }

    /// Drops a subscription. The receiver observes the sender closing.
    pub(crate) fn unsubscribe(&self, datacenter: &str, id: SubscriptionId) {
        let removed = self
            .datacenters
            .lock()
            .get_mut(datacenter)
            .and_then(|state| state.subscriptions.remove(&id));
        if removed.is_some() {
            debug!(datacenter, subscription = id, "Resolver unsubscribed");
        }
    }

    /// Re-reads current state and pushes it to one subscription.
    pub(crate) fn resolve_now(&self, datacenter: &str, id: SubscriptionId) {
        let datacenters = self.datacenters.lock();
        let Some(state) = datacenters.get(datacenter) else {
            return;
        };
        if let Some(subscription) = state.subscriptions.get(&id) {
            subscription.publish(state.addresses(subscription.kind));
        }
    }

    /// Applies `change` to the datacenter and notifies its subscribers if it reports a change.
    fn mutate<F>(&self, datacenter: &str, change: F)
    where
        F: FnOnce(&mut DatacenterState) -> bool,
    {
        let mut datacenters = self.datacenters.lock();
        let state = datacenters.entry(datacenter.to_owned()).or_default();
        if !change(state) {
            return;
        }
        let pruned = state.notify_all();
        drop(datacenters);

        self.record_pruned(datacenter, pruned);
    }

    fn record_pruned(&self, datacenter: &str, pruned: usize) {
        for _ in 0..pruned {
            self.metrics.record_stale_subscription(datacenter);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use inferadb_ledger_test_utils::strategies::{
        DATACENTERS, MembershipOp, address_of, arb_membership_ops,
    };
    use proptest::prelude::*;

    use super::*;

    fn server(id: &str, datacenter: &str) -> ServerEndpoint {
        ServerEndpoint::builder()
            .id(id)
            .name(format!("name-{id}"))
            .datacenter(datacenter)
            .address(format!("{id}.{datacenter}:8300"))
            .build()
    }

    fn ids(registry: &ServerRegistry, datacenter: &str) -> Vec<String> {
        registry.servers(datacenter).iter().map(|s| s.id().to_owned()).collect()
    }

    #[test]
    fn test_add_appends_in_order() {
        let registry = ServerRegistry::new();
        registry.add_server(server("a", "dc1"));
        registry.add_server(server("b", "dc1"));
        registry.add_server(server("c", "dc1"));

        assert_eq!(ids(&registry, "dc1"), ["a", "b", "c"]);
    }

    #[test]
    fn test_add_existing_id_replaces_in_place() {
        let registry = ServerRegistry::new();
        registry.add_server(server("a", "dc1"));
        registry.add_server(server("b", "dc1"));

        let replacement = ServerEndpoint::builder()
            .id("a")
            .name("renamed")
            .datacenter("dc1")
            .address("10.9.9.9:8300")
            .build();
        registry.add_server(replacement);

        let servers = registry.servers("dc1");
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name(), "renamed");
        assert_eq!(servers[0].address(), "10.9.9.9:8300");
        assert_eq!(servers[1].id(), "b");
    }

    #[test]
    fn test_remove_preserves_relative_order() {
        let registry = ServerRegistry::new();
        for id in ["a", "b", "c", "d"] {
            registry.add_server(server(id, "dc1"));
        }

        registry.remove_server("b", "dc1");
        assert_eq!(ids(&registry, "dc1"), ["a", "c", "d"]);
    }

    #[test]
    fn test_remove_unknown_id_is_noop() {
        let registry = ServerRegistry::new();
        registry.add_server(server("a", "dc1"));

        let (_, receiver) = registry.subscribe("dc1", TargetKind::Server);
        registry.remove_server("missing", "dc1");

        assert_eq!(ids(&registry, "dc1"), ["a"]);
        assert_eq!(receiver.borrow().generation, 0, "no-op removal must not notify");
    }

    #[test]
    fn test_mutation_on_unknown_datacenter_creates_state() {
        let registry = ServerRegistry::new();
        registry.remove_server("a", "dc9");
        registry.update_leader_addr("dc8", "10.0.0.1:8300");

        assert_eq!(registry.datacenters(), ["dc8", "dc9"]);
        assert!(registry.servers("dc9").is_empty());
        assert_eq!(registry.leader_addr("dc8").as_deref(), Some("10.0.0.1:8300"));
    }

    #[test]
    fn test_datacenters_are_isolated() {
        let registry = ServerRegistry::new();
        registry.add_server(server("a", "dc1"));
        registry.add_server(server("b", "dc2"));

        assert_eq!(ids(&registry, "dc1"), ["a"]);
        assert_eq!(ids(&registry, "dc2"), ["b"]);
    }

    #[test]
    fn test_subscription_receives_server_updates() {
        let registry = ServerRegistry::new();
        registry.add_server(server("a", "dc1"));

        let (_, receiver) = registry.subscribe("dc1", TargetKind::Server);
        assert_eq!(receiver.borrow().addresses.len(), 1);

        registry.add_server(server("b", "dc1"));
        let state = receiver.borrow().clone();
        assert_eq!(state.generation, 1);
        let addresses: Vec<_> = state.addresses.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(addresses, ["a.dc1:8300", "b.dc1:8300"]);
    }

    #[test]
    fn test_leader_subscription_tracks_leader_only() {
        let registry = ServerRegistry::new();
        registry.add_server(server("a", "dc1"));

        let (_, receiver) = registry.subscribe("dc1", TargetKind::Leader);
        assert!(receiver.borrow().addresses.is_empty(), "no leader yet");

        registry.update_leader_addr("dc1", "a.dc1:8300");
        let state = receiver.borrow().clone();
        assert_eq!(state.addresses.len(), 1);
        assert_eq!(state.addresses[0].server_name, "name-a", "leader inherits server identity");

        registry.update_leader_addr("dc1", "");
        assert!(receiver.borrow().addresses.is_empty(), "empty address clears leader");
    }

    #[test]
    fn test_unknown_leader_address_resolves_bare() {
        let registry = ServerRegistry::new();
        registry.update_leader_addr("dc1", "10.1.1.1:8300");

        let addresses = registry.addresses("dc1", TargetKind::Leader);
        assert_eq!(addresses, [ResolvedAddress::bare("10.1.1.1:8300")]);
    }

    #[test]
    fn test_updates_do_not_cross_datacenters() {
        let registry = ServerRegistry::new();
        let (_, dc1) = registry.subscribe("dc1", TargetKind::Server);
        let (_, dc2) = registry.subscribe("dc2", TargetKind::Server);

        registry.add_server(server("a", "dc1"));

        assert_eq!(dc1.borrow().generation, 1);
        assert_eq!(dc2.borrow().generation, 0);
    }

    #[test]
    fn test_unsubscribe_closes_receiver() {
        let registry = ServerRegistry::new();
        let (id, receiver) = registry.subscribe("dc1", TargetKind::Server);
        assert_eq!(registry.subscription_count("dc1"), 1);

        registry.unsubscribe("dc1", id);
        assert_eq!(registry.subscription_count("dc1"), 0);
        assert!(receiver.has_changed().is_err(), "sender should be gone");
    }

    #[test]
    fn test_dropped_receiver_is_pruned_on_next_notify() {
        let registry = ServerRegistry::new();
        let (_, receiver) = registry.subscribe("dc1", TargetKind::Server);
        drop(receiver);

        registry.add_server(server("a", "dc1"));
        assert_eq!(registry.subscription_count("dc1"), 0);
    }

    #[test]
    fn test_resolve_now_bumps_generation_for_one_subscription() {
        let registry = ServerRegistry::new();
        registry.add_server(server("a", "dc1"));
        let (first, first_rx) = registry.subscribe("dc1", TargetKind::Server);
        let (_, second_rx) = registry.subscribe("dc1", TargetKind::Server);

        registry.resolve_now("dc1", first);

        assert_eq!(first_rx.borrow().generation, 1);
        assert_eq!(second_rx.borrow().generation, 0);
    }

    #[test]
    fn test_rebalance_keeps_membership() {
        let registry = ServerRegistry::new();
        for id in ["a", "b", "c", "d", "e"] {
            registry.add_server(server(id, "dc1"));
        }
        let (_, receiver) = registry.subscribe("dc1", TargetKind::Server);

        registry.rebalance("dc1");

        let after: BTreeSet<_> = ids(&registry, "dc1").into_iter().collect();
        assert_eq!(after, BTreeSet::from(["a", "b", "c", "d", "e"].map(String::from)));
        assert_eq!(receiver.borrow().generation, 1, "rebalance re-resolves subscribers");
    }

    #[test]
    fn test_rebalance_empty_and_unknown_datacenters() {
        let registry = ServerRegistry::new();
        registry.rebalance("nowhere");
        assert!(registry.datacenters().is_empty(), "rebalance must not create state");

        let (_, receiver) = registry.subscribe("dc1", TargetKind::Server);
        registry.rebalance("dc1");
        assert!(receiver.borrow().addresses.is_empty());

        registry.add_server(server("only", "dc1"));
        registry.rebalance("dc1");
        assert_eq!(ids(&registry, "dc1"), ["only"]);
    }

    #[test]
    fn test_rebalance_eventually_changes_order() {
        let registry = ServerRegistry::new();
        for id in ["a", "b", "c", "d"] {
            registry.add_server(server(id, "dc1"));
        }
        let original = ids(&registry, "dc1");

        let changed = (0..100).any(|_| {
            registry.rebalance("dc1");
            ids(&registry, "dc1") != original
        });
        assert!(changed, "order never changed after 100 rebalances");
    }

    #[test]
    fn test_concurrent_mutations_keep_ids_unique() {
        let registry = Arc::new(ServerRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("s{}", (worker * 7 + i) % 20);
                        registry.add_server(server(&id, "dc1"));
                        if i % 3 == 0 {
                            registry.remove_server(&id, "dc1");
                        }
                        let (sub, _rx) = registry.subscribe("dc1", TargetKind::Server);
                        registry.unsubscribe("dc1", sub);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        let ids = ids(&registry, "dc1");
        let unique: BTreeSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len(), "duplicate IDs: {ids:?}");
        assert_eq!(registry.subscription_count("dc1"), 0);
    }

    /// Reference model: ordered membership and leader per datacenter.
    #[derive(Debug, Default)]
    struct Model {
        servers: BTreeMap<String, Vec<String>>,
        leaders: BTreeMap<String, String>,
    }

    impl Model {
        fn apply(&mut self, op: &MembershipOp) {
            match op {
                MembershipOp::Add { id, datacenter } => {
                    let ids = self.servers.entry(datacenter.clone()).or_default();
                    if !ids.contains(id) {
                        ids.push(id.clone());
                    }
                },
                MembershipOp::Remove { id, datacenter } => {
                    if let Some(ids) = self.servers.get_mut(datacenter) {
                        ids.retain(|existing| existing != id);
                    }
                },
                MembershipOp::Leader { datacenter, address } if address.is_empty() => {
                    self.leaders.remove(datacenter);
                },
                MembershipOp::Leader { datacenter, address } => {
                    self.leaders.insert(datacenter.clone(), address.clone());
                },
            }
        }
    }

    fn apply(registry: &ServerRegistry, op: &MembershipOp) {
        match op {
            MembershipOp::Add { id, datacenter } => registry.add_server(
                ServerEndpoint::builder()
                    .id(id)
                    .name(format!("name-{id}"))
                    .datacenter(datacenter)
                    .address(address_of(id, datacenter))
                    .build(),
            ),
            MembershipOp::Remove { id, datacenter } => registry.remove_server(id, datacenter),
            MembershipOp::Leader { datacenter, address } => {
                registry.update_leader_addr(datacenter, address);
            },
        }
    }

    proptest! {
        #[test]
        fn prop_registry_matches_membership_model(ops in arb_membership_ops()) {
            let registry = ServerRegistry::new();
            let subscriptions: Vec<_> = DATACENTERS
                .iter()
                .map(|dc| (*dc, registry.subscribe(dc, TargetKind::Server).1))
                .collect();
            let mut model = Model::default();

            for op in &ops {
                apply(&registry, op);
                model.apply(op);
            }

            for (datacenter, receiver) in &subscriptions {
                let expected = model.servers.get(*datacenter).cloned().unwrap_or_default();
                prop_assert_eq!(&ids(&registry, datacenter), &expected);

                // Live subscribers converge on the final list in the same order.
                let pushed: Vec<_> =
                    receiver.borrow().addresses.iter().map(|a| a.address.clone()).collect();
                let addresses: Vec<_> =
                    expected.iter().map(|id| address_of(id, datacenter)).collect();
                prop_assert_eq!(pushed, addresses);

                prop_assert_eq!(
                    registry.leader_addr(datacenter),
                    model.leaders.get(*datacenter).cloned()
                );
            }
        }
    }
}
