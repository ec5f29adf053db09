//! Resolver builders and the authority directory.
//!
//! A [`ResolverBuilder`] owns one [`ServerRegistry`] and is identified by an
//! authority. Builders are registered in a [`BuilderRegistry`], which maps
//! the authority of a [`TargetName`] to the builder that resolves it. Several
//! builders (for independent clusters, or for isolated tests) coexist in one
//! process by using distinct authorities.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::{
    endpoint::ServerEndpoint,
    error::{PoolError, Result},
    metrics::PoolMetrics,
    rebalance::Rebalancer,
    registry::ServerRegistry,
    resolver::AddressResolver,
    target::TargetName,
};

/// Factory for [`AddressResolver`]s over one registry.
///
/// Cloning is cheap and every clone shares the same registry.
///
/// # Example
///
/// ```
/// use inferadb_ledger_rpc_pool::{ResolverBuilder, ServerEndpoint, TargetName};
///
/// let builder = ResolverBuilder::new("cluster-a");
/// builder.add_server(
///     ServerEndpoint::builder()
///         .id("s1")
///         .name("server-1")
///         .datacenter("dc1")
///         .address("10.0.0.1:8300")
///         .build(),
/// );
///
/// let resolver = builder.build(&TargetName::server("cluster-a", "dc1")).unwrap();
/// assert_eq!(resolver.addresses().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ResolverBuilder {
    authority: Arc<str>,
    registry: Arc<ServerRegistry>,
}

impl ResolverBuilder {
    /// Creates a builder with an empty registry.
    #[must_use]
    pub fn new(authority: impl Into<String>) -> Self {
        Self::with_registry(authority, Arc::new(ServerRegistry::new()))
    }

    /// Creates a builder whose registry reports to `metrics`.
    #[must_use]
    pub fn with_metrics(authority: impl Into<String>, metrics: Arc<dyn PoolMetrics>) -> Self {
        Self::with_registry(authority, Arc::new(ServerRegistry::with_metrics(metrics)))
    }

    /// Creates a builder over an existing registry.
    #[must_use]
    pub fn with_registry(authority: impl Into<String>, registry: Arc<ServerRegistry>) -> Self {
        Self { authority: Arc::from(authority.into()), registry }
    }

    /// Returns the authority this builder answers for.
    #[must_use]
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Returns the backing registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Builds and subscribes a resolver for `target`.
    ///
    /// Datacenter state is created on first use, so building against a
    /// datacenter nobody has announced yet succeeds with an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::UnknownAuthority`] if `target` names a different
    /// authority.
    pub fn build(&self, target: &TargetName) -> Result<AddressResolver> {
        if target.authority() != &*self.authority {
            return Err(PoolError::UnknownAuthority { authority: target.authority().to_owned() });
        }
        Ok(AddressResolver::subscribe(Arc::clone(&self.registry), target.clone()))
    }

    /// Returns the server target for `datacenter` under this authority.
    #[must_use]
    pub fn server_target(&self, datacenter: &str) -> TargetName {
        TargetName::server(&*self.authority, datacenter)
    }

    /// Returns the leader target for `datacenter` under this authority.
    #[must_use]
    pub fn leader_target(&self, datacenter: &str) -> TargetName {
        TargetName::leader(&*self.authority, datacenter)
    }

    /// Adds or replaces a server. See [`ServerRegistry::add_server`].
    pub fn add_server(&self, server: ServerEndpoint) {
        self.registry.add_server(server);
    }

    /// Removes a server. See [`ServerRegistry::remove_server`].
    pub fn remove_server(&self, id: &str, datacenter: &str) {
        self.registry.remove_server(id, datacenter);
    }

    /// Announces a new leader address. See [`ServerRegistry::update_leader_addr`].
    pub fn update_leader_addr(&self, datacenter: &str, address: &str) {
        self.registry.update_leader_addr(datacenter, address);
    }

    /// Returns a rebalancer for `datacenter`.
    ///
    /// Nothing happens until the rebalancer is triggered.
    #[must_use]
    pub fn new_rebalancer(&self, datacenter: impl Into<String>) -> Rebalancer {
        Rebalancer::new(Arc::clone(&self.registry), datacenter)
    }
}

/// Directory of resolver builders keyed by authority.
///
/// Cloning is cheap and every clone shares the same directory.
#[derive(Debug, Clone, Default)]
pub struct BuilderRegistry {
    builders: Arc<DashMap<String, ResolverBuilder>>,
}

impl BuilderRegistry {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `builder` under its authority.
    ///
    /// Returns the builder previously registered under that authority, if any.
    pub fn register(&self, builder: ResolverBuilder) -> Option<ResolverBuilder> {
        let authority = builder.authority().to_owned();
        debug!(authority = %authority, "Registering resolver builder");
        self.builders.insert(authority, builder)
    }

    /// Removes the builder registered under `authority`.
    pub fn deregister(&self, authority: &str) -> Option<ResolverBuilder> {
        let removed = self.builders.remove(authority).map(|(_, builder)| builder);
        if removed.is_some() {
            debug!(authority, "Deregistered resolver builder");
        }
        removed
    }

    /// Returns the builder registered under `authority`.
    #[must_use]
    pub fn get(&self, authority: &str) -> Option<ResolverBuilder> {
        self.builders.get(authority).map(|entry| entry.value().clone())
    }

    /// Returns the registered authorities.
    #[must_use]
    pub fn authorities(&self) -> Vec<String> {
        let mut authorities: Vec<_> =
            self.builders.iter().map(|entry| entry.key().clone()).collect();
        authorities.sort();
        authorities
    }

    /// Builds a resolver for `target` using the builder of its authority.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::UnknownAuthority`] if no builder is registered for
    /// the target's authority.
    pub fn build(&self, target: &TargetName) -> Result<AddressResolver> {
        let builder = self.get(target.authority()).ok_or_else(|| PoolError::UnknownAuthority {
            authority: target.authority().to_owned(),
        })?;
        builder.build(target)
    }
}
