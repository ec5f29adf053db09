//! Server identity records.

/// Identity of one cluster server.
///
/// Endpoints are immutable: a membership update replaces the whole record in
/// the registry rather than mutating fields in place.
///
/// # Example
///
/// ```
/// use inferadb_ledger_rpc_pool::ServerEndpoint;
///
/// let server = ServerEndpoint::builder()
///     .id("a1b2")
///     .name("server-1")
///     .datacenter("dc1")
///     .address("10.0.0.1:8300")
///     .use_tls(true)
///     .build();
/// assert_eq!(server.datacenter(), "dc1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, bon::Builder)]
pub struct ServerEndpoint {
    /// Unique server identifier.
    #[builder(into)]
    id: String,

    /// Human-readable node name, also used as the TLS peer name.
    #[builder(into)]
    name: String,

    /// Owning datacenter.
    #[builder(into)]
    datacenter: String,

    /// Network address (`host:port`).
    #[builder(into)]
    address: String,

    /// Whether the server expects TLS when reached directly.
    #[builder(default)]
    use_tls: bool,
}

impl ServerEndpoint {
    /// Returns the server ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the server name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the owning datacenter.
    #[must_use]
    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    /// Returns the network address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns whether TLS should be used when dialing this server directly.
    #[must_use]
    pub fn use_tls(&self) -> bool {
        self.use_tls
    }
}

/// One candidate address handed from a resolver to the connection machinery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedAddress {
    /// Network address (`host:port`).
    pub address: String,
    /// Peer name passed to the TLS wrap function.
    pub server_name: String,
    /// Endpoint-level TLS flag.
    pub use_tls: bool,
}

impl ResolvedAddress {
    /// Creates a resolved address.
    #[must_use]
    pub fn new(address: impl Into<String>, server_name: impl Into<String>, use_tls: bool) -> Self {
        Self { address: address.into(), server_name: server_name.into(), use_tls }
    }

    /// Creates an address with no known server record behind it.
    ///
    /// The address doubles as the peer name.
    #[must_use]
    pub fn bare(address: impl Into<String>) -> Self {
        let address = address.into();
        Self { server_name: address.clone(), address, use_tls: false }
    }

    /// Returns the URL tonic uses for this address.
    ///
    /// Always plaintext `http`: TLS, when used, is layered by the dialer
    /// underneath HTTP/2.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}", self.address)
    }
}

impl From<&ServerEndpoint> for ResolvedAddress {
    fn from(endpoint: &ServerEndpoint) -> Self {
        Self::new(endpoint.address(), endpoint.name(), endpoint.use_tls())
    }
}
