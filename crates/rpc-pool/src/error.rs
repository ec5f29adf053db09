//! Error types for connection acquisition, resolution and dialing.
//!
//! Provides a two-tier error model:
//! - [`PoolError`]: what callers of the pool and the resolver builder see
//! - [`DialError`]: what the dialer reports for a single physical connection attempt
//!
//! Errors include retryability classification so callers can decide whether a
//! later acquisition attempt is worthwhile.

use std::io;

use snafu::{Location, Snafu};

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors surfaced by the connection pool and resolver subsystem.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PoolError {
    /// No address is known for the target (unknown datacenter or leader).
    #[snafu(display("Resolution error for {target}: {message}"))]
    Resolution {
        /// Target name that failed to resolve.
        target: String,
        /// Error description.
        message: String,
    },

    /// A target name could not be parsed.
    #[snafu(display("Invalid target name '{name}': {message}"))]
    InvalidTarget {
        /// The offending target name.
        name: String,
        /// Parse error description.
        message: String,
    },

    /// No resolver builder is registered under the authority.
    #[snafu(display("No resolver builder registered for authority '{authority}'"))]
    UnknownAuthority {
        /// The authority that was looked up.
        authority: String,
    },

    /// Every candidate address failed to dial.
    #[snafu(display("Dial error at {location}: {source}"))]
    Dial {
        /// Last dial failure observed.
        source: DialError,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// HTTP/2 handshake or channel setup failed after the socket was established.
    #[snafu(display("Transport error at {location}: {source}"))]
    Transport {
        /// Underlying transport error.
        source: tonic::transport::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// An address could not be turned into a tonic endpoint.
    #[snafu(display("Invalid URL '{url}': {message}"))]
    InvalidUrl {
        /// The invalid URL.
        url: String,
        /// Parse error description.
        message: String,
    },

    /// Configuration validation error.
    #[snafu(display("Configuration error: {message}"))]
    Config {
        /// Error description.
        message: String,
    },

    /// The pool or connection has been shut down.
    #[snafu(display("Connection pool shutting down"))]
    Shutdown,
}

impl PoolError {
    /// Returns true if a later acquisition attempt may succeed.
    ///
    /// Resolution failures are retryable because registry membership changes
    /// over time; a leader that is unknown now may be announced shortly.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Resolution { .. } => true,
            Self::Dial { .. } => true,
            Self::Transport { .. } => true,
            Self::InvalidTarget { .. } => false,
            Self::UnknownAuthority { .. } => false,
            Self::InvalidUrl { .. } => false,
            Self::Config { .. } => false,
            Self::Shutdown => false,
        }
    }
}

impl From<tonic::transport::Error> for PoolError {
    fn from(source: tonic::transport::Error) -> Self {
        Self::Transport { source, location: Location::default() }
    }
}

/// Errors from a single physical dial attempt.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DialError {
    /// The TCP connect failed.
    #[snafu(display("Failed to connect to {address}: {source}"))]
    Connect {
        /// Destination address.
        address: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Connect, prefix write and handshake did not finish within the dial timeout.
    #[snafu(display("Connection to {address} timed out after {timeout_ms}ms"))]
    Timeout {
        /// Destination address.
        address: String,
        /// Configured dial timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Writing the connection-type prefix byte failed.
    #[snafu(display("Failed to write connection prefix to {address}: {source}"))]
    Prefix {
        /// Destination address.
        address: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The TLS wrap function rejected the connection.
    #[snafu(display("TLS handshake with {server_name} failed: {source}"))]
    Tls {
        /// Peer name handed to the wrap function.
        server_name: String,
        /// Error returned by the wrap function.
        source: io::Error,
    },

    /// The destination needs TLS but no wrap function is configured.
    #[snafu(display("TLS enabled for {address} but no TLS wrapper configured"))]
    TlsWrapperMissing {
        /// Destination address.
        address: String,
    },

    /// No mesh gateway is known for a remote datacenter.
    #[snafu(display("No mesh gateway available for datacenter {datacenter}"))]
    GatewayUnavailable {
        /// Remote datacenter.
        datacenter: String,
    },

    /// The ALPN handshake through a mesh gateway failed.
    #[snafu(display("ALPN handshake via gateway {gateway} to {node_name} failed: {source}"))]
    Alpn {
        /// Gateway address dialed.
        gateway: String,
        /// Remote node the gateway routes to.
        node_name: String,
        /// Error returned by the wrap function.
        source: io::Error,
    },
}
