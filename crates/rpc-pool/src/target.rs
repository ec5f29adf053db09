//! Target names: the `{authority}/{kind}.{datacenter}` address space.
//!
//! A target name selects which resolver builder (by authority) and which
//! address list (by kind and datacenter) back a logical connection. Names are
//! rendered with the fixed [`SCHEME`] prefix and parse back losslessly.

use std::{fmt, str::FromStr};

use crate::error::{PoolError, Result};

/// Fixed addressing scheme under which resolver builders are registered.
pub const SCHEME: &str = "ledger";

/// Which address list a target resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetKind {
    /// Any known server in the datacenter.
    Server,
    /// The current leader of the datacenter.
    Leader,
}

impl TargetKind {
    /// Returns the name used in target strings.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Leader => "leader",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "server" => Ok(Self::Server),
            "leader" => Ok(Self::Leader),
            other => Err(PoolError::InvalidTarget {
                name: other.to_owned(),
                message: "kind must be 'server' or 'leader'".to_owned(),
            }),
        }
    }
}

/// Structured target name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetName {
    authority: String,
    kind: TargetKind,
    datacenter: String,
}

impl TargetName {
    /// Creates a target name.
    #[must_use]
    pub fn new(
        authority: impl Into<String>,
        kind: TargetKind,
        datacenter: impl Into<String>,
    ) -> Self {
        Self { authority: authority.into(), kind, datacenter: datacenter.into() }
    }

    /// Creates a target for any server in `datacenter`.
    #[must_use]
    pub fn server(authority: impl Into<String>, datacenter: impl Into<String>) -> Self {
        Self::new(authority, TargetKind::Server, datacenter)
    }

    /// Creates a target for the leader of `datacenter`.
    #[must_use]
    pub fn leader(authority: impl Into<String>, datacenter: impl Into<String>) -> Self {
        Self::new(authority, TargetKind::Leader, datacenter)
    }

    /// Parses a target name, with or without the `ledger://` scheme prefix.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidTarget`] if the authority, kind or
    /// datacenter is missing or malformed.
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = |message: &str| PoolError::InvalidTarget {
            name: name.to_owned(),
            message: message.to_owned(),
        };

        let rest = match name.split_once("://") {
            Some((scheme, rest)) if scheme == SCHEME => rest,
            Some(_) => return Err(invalid("unsupported scheme")),
            None => name,
        };

        let (authority, endpoint) =
            rest.split_once('/').ok_or_else(|| invalid("missing '/' after authority"))?;
        if authority.is_empty() {
            return Err(invalid("authority is empty"));
        }

        let (kind, datacenter) =
            endpoint.split_once('.').ok_or_else(|| invalid("missing '.' after kind"))?;
        if datacenter.is_empty() {
            return Err(invalid("datacenter is empty"));
        }
        if datacenter.contains('/') {
            return Err(invalid("datacenter cannot contain '/'"));
        }

        let kind = kind.parse::<TargetKind>().map_err(|_| invalid("unknown kind"))?;

        Ok(Self::new(authority, kind, datacenter))
    }

    /// Returns the authority.
    #[must_use]
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Returns the target kind.
    #[must_use]
    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    /// Returns the datacenter.
    #[must_use]
    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }
}

impl fmt::Display for TargetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}://{}/{}.{}", self.authority, self.kind, self.datacenter)
    }
}

impl FromStr for TargetName {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
