//! Shared test utilities for InferaDB Ledger crates.
//!
//! - [`TestServer`] - In-process gRPC server that reports its identity
//! - [`assert_eventually`] - Poll a condition until it's true or timeout
//! - [`eventually_async`] - Same, for conditions that need to await
//! - [`strategies`] - Proptest generators for cluster membership

#![deny(unsafe_code)]

mod assertions;
pub use assertions::{assert_eventually, eventually_async};

mod server;
pub use server::{DATACENTER_HEADER, SERVER_NAME_HEADER, TestServer, TestServerConfig};

pub mod strategies;
