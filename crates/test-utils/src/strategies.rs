//! Proptest strategies for cluster membership.
//!
//! Generators for registry property tests. Identifiers are drawn from small
//! pools so that generated sequences revisit the same servers and exercise
//! replace and remove paths, not just appends.
//!
//! # Usage
//!
//! ```no_run
//! use inferadb_ledger_test_utils::strategies::{self, MembershipOp};
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(ops in strategies::arb_membership_ops()) {
//!         for op in ops {
//!             // apply op to the system under test
//!         }
//!     }
//! }
//! ```

use proptest::prelude::*;

/// Datacenter names the strategies draw from.
pub const DATACENTERS: [&str; 3] = ["dc1", "dc2", "dc3"];

/// One membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipOp {
    /// Announce (or re-announce) a server.
    Add {
        /// Server ID.
        id: String,
        /// Owning datacenter.
        datacenter: String,
    },
    /// Withdraw a server.
    Remove {
        /// Server ID.
        id: String,
        /// Owning datacenter.
        datacenter: String,
    },
    /// Announce a leader address; empty clears the leader.
    Leader {
        /// Datacenter the leader belongs to.
        datacenter: String,
        /// Leader address.
        address: String,
    },
}

/// Generates one of the [`DATACENTERS`].
pub fn arb_datacenter() -> impl Strategy<Value = String> {
    prop::sample::select(DATACENTERS.to_vec()).prop_map(str::to_owned)
}

/// Generates a server ID from a pool of 12: `s0` through `s11`.
pub fn arb_server_id() -> impl Strategy<Value = String> {
    (0u8..12).prop_map(|n| format!("s{n}"))
}

/// Address a generated server ID listens on.
#[must_use]
pub fn address_of(id: &str, datacenter: &str) -> String {
    format!("{id}.{datacenter}.test:8300")
}

/// Generates an arbitrary [`MembershipOp`]. Adds and removes dominate.
pub fn arb_membership_op() -> impl Strategy<Value = MembershipOp> {
    prop_oneof![
        4 => (arb_server_id(), arb_datacenter())
            .prop_map(|(id, datacenter)| MembershipOp::Add { id, datacenter }),
        3 => (arb_server_id(), arb_datacenter())
            .prop_map(|(id, datacenter)| MembershipOp::Remove { id, datacenter }),
        1 => (arb_datacenter(), proptest::option::of(arb_server_id())).prop_map(
            |(datacenter, id)| {
                let address = id.map(|id| address_of(&id, &datacenter)).unwrap_or_default();
                MembershipOp::Leader { datacenter, address }
            }
        ),
    ]
}

/// Generates a sequence of 0-63 membership changes.
pub fn arb_membership_ops() -> impl Strategy<Value = Vec<MembershipOp>> {
    proptest::collection::vec(arb_membership_op(), 0..64)
}
