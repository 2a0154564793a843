//! Links: persistent declarations of which keys propagate to which peers,
//! plus the TTL-bearing runtime tables that actually move the data.

pub mod runtime;
pub mod store;

pub use runtime::{LinkRuntime, PublishJob, TTL_DECREMENT, TTL_INITIAL};
pub use store::{query_matches, LinkFlags, LinkRecord, LinkStore, QUERY_LEN};
