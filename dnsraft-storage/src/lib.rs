//! Replicated key/value storage: an in-tree Raft engine, the state machine it
//! drives, and the store and membership APIs built on top of it.

pub mod membership;
pub mod raft;
pub mod store;

pub use membership::Membership;
pub use store::{KeyValueService, Store};
