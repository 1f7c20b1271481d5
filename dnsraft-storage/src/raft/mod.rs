// Raft log, node state machine, durable storage, and the async runtime around them
pub mod log;
pub mod node;
pub mod rpc;
pub mod runtime;
pub mod snapshot;
pub mod state_machine;
pub mod storage;
pub mod transport;

pub use node::{ConfigChange, NodeRole, RaftNode, RaftStatus};
pub use runtime::{Raft, RaftOptions};
pub use state_machine::{KeyValueStore, KvCommand, StoreReader};
pub use transport::StreamLayer;
