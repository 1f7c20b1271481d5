//! Network side of a node: one TCP listener shared by Raft peers and text
//! clients, the peer hand-off layer, and the client command protocol.

pub mod client;
pub mod command;
pub mod handoff;
pub mod layer;
pub mod mux;
pub mod server;

pub use layer::{RaftLayer, RAFT_DISCRIMINATOR};
pub use server::Server;
