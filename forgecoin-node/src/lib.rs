//! Networking and orchestration for the Forge Coin simulation.
//!
//! `wire` frames JSON messages with a length prefix, `transport` runs the
//! gossip fabric with duplicate suppression and fault injection, and
//! `node` glues the transport to the chain logic in `forgecoin-core`.

pub mod node;
pub mod transport;
pub mod wire;

pub use node::{Node, NodeConfig, NodeError, NodeStatus};
pub use transport::{GossipNetwork, PeerInfo};
pub use wire::{Payload, WireError};
