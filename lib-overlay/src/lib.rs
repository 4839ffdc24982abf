//! Teapotnet overlay router
//!
//! Maintains long-lived authenticated connections to peer nodes, routes
//! short messages by node identifier with a Kademlia-style routing
//! table, and serves a distributed hash table of key to value sets.
//! Higher layers (the tunneler, the pub/sub plane) consume messages
//! through per-type dispatchers.

pub mod address;
pub mod dht;
pub mod error;
pub mod message;
pub mod node;
pub mod peer;
pub mod routing;

pub use address::NodeAddr;
pub use error::OverlayError;
pub use message::{Message, MessageType, MAX_PAYLOAD, MAX_TTL};
pub use node::{Overlay, OverlayConfig};
pub use routing::RoutingTable;
