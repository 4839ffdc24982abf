//! Teapotnet contact plane
//!
//! Contacts reach each other through authenticated tunnels multiplexed
//! over the overlay; each established tunnel carries a fountain-coded
//! link transporting typed records and opportunistic block pushes. On
//! top sit the prefix pub/sub tables and the caller registry that
//! drives block fetching.

pub mod error;
pub mod handler;
pub mod link;
pub mod network;
pub mod pubsub;
pub mod records;
pub mod tunneler;
pub mod wire;

pub use error::NetworkError;
pub use handler::{LinkHandle, DEFAULT_PACKET_RATE, KEEPALIVE, LINK_TIMEOUT};
pub use link::{match_prefix, normalize_prefix, Link, Locator};
pub use network::{Network, NetworkConfig, CALL_FALLBACK_TIMEOUT, CALL_PERIOD};
pub use pubsub::{Listener, Publisher, Subscriber};
pub use records::{CallRecord, IssueRecord, PublishRecord, TargetRecord};
pub use tunneler::Tunneler;
pub use wire::{SymbolFrame, SYMBOL_SIZE};
