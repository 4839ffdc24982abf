//! Teapotnet node library
//!
//! Assembles the overlay, the block store, the contact plane and the
//! resource layer into one runnable node. The binary in `main.rs` is a
//! thin CLI wrapper around [`node::Node`].

pub mod config;
pub mod identity;
pub mod node;

pub use config::Config;
pub use node::Node;
