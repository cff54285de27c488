//! DHT client (BEP 5)
//!
//! Iterative Kademlia lookup used to supplement the tracker-derived peer
//! set with peers holding the info-hash.

pub mod krpc;
pub mod lookup;
pub mod node;

pub use lookup::discover_peers;
pub use node::{DhtNode, NodeId};
