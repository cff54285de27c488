//! Peer wire protocol
//!
//! Handshake, message framing, and the per-connection session state
//! machine, including BEP 9/10 metadata support.

pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod session;
pub mod wire;

pub use bitfield::Bitfield;
pub use handshake::{Handshake, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use session::{MetadataExt, PeerSession};
pub use wire::{BitTorrentWire, WireProtocol};
