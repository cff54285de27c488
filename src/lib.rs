//! swarmget
//!
//! A BitTorrent download client. Given a .torrent file or a magnet URI it
//! finds peers via trackers and the DHT, downloads and verifies every
//! piece over the peer wire protocol, and writes the result to disk.

pub mod bencode;
pub mod dht;
pub mod download;
pub mod error;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use bencode::Value;
pub use download::{run, LISTEN_PORT};
pub use error::TorrentError;
pub use peer::{Handshake, Message, MessageId, PeerSession};
pub use piece::{PieceResult, PieceWork};
pub use torrent::Torrent;
