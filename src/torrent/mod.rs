//! Torrent metadata handling
//!
//! Parsing of .torrent files and magnet links into a `Torrent` record.

pub mod info;
pub mod magnet;
pub mod parser;

pub use info::{FileEntry, InfoDict, Torrent};
pub use magnet::extract_magnet;
pub use parser::extract;
