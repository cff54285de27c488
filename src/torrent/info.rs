//! Torrent information structures

use anyhow::Result;
use sha1::{Digest, Sha1};

use crate::bencode;
use crate::error::TorrentError;

const HASH_LEN: usize = 20;

/// One entry of a multi-file torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path components relative to the download root
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

/// The projected `info` dictionary
#[derive(Debug, Clone, Default)]
pub struct InfoDict {
    /// Torrent name; the output file name for single-file torrents
    pub name: String,
    /// Bytes per piece (the last piece may be shorter)
    pub piece_length: u64,
    /// Concatenated 20-byte SHA-1 piece hashes, as found in the torrent
    pub pieces: Vec<u8>,
    /// Content length for single-file torrents, 0 for multi-file
    pub length: u64,
    /// File list for multi-file torrents, empty for single-file
    pub files: Vec<FileEntry>,
}

/// Result of metadata extraction
#[derive(Debug, Clone)]
pub struct Torrent {
    /// Tracker URIs, flattened from `announce-list` or the magnet `tr` params
    pub announce_list: Vec<String>,
    /// SHA-1 over the canonically bencoded `info` dictionary
    pub info_hash: [u8; 20],
    /// One 20-byte hash per piece; empty until metadata is known
    pub piece_hashes: Vec<[u8; 20]>,
    /// The info dictionary; partially empty for magnet sources
    pub info: InfoDict,
}

impl Torrent {
    /// Total content bytes across all files
    pub fn total_length(&self) -> u64 {
        if self.info.files.is_empty() {
            self.info.length
        } else {
            self.info.files.iter().map(|f| f.length).sum()
        }
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size in bytes of the piece at `index`; the last piece holds the
    /// remainder of the content.
    pub fn piece_size(&self, index: usize) -> usize {
        let count = self.piece_count() as u64;
        let total = self.total_length();
        if index as u64 == count - 1 {
            (total - self.info.piece_length * (count - 1)) as usize
        } else {
            self.info.piece_length as usize
        }
    }

    pub fn is_multi_file(&self) -> bool {
        !self.info.files.is_empty()
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Split the raw `pieces` byte string into per-piece hashes.
    ///
    /// Called after extraction for .torrent sources, and again once BEP 9
    /// metadata arrives for magnet sources.
    pub fn calculate_piece_hashes(&mut self) -> Result<()> {
        if self.info.pieces.len() % HASH_LEN != 0 {
            return Err(TorrentError::decode(format!(
                "pieces field length {} is not a multiple of {}",
                self.info.pieces.len(),
                HASH_LEN
            ))
            .into());
        }

        let mut hashes = Vec::with_capacity(self.info.pieces.len() / HASH_LEN);
        for chunk in self.info.pieces.chunks_exact(HASH_LEN) {
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(chunk);
            hashes.push(hash);
        }

        self.piece_hashes = hashes;
        Ok(())
    }

    /// Fill in the info dictionary from a BEP 9 metadata blob.
    ///
    /// The blob is the bencoded `info` dictionary itself; it must SHA-1 to
    /// the expected info-hash before anything is taken from it.
    pub fn populate_from_metadata(&mut self, metadata: &[u8]) -> Result<()> {
        let digest: [u8; 20] = Sha1::digest(metadata).into();
        if digest != self.info_hash {
            return Err(TorrentError::protocol(
                "metadata does not hash to the expected info-hash",
            )
            .into());
        }

        let (value, _) = bencode::decode(metadata)?;
        self.info = crate::torrent::parser::parse_info_dict(&value)?;
        self.calculate_piece_hashes()
    }
}
