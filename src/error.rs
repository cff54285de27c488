//! Error types for the torrent downloader
//!
//! Every error carries a human-readable message plus a kind tag so the
//! dispatcher can decide between re-queueing work and abandoning a session.

use std::fmt;

/// Error type covering all components of the downloader
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Bencode violations; fatal to the containing operation, never retried
    Decode { message: String },

    /// Handshake mismatch, wrong transaction id, unexpected message id
    Protocol { message: String },

    /// Connection refused, reset, or timed out
    Transport { message: String },

    /// A downloaded piece failed SHA-1 verification
    HashMismatch { piece: u32 },

    /// Magnet source whose peers refuse or lack the metadata extension
    MetadataUnavailable { message: String },

    /// No peers connectable, or pieces unrecoverable after all sessions closed
    Exhausted { message: String },
}

impl TorrentError {
    /// Create a new Decode error
    pub fn decode(message: impl Into<String>) -> Self {
        TorrentError::Decode { message: message.into() }
    }

    /// Create a new Protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        TorrentError::Protocol { message: message.into() }
    }

    /// Create a new Transport error
    pub fn transport(message: impl Into<String>) -> Self {
        TorrentError::Transport { message: message.into() }
    }

    /// Create a new HashMismatch error for a piece index
    pub fn hash_mismatch(piece: u32) -> Self {
        TorrentError::HashMismatch { piece }
    }

    /// Create a new MetadataUnavailable error
    pub fn metadata_unavailable(message: impl Into<String>) -> Self {
        TorrentError::MetadataUnavailable { message: message.into() }
    }

    /// Create a new Exhausted error
    pub fn exhausted(message: impl Into<String>) -> Self {
        TorrentError::Exhausted { message: message.into() }
    }

    /// Kind tag for structured log lines
    pub fn kind(&self) -> &'static str {
        match self {
            TorrentError::Decode { .. } => "decode",
            TorrentError::Protocol { .. } => "protocol",
            TorrentError::Transport { .. } => "transport",
            TorrentError::HashMismatch { .. } => "hash-mismatch",
            TorrentError::MetadataUnavailable { .. } => "metadata-unavailable",
            TorrentError::Exhausted { .. } => "exhausted",
        }
    }

    /// Whether a session hitting this error should be torn down rather than
    /// retried. Transport and protocol failures poison the connection; a
    /// hash mismatch only poisons the attempt.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            TorrentError::Transport { .. } | TorrentError::Protocol { .. }
        )
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::Decode { message } => write!(f, "decode error: {}", message),
            TorrentError::Protocol { message } => write!(f, "protocol error: {}", message),
            TorrentError::Transport { message } => write!(f, "transport error: {}", message),
            TorrentError::HashMismatch { piece } => {
                write!(f, "hash mismatch for piece {}", piece)
            }
            TorrentError::MetadataUnavailable { message } => {
                write!(f, "metadata unavailable: {}", message)
            }
            TorrentError::Exhausted { message } => write!(f, "exhausted: {}", message),
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::transport(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TorrentError::transport("operation timed out")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_kind_and_message() {
        let err = TorrentError::decode("keys are not sorted");
        assert_eq!(err.to_string(), "decode error: keys are not sorted");
        assert_eq!(err.kind(), "decode");
    }

    #[test]
    fn test_hash_mismatch_names_piece() {
        let err = TorrentError::hash_mismatch(7);
        assert_eq!(err.to_string(), "hash mismatch for piece 7");
        assert!(!err.is_session_fatal());
    }

    #[test]
    fn test_session_fatal_kinds() {
        assert!(TorrentError::transport("reset").is_session_fatal());
        assert!(TorrentError::protocol("bad id").is_session_fatal());
        assert!(!TorrentError::decode("x").is_session_fatal());
        assert!(!TorrentError::exhausted("x").is_session_fatal());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: TorrentError = io_err.into();
        assert!(matches!(err, TorrentError::Transport { .. }));
    }
}
