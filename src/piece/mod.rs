//! Piece download engine
//!
//! Pipelined block requests and SHA-1 verification for one piece at a time
//! against a single peer session.

pub mod engine;

pub use engine::{try_download_piece, PieceResult, PieceWork, MAX_BLOCK_SIZE, MAX_PIPELINE_REQUESTS};
