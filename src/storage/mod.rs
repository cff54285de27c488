//! Destination file writing

pub mod sink;

pub use sink::write_to_disk;
