//! File sink
//!
//! Writes the assembled download buffer to one file or slices it across a
//! multi-file layout. Paths from the torrent are treated as relative to
//! the output directory; anything that could escape it is fatal.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::fs;
use tracing::{debug, info};

use crate::error::TorrentError;
use crate::torrent::Torrent;

/// Write the assembled content buffer to disk under `output_dir`.
pub async fn write_to_disk(torrent: &Torrent, data: &[u8], output_dir: &Path) -> Result<()> {
    fs::create_dir_all(output_dir).await.map_err(|e| {
        TorrentError::transport(format!(
            "failed to create output directory '{}': {}",
            output_dir.display(),
            e
        ))
    })?;

    if !torrent.is_multi_file() {
        let path = output_dir.join(checked_component(&torrent.info.name)?);
        info!("writing {} bytes to {}", data.len(), path.display());
        fs::write(&path, data).await.map_err(|e| {
            TorrentError::transport(format!("failed to write '{}': {}", path.display(), e))
        })?;
        return Ok(());
    }

    let mut offset = 0usize;
    for file in &torrent.info.files {
        let relative = checked_path(&file.path)?;
        let path = output_dir.join(relative);
        let end = offset + file.length as usize;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                TorrentError::transport(format!(
                    "failed to create directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        debug!("writing {} bytes to {}", file.length, path.display());
        fs::write(&path, &data[offset..end]).await.map_err(|e| {
            TorrentError::transport(format!("failed to write '{}': {}", path.display(), e))
        })?;
        offset = end;
    }

    info!("wrote {} files under {}", torrent.info.files.len(), output_dir.display());
    Ok(())
}

/// Join validated path components with the platform separator.
fn checked_path(components: &[String]) -> Result<PathBuf> {
    if components.is_empty() {
        return Err(TorrentError::decode("file entry has an empty path").into());
    }

    let mut path = PathBuf::new();
    for component in components {
        path.push(checked_component(component)?);
    }
    Ok(path)
}

/// A single path component must stay inside the download root: no `..`,
/// no empty names, no embedded separators or absolute prefixes.
fn checked_component(component: &str) -> Result<&str> {
    if component.is_empty()
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
    {
        return Err(TorrentError::decode(format!(
            "path component '{}' would escape the download root",
            component
        ))
        .into());
    }
    Ok(component)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::info::{FileEntry, InfoDict};

    fn torrent_named(name: &str, files: Vec<FileEntry>) -> Torrent {
        let length = if files.is_empty() { 8 } else { 0 };
        Torrent {
            announce_list: Vec::new(),
            info_hash: [0u8; 20],
            piece_hashes: Vec::new(),
            info: InfoDict {
                name: name.to_string(),
                piece_length: 4,
                pieces: Vec::new(),
                length,
                files,
            },
        }
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("swarmget-test-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_single_file_write() {
        let dir = scratch_dir("single");
        let torrent = torrent_named("out.bin", Vec::new());
        let data = b"8 bytes!".to_vec();

        write_to_disk(&torrent, &data, &dir).await.unwrap();

        let written = std::fs::read(dir.join("out.bin")).unwrap();
        assert_eq!(written, data);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_multi_file_write_slices_buffer() {
        let dir = scratch_dir("multi");
        let torrent = torrent_named(
            "bundle",
            vec![
                FileEntry { path: vec!["a.bin".to_string()], length: 3 },
                FileEntry { path: vec!["sub".to_string(), "b.bin".to_string()], length: 5 },
            ],
        );
        let data = b"AAABBBBB".to_vec();

        write_to_disk(&torrent, &data, &dir).await.unwrap();

        assert_eq!(std::fs::read(dir.join("a.bin")).unwrap(), b"AAA");
        assert_eq!(std::fs::read(dir.join("sub").join("b.bin")).unwrap(), b"BBBBB");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_traversal_component_is_rejected() {
        let dir = scratch_dir("traversal");
        let torrent = torrent_named(
            "bundle",
            vec![FileEntry {
                path: vec!["..".to_string(), "escape.bin".to_string()],
                length: 8,
            }],
        );

        let err = write_to_disk(&torrent, b"AAAABBBB", &dir).await.unwrap_err();
        assert!(err.to_string().contains("escape"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_separator_in_component_is_rejected() {
        let dir = scratch_dir("separator");
        let torrent = torrent_named("../sneaky.bin", Vec::new());
        assert!(write_to_disk(&torrent, b"12345678", &dir).await.is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_checked_path() {
        assert!(checked_path(&[]).is_err());
        assert!(checked_path(&["ok".to_string(), "..".to_string()]).is_err());
        assert_eq!(
            checked_path(&["a".to_string(), "b".to_string()]).unwrap(),
            PathBuf::from("a").join("b")
        );
    }
}
