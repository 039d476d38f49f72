//! Physical block files on a storage node's disk.
//!
//! Blocks live under `<root>/<fileStem>/block_<physicalNumber>.bin`. The
//! filesystem is the source of truth; the store keeps advisory block and
//! byte counters for status reporting only.

use crate::error::{BasaltError, Result};
use crate::protocol::{self, NodeStatus};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncRead;

/// The filename with its final extension removed, or the full name if it
/// has none. Determines the block directory a file's blocks live in.
pub fn file_stem(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(pos) if pos > 0 => &filename[..pos],
        _ => filename,
    }
}

/// Refuse wire-supplied filenames that could escape the block root.
///
/// The stem is checked as well as the raw name: `"..."` stems to `".."`
/// and `"..a"` stems to `"."`, either of which would place the block
/// directory outside the root.
pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty() {
        return Err(BasaltError::InvalidRequest("empty filename".to_string()));
    }
    if filename.contains('/') || filename.contains('\\') || filename.contains('\0') {
        return Err(BasaltError::InvalidRequest(format!(
            "filename {:?} contains a path separator",
            filename
        )));
    }
    let stem = file_stem(filename);
    if filename == "." || filename == ".." || stem == "." || stem == ".." {
        return Err(BasaltError::InvalidRequest(format!(
            "filename {:?} is a path component",
            filename
        )));
    }
    Ok(())
}

pub struct BlockStore {
    root: PathBuf,
    block_count: AtomicU64,
    bytes_used: AtomicU64,
}

impl BlockStore {
    /// Open the store rooted at `root`, creating it if absent, and rebuild
    /// the advisory counters from the block files already on disk.
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;

        let mut block_count = 0u64;
        let mut bytes_used = 0u64;
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            for block in std::fs::read_dir(entry.path())? {
                let block = block?;
                if block.path().extension().and_then(|ext| ext.to_str()) == Some("bin") {
                    block_count += 1;
                    bytes_used += block.metadata()?.len();
                }
            }
        }

        Ok(Self {
            root,
            block_count: AtomicU64::new(block_count),
            bytes_used: AtomicU64::new(bytes_used),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            block_count: self.block_count.load(Ordering::Relaxed),
            bytes_used: self.bytes_used.load(Ordering::Relaxed),
        }
    }

    /// Stream `size` bytes from `reader` into a block file. The payload goes
    /// to a temporary file first and is renamed into place, so a truncated
    /// transfer never leaves a partial block behind.
    pub async fn write_block<R>(
        &self,
        filename: &str,
        physical_number: u32,
        size: u64,
        reader: &mut R,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let block_path = self.block_path(filename, physical_number);
        fs::create_dir_all(self.file_dir(filename)).await?;

        let temp_path = block_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        if let Err(err) = protocol::copy_payload(reader, &mut file, size).await {
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }
        file.sync_all().await?;
        drop(file);

        // When overwriting a block, fold the old size out of the counters.
        let replaced = match fs::metadata(&block_path).await {
            Ok(meta) => Some(meta.len()),
            Err(_) => None,
        };
        fs::rename(&temp_path, &block_path).await?;

        match replaced {
            Some(old_size) => self.sub_bytes(old_size),
            None => {
                self.block_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.bytes_used.fetch_add(size, Ordering::Relaxed);

        tracing::debug!(
            "stored block {} for {} ({} bytes)",
            physical_number,
            filename,
            size
        );
        Ok(())
    }

    /// Open a block for reading, returning its size and file handle, or
    /// `None` if the block is not on this node.
    pub async fn open_block(
        &self,
        filename: &str,
        physical_number: u32,
    ) -> Result<Option<(u64, fs::File)>> {
        let block_path = self.block_path(filename, physical_number);
        match fs::File::open(&block_path).await {
            Ok(file) => {
                let size = file.metadata().await?.len();
                Ok(Some((size, file)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete every block file a filename owns and return how many were
    /// removed. An absent directory counts as zero, so deleting twice is
    /// harmless.
    pub async fn delete_blocks(&self, filename: &str) -> Result<u64> {
        let dir = self.file_dir(filename);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut deleted = 0u64;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("bin") {
                continue;
            }
            let size = entry.metadata().await.map(|meta| meta.len()).unwrap_or(0);
            fs::remove_file(&path).await?;
            self.sub_bytes(size);
            self.sub_blocks(1);
            deleted += 1;
        }
        // Remove the directory if nothing is left in it.
        let _ = fs::remove_dir(&dir).await;

        tracing::debug!("deleted {} blocks for {}", deleted, filename);
        Ok(deleted)
    }

    fn file_dir(&self, filename: &str) -> PathBuf {
        self.root.join(file_stem(filename))
    }

    fn block_path(&self, filename: &str, physical_number: u32) -> PathBuf {
        self.file_dir(filename)
            .join(format!("block_{}.bin", physical_number))
    }

    fn sub_bytes(&self, n: u64) {
        let _ = self
            .bytes_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_sub(n))
            });
    }

    fn sub_blocks(&self, n: u64) {
        let _ = self
            .block_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_sub(n))
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn write(store: &BlockStore, filename: &str, number: u32, data: &[u8]) {
        let mut reader = std::io::Cursor::new(data.to_vec());
        store
            .write_block(filename, number, data.len() as u64, &mut reader)
            .await
            .unwrap();
    }

    async fn read(store: &BlockStore, filename: &str, number: u32) -> Vec<u8> {
        let (size, mut file) = store.open_block(filename, number).await.unwrap().unwrap();
        let mut data = Vec::new();
        file.read_to_end(&mut data).await.unwrap();
        assert_eq!(size, data.len() as u64);
        data
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("report.pdf"), "report");
        assert_eq!(file_stem("archive.tar.gz"), "archive.tar");
        assert_eq!(file_stem("noext"), "noext");
        assert_eq!(file_stem(".hidden"), ".hidden");
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("report.pdf").is_ok());
        assert!(validate_filename("archive.tar.gz").is_ok());
        assert!(validate_filename(".hidden").is_ok());
        assert!(validate_filename("").is_err());
        assert!(validate_filename(".").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename("a/b.bin").is_err());
        assert!(validate_filename("a\\b.bin").is_err());
        // Stems to ".." and "." respectively.
        assert!(validate_filename("...").is_err());
        assert!(validate_filename("..a").is_err());
    }

    #[tokio::test]
    async fn test_write_and_read_block() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BlockStore::new(temp_dir.path().to_path_buf()).unwrap();

        write(&store, "report.pdf", 0, b"first block").await;
        write(&store, "report.pdf", 1, b"second block").await;

        assert_eq!(read(&store, "report.pdf", 0).await, b"first block");
        assert_eq!(read(&store, "report.pdf", 1).await, b"second block");
        assert!(temp_dir.path().join("report/block_0.bin").exists());

        let status = store.status();
        assert_eq!(status.block_count, 2);
        assert_eq!(status.bytes_used, 23);
    }

    #[tokio::test]
    async fn test_missing_block_is_none() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BlockStore::new(temp_dir.path().to_path_buf()).unwrap();

        assert!(store.open_block("ghost.bin", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_blocks_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BlockStore::new(temp_dir.path().to_path_buf()).unwrap();

        write(&store, "a.bin", 0, b"x").await;
        write(&store, "a.bin", 1, b"y").await;

        assert_eq!(store.delete_blocks("a.bin").await.unwrap(), 2);
        assert!(!temp_dir.path().join("a").exists());
        assert_eq!(store.delete_blocks("a.bin").await.unwrap(), 0);

        let status = store.status();
        assert_eq!(status.block_count, 0);
        assert_eq!(status.bytes_used, 0);
    }

    #[tokio::test]
    async fn test_truncated_write_leaves_no_block() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BlockStore::new(temp_dir.path().to_path_buf()).unwrap();

        let mut reader = std::io::Cursor::new(b"short".to_vec());
        let err = store
            .write_block("a.bin", 0, 100, &mut reader)
            .await
            .unwrap_err();
        assert!(matches!(err, BasaltError::TruncatedTransfer { .. }));
        assert!(store.open_block("a.bin", 0).await.unwrap().is_none());
        assert_eq!(store.status().block_count, 0);
    }

    #[tokio::test]
    async fn test_counters_rebuilt_on_open() {
        let temp_dir = tempfile::tempdir().unwrap();
        {
            let store = BlockStore::new(temp_dir.path().to_path_buf()).unwrap();
            write(&store, "a.bin", 0, b"hello").await;
            write(&store, "b.bin", 0, b"world!").await;
        }

        let reopened = BlockStore::new(temp_dir.path().to_path_buf()).unwrap();
        let status = reopened.status();
        assert_eq!(status.block_count, 2);
        assert_eq!(status.bytes_used, 11);
    }
}
