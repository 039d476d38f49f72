//! File registry: filename → block chain bookkeeping.

use crate::error::{BasaltError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const SNAPSHOT_VERSION: u32 = 1;

/// One stored file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub id: u64,
    pub filename: String,
    pub total_size: u64,
    pub created_at: DateTime<Utc>,
    pub first_block_id: Option<u64>,
    pub block_count: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileTableSnapshot {
    version: u32,
    files: BTreeMap<u64, FileEntry>,
    name_to_id: HashMap<String, u64>,
    next_file_id: u64,
}

/// Maps file ids to entries plus a filename index. File ids are handed out
/// by a monotonic counter and never reused, even across restarts.
pub struct FileTable {
    files: BTreeMap<u64, FileEntry>,
    name_to_id: HashMap<String, u64>,
    next_file_id: u64,
    snapshot_path: PathBuf,
}

impl FileTable {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            files: BTreeMap::new(),
            name_to_id: HashMap::new(),
            next_file_id: 1,
            snapshot_path: snapshot_path.into(),
        }
    }

    /// Load the persisted table from `snapshot_path`, or start empty.
    pub async fn load_or_create(snapshot_path: impl Into<PathBuf>) -> Result<Self> {
        let snapshot_path = snapshot_path.into();
        if let Some(parent) = snapshot_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match fs::read(&snapshot_path).await {
            Ok(data) => {
                let snapshot: FileTableSnapshot = serde_json::from_slice(&data)?;
                Self::from_snapshot(snapshot, snapshot_path)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    "no file table snapshot at {}, starting empty",
                    snapshot_path.display()
                );
                Ok(Self::new(snapshot_path))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn from_snapshot(snapshot: FileTableSnapshot, snapshot_path: PathBuf) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(BasaltError::Internal(format!(
                "unsupported file table snapshot version {}",
                snapshot.version
            )));
        }
        for (name, id) in &snapshot.name_to_id {
            match snapshot.files.get(id) {
                Some(entry) if entry.filename == *name => {}
                _ => {
                    return Err(BasaltError::Internal(format!(
                        "file table snapshot index entry {} -> {} does not match any file",
                        name, id
                    )));
                }
            }
        }
        tracing::info!("loaded file table snapshot: {} files", snapshot.files.len());
        Ok(Self {
            files: snapshot.files,
            name_to_id: snapshot.name_to_id,
            next_file_id: snapshot.next_file_id,
            snapshot_path,
        })
    }

    /// Register a new file and return its id. The chain fields start unset
    /// and are filled in once allocation succeeds.
    pub fn create_file(&mut self, filename: &str, total_size: u64) -> Result<u64> {
        if self.name_to_id.contains_key(filename) {
            return Err(BasaltError::AlreadyExists(filename.to_string()));
        }
        let id = self.next_file_id;
        self.next_file_id += 1;
        self.files.insert(
            id,
            FileEntry {
                id,
                filename: filename.to_string(),
                total_size,
                created_at: Utc::now(),
                first_block_id: None,
                block_count: 0,
            },
        );
        self.name_to_id.insert(filename.to_string(), id);
        Ok(id)
    }

    pub fn set_first_block(&mut self, file_id: u64, block_id: u64) -> Result<()> {
        let entry = self
            .files
            .get_mut(&file_id)
            .ok_or_else(|| BasaltError::NotFound(format!("file id {}", file_id)))?;
        entry.first_block_id = Some(block_id);
        Ok(())
    }

    pub fn update_block_count(&mut self, file_id: u64, block_count: u64) -> Result<()> {
        let entry = self
            .files
            .get_mut(&file_id)
            .ok_or_else(|| BasaltError::NotFound(format!("file id {}", file_id)))?;
        entry.block_count = block_count;
        Ok(())
    }

    /// Remove a file and its name index entry, returning the removed entry.
    pub fn delete_file(&mut self, file_id: u64) -> Result<FileEntry> {
        let entry = self
            .files
            .remove(&file_id)
            .ok_or_else(|| BasaltError::NotFound(format!("file id {}", file_id)))?;
        self.name_to_id.remove(&entry.filename);
        Ok(entry)
    }

    pub fn get_by_name(&self, filename: &str) -> Option<&FileEntry> {
        self.name_to_id
            .get(filename)
            .and_then(|id| self.files.get(id))
    }

    /// Snapshot of every entry, in file id order.
    pub fn get_all(&self) -> Vec<FileEntry> {
        self.files.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.values()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Write the full table snapshot via a temporary file and rename.
    pub async fn save(&self) -> Result<()> {
        let snapshot = FileTableSnapshot {
            version: SNAPSHOT_VERSION,
            files: self.files.clone(),
            name_to_id: self.name_to_id.clone(),
            next_file_id: self.next_file_id,
        };
        let data = serde_json::to_vec_pretty(&snapshot)?;

        let temp_path = self.snapshot_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &self.snapshot_path).await?;

        tracing::debug!("saved file table snapshot ({} files)", self.files.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_lookup() {
        let mut table = FileTable::new("/tmp/unused.json");

        let id = table.create_file("report.pdf", 1000).unwrap();
        table.set_first_block(id, 7).unwrap();
        table.update_block_count(id, 2).unwrap();

        let entry = table.get_by_name("report.pdf").unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.total_size, 1000);
        assert_eq!(entry.first_block_id, Some(7));
        assert_eq!(entry.block_count, 2);
    }

    #[test]
    fn test_duplicate_filename_rejected() {
        let mut table = FileTable::new("/tmp/unused.json");

        table.create_file("a.bin", 10).unwrap();
        let err = table.create_file("a.bin", 20).unwrap_err();
        assert!(matches!(err, BasaltError::AlreadyExists(_)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_delete_removes_name_index() {
        let mut table = FileTable::new("/tmp/unused.json");

        let id = table.create_file("a.bin", 10).unwrap();
        let removed = table.delete_file(id).unwrap();
        assert_eq!(removed.filename, "a.bin");
        assert!(table.get_by_name("a.bin").is_none());

        // The name is free again but the id is not reused.
        let second = table.create_file("a.bin", 20).unwrap();
        assert!(second > id);
    }

    #[test]
    fn test_missing_file_id_errors() {
        let mut table = FileTable::new("/tmp/unused.json");

        assert!(matches!(
            table.set_first_block(99, 0).unwrap_err(),
            BasaltError::NotFound(_)
        ));
        assert!(matches!(
            table.delete_file(99).unwrap_err(),
            BasaltError::NotFound(_)
        ));
    }

    #[test]
    fn test_get_all_is_ordered_by_id() {
        let mut table = FileTable::new("/tmp/unused.json");

        table.create_file("b.bin", 1).unwrap();
        table.create_file("a.bin", 2).unwrap();
        table.create_file("c.bin", 3).unwrap();

        let all = table.get_all();
        let names: Vec<&str> = all.iter().map(|entry| entry.filename.as_str()).collect();
        assert_eq!(names, vec!["b.bin", "a.bin", "c.bin"]);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("file_table.json");

        let mut table = FileTable::new(&path);
        let id = table.create_file("report.pdf", 1000).unwrap();
        table.set_first_block(id, 3).unwrap();
        table.update_block_count(id, 4).unwrap();
        let deleted = table.create_file("gone.bin", 1).unwrap();
        table.delete_file(deleted).unwrap();
        table.save().await.unwrap();

        let loaded = FileTable::load_or_create(&path).await.unwrap();
        assert_eq!(loaded.len(), 1);
        let entry = loaded.get_by_name("report.pdf").unwrap();
        assert_eq!(entry.first_block_id, Some(3));
        assert_eq!(entry.block_count, 4);

        // The id counter survives the round trip.
        assert_eq!(loaded.next_file_id, table.next_file_id);
    }
}
