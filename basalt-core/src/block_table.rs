//! Logical block allocation table.
//!
//! The table manages a fixed universe of logical block slots. Every slot is
//! in exactly one of three states: free, reserved (claimed for an in-flight
//! upload, timestamped for expiry), or allocated (confirmed with node
//! assignments and a `next_block` link forming the file's chain). The whole
//! table is persisted as a JSON snapshot after every mutation.

use crate::error::{BasaltError, Result};
use crate::node::NodeAddr;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const SNAPSHOT_VERSION: u32 = 1;

/// One logical block slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub is_allocated: bool,
    pub is_reserved: bool,
    pub reserved_at: Option<DateTime<Utc>>,
    pub primary_node: Option<NodeAddr>,
    #[serde(default)]
    pub replica_nodes: Vec<NodeAddr>,
    pub physical_number: Option<u32>,
    pub next_block: Option<u64>,
}

impl Block {
    fn reset(&mut self) {
        *self = Block::default();
    }

    pub fn status(&self) -> BlockStatus {
        if self.is_allocated {
            BlockStatus::Allocated
        } else if self.is_reserved {
            BlockStatus::Reserved
        } else {
            BlockStatus::Free
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Free,
    Reserved,
    Allocated,
}

/// One element of a file's block chain, in file order.
#[derive(Debug, Clone)]
pub struct ChainEntry {
    pub id: u64,
    pub physical_number: u32,
    pub primary: NodeAddr,
    pub replicas: Vec<NodeAddr>,
}

/// Aggregate table counters for the storage status command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub total: u64,
    pub used: u64,
    pub reserved: u64,
    pub free: u64,
    pub usage_percent: f64,
}

/// One row of the diagnostic block table dump.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockView {
    pub logical_id: u64,
    pub physical_number: Option<u32>,
    pub status: BlockStatus,
    pub primary_node: Option<String>,
    pub replica_nodes: Vec<String>,
    pub next_block: Option<u64>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockTableSnapshot {
    version: u32,
    total_blocks: u64,
    blocks: Vec<Block>,
    available: Vec<u64>,
    reserved: Vec<u64>,
}

#[derive(Debug)]
pub struct BlockTable {
    blocks: Vec<Block>,
    available: BTreeSet<u64>,
    reserved: HashSet<u64>,
    snapshot_path: PathBuf,
}

impl BlockTable {
    /// Fresh all-free table of `total_blocks` slots.
    pub fn new(total_blocks: u64, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            blocks: (0..total_blocks).map(|_| Block::default()).collect(),
            available: (0..total_blocks).collect(),
            reserved: HashSet::new(),
            snapshot_path: snapshot_path.into(),
        }
    }

    /// Load the persisted table from `snapshot_path`, or start fresh with
    /// `total_blocks` slots if no snapshot exists. A snapshot sized
    /// differently from the configuration keeps its own size.
    pub async fn load_or_create(total_blocks: u64, snapshot_path: impl Into<PathBuf>) -> Result<Self> {
        let snapshot_path = snapshot_path.into();
        if let Some(parent) = snapshot_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match fs::read(&snapshot_path).await {
            Ok(data) => {
                let snapshot: BlockTableSnapshot = serde_json::from_slice(&data)?;
                Self::from_snapshot(snapshot, total_blocks, snapshot_path)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    "no block table snapshot at {}, starting fresh with {} blocks",
                    snapshot_path.display(),
                    total_blocks
                );
                Ok(Self::new(total_blocks, snapshot_path))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn from_snapshot(
        snapshot: BlockTableSnapshot,
        configured_blocks: u64,
        snapshot_path: PathBuf,
    ) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(BasaltError::Internal(format!(
                "unsupported block table snapshot version {}",
                snapshot.version
            )));
        }
        if snapshot.blocks.len() as u64 != snapshot.total_blocks {
            return Err(BasaltError::Internal(format!(
                "block table snapshot declares {} blocks but carries {}",
                snapshot.total_blocks,
                snapshot.blocks.len()
            )));
        }
        if snapshot.total_blocks != configured_blocks {
            tracing::warn!(
                "block table snapshot holds {} blocks, configuration says {}; keeping the snapshot",
                snapshot.total_blocks,
                configured_blocks
            );
        }
        let total = snapshot.blocks.len() as u64;
        for &id in snapshot.available.iter().chain(snapshot.reserved.iter()) {
            if id >= total {
                return Err(BasaltError::Internal(format!(
                    "block table snapshot references block {} beyond capacity {}",
                    id, total
                )));
            }
        }
        tracing::info!(
            "loaded block table snapshot: {} blocks, {} free, {} reserved",
            total,
            snapshot.available.len(),
            snapshot.reserved.len()
        );
        Ok(Self {
            blocks: snapshot.blocks,
            available: snapshot.available.into_iter().collect(),
            reserved: snapshot.reserved.into_iter().collect(),
            snapshot_path,
        })
    }

    pub fn total_blocks(&self) -> u64 {
        self.blocks.len() as u64
    }

    pub fn available_count(&self) -> u64 {
        self.available.len() as u64
    }

    pub fn reserved_count(&self) -> u64 {
        self.reserved.len() as u64
    }

    pub fn allocated_count(&self) -> u64 {
        self.total_blocks() - self.available_count() - self.reserved_count()
    }

    pub fn has_available(&self, count: u64) -> bool {
        self.available_count() >= count
    }

    /// Atomically claim `count` free blocks, lowest ids first. All-or-nothing:
    /// on `InsufficientSpace` no block changes state.
    pub fn reserve_blocks(&mut self, count: u64) -> Result<Vec<u64>> {
        if !self.has_available(count) {
            return Err(BasaltError::InsufficientSpace {
                requested: count,
                available: self.available_count(),
            });
        }
        let now = Utc::now();
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if let Some(id) = self.available.pop_first() {
                let block = &mut self.blocks[id as usize];
                block.is_reserved = true;
                block.reserved_at = Some(now);
                self.reserved.insert(id);
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Move a reserved block to allocated, stamping its node assignment,
    /// physical position, and chain link.
    pub fn confirm_allocation(
        &mut self,
        id: u64,
        primary: NodeAddr,
        replicas: Vec<NodeAddr>,
        physical_number: u32,
        next_block: Option<u64>,
    ) -> Result<()> {
        if !self.reserved.remove(&id) {
            return Err(BasaltError::NotReserved(id));
        }
        let block = &mut self.blocks[id as usize];
        block.is_reserved = false;
        block.reserved_at = None;
        block.is_allocated = true;
        block.primary_node = Some(primary);
        block.replica_nodes = replicas;
        block.physical_number = Some(physical_number);
        block.next_block = next_block;
        Ok(())
    }

    /// Return reserved blocks to the free set. Ids that are not currently
    /// reserved are skipped, so cancelling twice is harmless.
    pub fn cancel_reservations(&mut self, ids: &[u64]) {
        for &id in ids {
            if self.reserved.remove(&id) {
                if let Some(block) = self.blocks.get_mut(id as usize) {
                    block.reset();
                }
                self.available.insert(id);
            }
        }
    }

    /// Cancel every reservation older than `timeout` and return the freed
    /// ids. Run periodically to reclaim slots from uploads that died between
    /// reserving and confirming.
    pub fn cancel_expired(&mut self, timeout: Duration) -> Vec<u64> {
        let now = Utc::now();
        let expired: Vec<u64> = self
            .reserved
            .iter()
            .copied()
            .filter(|&id| match self.blocks[id as usize].reserved_at {
                Some(at) => now.signed_duration_since(at) > timeout,
                None => true,
            })
            .collect();
        self.cancel_reservations(&expired);
        expired
    }

    /// Free every allocated block reachable from `first_id` and return how
    /// many were freed. Stops at the first non-allocated block, so a chain
    /// left half-built by an earlier failure frees cleanly.
    pub fn free_chain(&mut self, first_id: u64) -> u64 {
        let mut freed = 0u64;
        let mut current = Some(first_id);
        while let Some(id) = current {
            let Some(block) = self.blocks.get_mut(id as usize) else {
                break;
            };
            if !block.is_allocated {
                break;
            }
            current = block.next_block;
            block.reset();
            self.available.insert(id);
            freed += 1;
        }
        freed
    }

    /// Read-only chain walk from `first_id`, in file order. Stops at the
    /// first non-allocated block.
    pub fn chain(&self, first_id: u64) -> Vec<ChainEntry> {
        let mut entries = Vec::new();
        let mut current = Some(first_id);
        while let Some(id) = current {
            let Some(block) = self.blocks.get(id as usize) else {
                break;
            };
            if !block.is_allocated {
                break;
            }
            let (Some(primary), Some(physical_number)) =
                (block.primary_node.clone(), block.physical_number)
            else {
                break;
            };
            entries.push(ChainEntry {
                id,
                physical_number,
                primary,
                replicas: block.replica_nodes.clone(),
            });
            if entries.len() > self.blocks.len() {
                break;
            }
            current = block.next_block;
        }
        entries
    }

    pub fn system_status(&self) -> SystemStatus {
        let total = self.total_blocks();
        let free = self.available_count();
        let reserved = self.reserved_count();
        let used = total - free - reserved;
        let usage_percent = if total == 0 {
            0.0
        } else {
            used as f64 * 100.0 / total as f64
        };
        SystemStatus {
            total,
            used,
            reserved,
            free,
            usage_percent,
        }
    }

    /// Diagnostic view of every slot, in logical id order.
    pub fn dump(&self) -> Vec<BlockView> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(id, block)| BlockView {
                logical_id: id as u64,
                physical_number: block.physical_number,
                status: block.status(),
                primary_node: block.primary_node.as_ref().map(|node| node.to_string()),
                replica_nodes: block
                    .replica_nodes
                    .iter()
                    .map(|node| node.to_string())
                    .collect(),
                next_block: block.next_block,
            })
            .collect()
    }

    /// Iterate allocated blocks; used to rebuild node usage counters at
    /// startup.
    pub fn allocated_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|block| block.is_allocated)
    }

    /// Write the full table snapshot. A temporary file is renamed over the
    /// target so a crash never leaves a half-written snapshot behind.
    pub async fn save(&self) -> Result<()> {
        let mut reserved: Vec<u64> = self.reserved.iter().copied().collect();
        reserved.sort_unstable();
        let snapshot = BlockTableSnapshot {
            version: SNAPSHOT_VERSION,
            total_blocks: self.total_blocks(),
            blocks: self.blocks.clone(),
            available: self.available.iter().copied().collect(),
            reserved,
        };
        let data = serde_json::to_vec_pretty(&snapshot)?;

        let temp_path = self.snapshot_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &self.snapshot_path).await?;

        tracing::debug!(
            "saved block table snapshot ({} free, {} reserved, {} allocated)",
            self.available_count(),
            self.reserved_count(),
            self.allocated_count()
        );
        Ok(())
    }
}
