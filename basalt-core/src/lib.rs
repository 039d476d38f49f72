//! Basalt Core - Core library for block-based distributed file storage
//!
//! A coordinator-plus-storage-node system using:
//! - A fixed-size logical block table with linked block chains
//! - Reserve/confirm block accounting with expiry sweeps
//! - Primary plus replica placement across storage nodes
//! - JSON snapshots for crash-safe table persistence

pub mod block_store;
pub mod block_table;
pub mod coordinator;
pub mod error;
pub mod file_table;
pub mod node;
pub mod node_client;
pub mod protocol;
pub mod storage_node;

pub use block_store::{BlockStore, file_stem, validate_filename};
pub use block_table::{Block, BlockStatus, BlockTable, BlockView, ChainEntry, SystemStatus};
pub use coordinator::{Coordinator, CoordinatorOptions};
pub use error::{BasaltError, Result};
pub use file_table::{FileEntry, FileTable};
pub use node::{BlockTargets, NodeAddr, NodeRegistry, NodeSpec};
pub use node_client::NodeClient;
pub use protocol::{BlockCommand, Command, NodeStatus, Response};
pub use storage_node::{StorageNode, StorageNodeOptions};
