//! Coordinator-side client for storage node calls.
//!
//! Every call opens its own connection and drops it on return, on every
//! path. Failures never propagate: they are logged with the node address
//! and collapsed to a `bool`/`Option` result, leaving retry and replica
//! fallback policy to the caller.

use crate::error::{BasaltError, Result};
use crate::node::NodeAddr;
use crate::protocol::{self, BlockCommand, BlockFetchMeta, BlockUploadMeta, NodeStatus, Response};
use bytes::Bytes;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct NodeClient {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl Default for NodeClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }
}

impl NodeClient {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }

    /// Send one block to a node. `true` iff the node acknowledged the write.
    pub async fn write_block(
        &self,
        node: &NodeAddr,
        filename: &str,
        physical_number: u32,
        data: &[u8],
    ) -> bool {
        let call = self.try_write_block(node, filename, physical_number, data);
        match timeout(self.io_timeout, call).await {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                tracing::warn!("block write to {} failed: {}", node, error);
                false
            }
            Err(_) => {
                tracing::warn!("block write to {} timed out", node);
                false
            }
        }
    }

    /// Fetch one block from a node. `None` covers both "node does not have
    /// the block" and every connection-level failure.
    pub async fn read_block(
        &self,
        node: &NodeAddr,
        filename: &str,
        physical_number: u32,
    ) -> Option<Bytes> {
        let call = self.try_read_block(node, filename, physical_number);
        match timeout(self.io_timeout, call).await {
            Ok(Ok(Some(bytes))) => Some(bytes),
            Ok(Ok(None)) => {
                tracing::debug!(
                    "node {} does not hold block {} of {}",
                    node,
                    physical_number,
                    filename
                );
                None
            }
            Ok(Err(error)) => {
                tracing::warn!("block read from {} failed: {}", node, error);
                None
            }
            Err(_) => {
                tracing::warn!("block read from {} timed out", node);
                None
            }
        }
    }

    /// Delete every block a node holds for `filename`.
    pub async fn delete_blocks(&self, node: &NodeAddr, filename: &str) -> bool {
        let call = self.try_delete_blocks(node, filename);
        match timeout(self.io_timeout, call).await {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                tracing::warn!("block delete on {} failed: {}", node, error);
                false
            }
            Err(_) => {
                tracing::warn!("block delete on {} timed out", node);
                false
            }
        }
    }

    /// Liveness check.
    pub async fn ping(&self, node: &NodeAddr) -> bool {
        let call = self.try_simple(node, BlockCommand::Ping);
        match timeout(self.io_timeout, call).await {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                tracing::warn!("ping to {} failed: {}", node, error);
                false
            }
            Err(_) => {
                tracing::warn!("ping to {} timed out", node);
                false
            }
        }
    }

    /// Query a node's advisory block/byte counters.
    pub async fn node_status(&self, node: &NodeAddr) -> Option<NodeStatus> {
        let call = self.try_node_status(node);
        match timeout(self.io_timeout, call).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(error)) => {
                tracing::warn!("status query to {} failed: {}", node, error);
                None
            }
            Err(_) => {
                tracing::warn!("status query to {} timed out", node);
                None
            }
        }
    }

    async fn connect(&self, node: &NodeAddr) -> Result<TcpStream> {
        let connecting = TcpStream::connect((node.host.as_str(), node.port));
        let stream = timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", node),
                )
            })??;
        Ok(stream)
    }

    async fn try_write_block(
        &self,
        node: &NodeAddr,
        filename: &str,
        physical_number: u32,
        data: &[u8],
    ) -> Result<()> {
        let mut stream = self.connect(node).await?;
        protocol::write_block_command(&mut stream, BlockCommand::UploadBlock).await?;
        let meta = BlockUploadMeta {
            filename: filename.to_string(),
            physical_number,
            size: data.len() as u64,
        };
        protocol::write_json(&mut stream, &meta).await?;

        let ack = protocol::read_response(&mut stream).await?;
        if ack != Response::Success {
            return Err(BasaltError::Protocol(format!(
                "node {} refused block write with {:?}",
                node, ack
            )));
        }
        stream.write_all(data).await?;

        let done = protocol::read_response(&mut stream).await?;
        if done != Response::UploadComplete {
            return Err(BasaltError::Protocol(format!(
                "node {} answered block write with {:?}",
                node, done
            )));
        }
        Ok(())
    }

    async fn try_read_block(
        &self,
        node: &NodeAddr,
        filename: &str,
        physical_number: u32,
    ) -> Result<Option<Bytes>> {
        let mut stream = self.connect(node).await?;
        protocol::write_block_command(&mut stream, BlockCommand::DownloadBlock).await?;
        let meta = BlockFetchMeta {
            filename: filename.to_string(),
            physical_number,
        };
        protocol::write_json(&mut stream, &meta).await?;

        match protocol::read_response(&mut stream).await? {
            Response::Success => {
                let size = protocol::read_size(&mut stream).await?;
                let bytes = protocol::read_payload(&mut stream, size).await?;
                Ok(Some(bytes))
            }
            Response::FileNotFound => Ok(None),
            other => Err(BasaltError::Protocol(format!(
                "node {} answered block read with {:?}",
                node, other
            ))),
        }
    }

    async fn try_delete_blocks(&self, node: &NodeAddr, filename: &str) -> Result<()> {
        let mut stream = self.connect(node).await?;
        protocol::write_block_command(&mut stream, BlockCommand::DeleteBlocks).await?;
        protocol::write_string(&mut stream, filename).await?;

        let response = protocol::read_response(&mut stream).await?;
        if response != Response::Success {
            return Err(BasaltError::Protocol(format!(
                "node {} answered block delete with {:?}",
                node, response
            )));
        }
        Ok(())
    }

    async fn try_simple(&self, node: &NodeAddr, command: BlockCommand) -> Result<()> {
        let mut stream = self.connect(node).await?;
        protocol::write_block_command(&mut stream, command).await?;

        let response = protocol::read_response(&mut stream).await?;
        if response != Response::Success {
            return Err(BasaltError::Protocol(format!(
                "node {} answered {:?} with {:?}",
                node, command, response
            )));
        }
        Ok(())
    }

    async fn try_node_status(&self, node: &NodeAddr) -> Result<NodeStatus> {
        let mut stream = self.connect(node).await?;
        protocol::write_block_command(&mut stream, BlockCommand::NodeStatus).await?;

        let response = protocol::read_response(&mut stream).await?;
        if response != Response::Success {
            return Err(BasaltError::Protocol(format!(
                "node {} answered status query with {:?}",
                node, response
            )));
        }
        Ok(protocol::read_json(&mut stream).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_node::{StorageNode, StorageNodeOptions};

    async fn start_node(root: std::path::PathBuf) -> NodeAddr {
        let node = StorageNode::bind(StorageNodeOptions {
            bind_addr: "127.0.0.1:0".to_string(),
            storage_root: root,
            recv_timeout: Duration::from_secs(5),
        })
        .await
        .unwrap();
        let addr = node.local_addr().unwrap();
        tokio::spawn(node.run());
        NodeAddr::new("127.0.0.1", addr.port())
    }

    async fn dead_node() -> NodeAddr {
        // Bind and immediately drop a listener so the port is very likely
        // closed when the client connects.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NodeAddr::new("127.0.0.1", listener.local_addr().unwrap().port());
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn test_write_then_read_block() {
        let temp_dir = tempfile::tempdir().unwrap();
        let node = start_node(temp_dir.path().to_path_buf()).await;
        let client = NodeClient::default();

        assert!(client.write_block(&node, "a.bin", 0, b"payload").await);
        let bytes = client.read_block(&node, "a.bin", 0).await.unwrap();
        assert_eq!(bytes.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_missing_block_reads_none() {
        let temp_dir = tempfile::tempdir().unwrap();
        let node = start_node(temp_dir.path().to_path_buf()).await;
        let client = NodeClient::default();

        assert!(client.read_block(&node, "ghost.bin", 0).await.is_none());
    }

    #[tokio::test]
    async fn test_delete_ping_and_status() {
        let temp_dir = tempfile::tempdir().unwrap();
        let node = start_node(temp_dir.path().to_path_buf()).await;
        let client = NodeClient::default();

        assert!(client.ping(&node).await);
        assert!(client.write_block(&node, "a.bin", 0, b"12345").await);

        let status = client.node_status(&node).await.unwrap();
        assert_eq!(status.block_count, 1);
        assert_eq!(status.bytes_used, 5);

        assert!(client.delete_blocks(&node, "a.bin").await);
        assert!(client.read_block(&node, "a.bin", 0).await.is_none());
    }

    #[tokio::test]
    async fn test_dead_node_collapses_to_failure() {
        let node = dead_node().await;
        let client = NodeClient::new(Duration::from_millis(500), Duration::from_secs(1));

        assert!(!client.ping(&node).await);
        assert!(!client.write_block(&node, "a.bin", 0, b"x").await);
        assert!(client.read_block(&node, "a.bin", 0).await.is_none());
        assert!(!client.delete_blocks(&node, "a.bin").await);
        assert!(client.node_status(&node).await.is_none());
    }
}
