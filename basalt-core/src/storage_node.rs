//! Storage node: a standalone TCP service for physical blocks.
//!
//! The node knows nothing about the coordinator's tables. It answers five
//! block-level commands (upload, download, delete, ping, status) against a
//! `BlockStore`, one session task per connection. A per-recv timeout closes
//! sessions whose coordinator died mid-conversation.

use crate::block_store::{BlockStore, validate_filename};
use crate::error::{BasaltError, Result};
use crate::protocol::{self, BlockCommand, BlockFetchMeta, BlockUploadMeta, Response};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct StorageNodeOptions {
    pub bind_addr: String,
    pub storage_root: PathBuf,
    pub recv_timeout: Duration,
}

pub struct StorageNode {
    listener: TcpListener,
    store: Arc<BlockStore>,
    recv_timeout: Duration,
}

impl StorageNode {
    /// Open the block store and bind the listener.
    pub async fn bind(options: StorageNodeOptions) -> Result<Self> {
        let store = Arc::new(BlockStore::new(options.storage_root)?);
        let listener = TcpListener::bind(&options.bind_addr).await?;
        Ok(Self {
            listener,
            store,
            recv_timeout: options.recv_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve connections until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            "storage node listening on {} (root {})",
            self.listener.local_addr()?,
            self.store.root().display()
        );
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let store = self.store.clone();
                    let recv_timeout = self.recv_timeout;
                    tokio::spawn(async move {
                        if let Err(err) = run_session(stream, peer, store, recv_timeout).await {
                            tracing::warn!("storage session with {} ended with error: {}", peer, err);
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received, storage node stopping");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn run_session(
    mut stream: TcpStream,
    peer: SocketAddr,
    store: Arc<BlockStore>,
    recv_timeout: Duration,
) -> Result<()> {
    tracing::debug!("storage session opened by {}", peer);
    loop {
        let code = match timeout(recv_timeout, protocol::read_code(&mut stream)).await {
            Ok(Ok(code)) => code,
            Ok(Err(BasaltError::Io(err)))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                tracing::debug!("storage session with {} closed", peer);
                return Ok(());
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                tracing::debug!(
                    "storage session with {} idle for {:?}, closing",
                    peer,
                    recv_timeout
                );
                return Ok(());
            }
        };

        let Some(command) = BlockCommand::from_code(code) else {
            tracing::warn!("unknown block command {} from {}", code, peer);
            protocol::write_response(&mut stream, Response::InvalidCommand).await?;
            continue;
        };

        match command {
            BlockCommand::UploadBlock => handle_upload_block(&mut stream, &store).await?,
            BlockCommand::DownloadBlock => handle_download_block(&mut stream, &store).await?,
            BlockCommand::DeleteBlocks => handle_delete_blocks(&mut stream, &store).await?,
            BlockCommand::Ping => {
                protocol::write_response(&mut stream, Response::Success).await?;
            }
            BlockCommand::NodeStatus => {
                protocol::write_response(&mut stream, Response::Success).await?;
                protocol::write_json(&mut stream, &store.status()).await?;
            }
        }
    }
}

async fn handle_upload_block(stream: &mut TcpStream, store: &BlockStore) -> Result<()> {
    let meta: BlockUploadMeta = protocol::read_json(stream).await?;
    if let Err(err) = validate_filename(&meta.filename) {
        tracing::warn!("refusing block upload: {}", err);
        return protocol::write_response(stream, Response::ServerError).await;
    }

    // Flow-control ack: the coordinator sends the payload only after this.
    protocol::write_response(stream, Response::Success).await?;

    match store
        .write_block(&meta.filename, meta.physical_number, meta.size, stream)
        .await
    {
        Ok(()) => protocol::write_response(stream, Response::UploadComplete).await,
        Err(err) => {
            tracing::warn!(
                "block write failed for {} block {}: {}",
                meta.filename,
                meta.physical_number,
                err
            );
            // The stream may still be mid-payload; answer and end the session.
            let _ = protocol::write_response(stream, Response::ServerError).await;
            Err(err)
        }
    }
}

async fn handle_download_block(stream: &mut TcpStream, store: &BlockStore) -> Result<()> {
    let meta: BlockFetchMeta = protocol::read_json(stream).await?;
    if let Err(err) = validate_filename(&meta.filename) {
        tracing::warn!("refusing block download: {}", err);
        return protocol::write_response(stream, Response::ServerError).await;
    }

    match store.open_block(&meta.filename, meta.physical_number).await {
        Ok(Some((size, mut file))) => {
            protocol::write_response(stream, Response::Success).await?;
            protocol::write_size(stream, size).await?;
            tokio::io::copy(&mut file, stream).await?;
            Ok(())
        }
        Ok(None) => protocol::write_response(stream, Response::FileNotFound).await,
        Err(err) => {
            tracing::warn!(
                "block read failed for {} block {}: {}",
                meta.filename,
                meta.physical_number,
                err
            );
            protocol::write_response(stream, Response::ServerError).await
        }
    }
}

async fn handle_delete_blocks(stream: &mut TcpStream, store: &BlockStore) -> Result<()> {
    let filename = protocol::read_string(stream).await?;
    if let Err(err) = validate_filename(&filename) {
        tracing::warn!("refusing block delete: {}", err);
        return protocol::write_response(stream, Response::ServerError).await;
    }

    match store.delete_blocks(&filename).await {
        Ok(_) => protocol::write_response(stream, Response::Success).await,
        Err(err) => {
            tracing::warn!("block delete failed for {}: {}", filename, err);
            protocol::write_response(stream, Response::ServerError).await
        }
    }
}
