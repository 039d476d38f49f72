//! Coordinator: the server that owns the block and file tables.
//!
//! Clients hold persistent connections and issue file-level commands; the
//! coordinator orchestrates table bookkeeping and storage node I/O under a
//! fixed lock order (operation lock, file table, block table). A background
//! sweep reclaims reservations abandoned by crashed uploads.

mod handlers;

use crate::block_table::BlockTable;
use crate::error::Result;
use crate::file_table::FileTable;
use crate::node::{NodeRegistry, NodeSpec};
use crate::node_client::NodeClient;
use crate::protocol::{self, Command, Response};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// How often an idle session wakes to poll its socket. Elapsing is not an
/// error; the connection stays open until the client disconnects.
const IDLE_POLL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub bind_addr: String,
    /// Directory holding the block and file table snapshots.
    pub data_dir: PathBuf,
    pub block_size: u64,
    pub total_blocks: u64,
    /// Replica writes per block, besides the primary.
    pub replica_count: usize,
    pub reservation_timeout: Duration,
    pub sweep_interval: Duration,
    pub storage_nodes: Vec<NodeSpec>,
}

struct CoordinatorState {
    options: CoordinatorOptions,
    file_op_lock: Mutex<()>,
    file_table: Mutex<FileTable>,
    block_table: Mutex<BlockTable>,
    registry: NodeRegistry,
    node_client: NodeClient,
}

pub struct Coordinator {
    listener: TcpListener,
    state: Arc<CoordinatorState>,
}

impl Coordinator {
    /// Load (or create) the persisted tables, rebuild node usage counters
    /// from the allocated blocks, and bind the listener.
    pub async fn bind(options: CoordinatorOptions) -> Result<Self> {
        let block_table = BlockTable::load_or_create(
            options.total_blocks,
            options.data_dir.join("block_table.json"),
        )
        .await?;
        let file_table = FileTable::load_or_create(options.data_dir.join("file_table.json")).await?;

        let registry = NodeRegistry::new(options.storage_nodes.clone());
        let mut replayed = 0u64;
        for block in block_table.allocated_blocks() {
            if let Some(primary) = &block.primary_node {
                registry.apply_existing(primary, &block.replica_nodes).await;
                replayed += 1;
            }
        }
        if replayed > 0 {
            tracing::info!("rebuilt node usage counters from {} allocated blocks", replayed);
        }

        let listener = TcpListener::bind(&options.bind_addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(CoordinatorState {
                options,
                file_op_lock: Mutex::new(()),
                file_table: Mutex::new(file_table),
                block_table: Mutex::new(block_table),
                registry,
                node_client: NodeClient::default(),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve client connections until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        ping_nodes(&self.state).await;

        let sweep_state = self.state.clone();
        tokio::spawn(async move {
            reservation_sweep_loop(sweep_state).await;
        });

        tracing::info!("coordinator listening on {}", self.listener.local_addr()?);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let session_state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(err) = run_session(stream, peer, session_state).await {
                            tracing::warn!("client session with {} ended with error: {}", peer, err);
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received, coordinator stopping");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Ping every configured node once at startup. Unreachable nodes are only
/// reported; admission control stays capacity-based.
async fn ping_nodes(state: &CoordinatorState) {
    for node in state.registry.addrs().await {
        if state.node_client.ping(&node).await {
            tracing::info!("storage node {} is reachable", node);
        } else {
            tracing::warn!("storage node {} is unreachable at startup", node);
        }
    }
}

async fn reservation_sweep_loop(state: Arc<CoordinatorState>) {
    let timeout = chrono::Duration::from_std(state.options.reservation_timeout)
        .unwrap_or(chrono::Duration::MAX);
    let mut interval = tokio::time::interval(state.options.sweep_interval);
    loop {
        interval.tick().await;

        let mut block_table = state.block_table.lock().await;
        let freed = block_table.cancel_expired(timeout);
        if freed.is_empty() {
            continue;
        }
        tracing::info!("reservation sweep freed {} expired blocks", freed.len());
        if let Err(err) = block_table.save().await {
            tracing::warn!("failed to save block table after sweep: {}", err);
        }
    }
}

async fn run_session(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: Arc<CoordinatorState>,
) -> Result<()> {
    tracing::info!("client connected from {}", peer);
    let mut peek_buf = [0u8; 1];
    loop {
        // Peek under a timeout so the idle wait consumes nothing; the
        // command header is read only once bytes are actually pending.
        match timeout(IDLE_POLL, stream.peek(&mut peek_buf)).await {
            Ok(Ok(0)) => {
                tracing::info!("client {} disconnected", peer);
                return Ok(());
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => continue,
        }

        let code = protocol::read_code(&mut stream).await?;
        let Some(command) = Command::from_code(code) else {
            tracing::warn!("unknown command {} from {}", code, peer);
            protocol::write_response(&mut stream, Response::InvalidCommand).await?;
            continue;
        };
        tracing::debug!("client {} issued {:?}", peer, command);

        match command {
            Command::Upload => handlers::handle_upload(&mut stream, &state).await?,
            Command::Download => handlers::handle_download(&mut stream, &state).await?,
            Command::ListFiles => handlers::handle_list_files(&mut stream, &state).await?,
            Command::Delete => handlers::handle_delete(&mut stream, &state).await?,
            Command::FileInfo => handlers::handle_file_info(&mut stream, &state).await?,
            Command::StorageStatus => handlers::handle_storage_status(&mut stream, &state).await?,
            Command::BlockTable => handlers::handle_block_table(&mut stream, &state).await?,
            Command::Disconnect => {
                protocol::write_response(&mut stream, Response::Success).await?;
                tracing::info!("client {} disconnected", peer);
                return Ok(());
            }
        }
    }
}
