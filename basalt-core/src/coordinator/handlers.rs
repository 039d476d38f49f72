//! One handler per client command.
//!
//! Handlers that mutate state take the operation lock first, then the file
//! and block table locks one at a time, in that order. Node I/O happens
//! with no table lock held. Once a mutation is committed in memory the
//! tables are authoritative: a failing snapshot write is logged and the
//! client still gets its terminal response, and the snapshot catches up on
//! the next save.

use super::CoordinatorState;
use crate::block_store::{file_stem, validate_filename};
use crate::block_table::{ChainEntry, SystemStatus};
use crate::error::Result;
use crate::node::{BlockTargets, NodeAddr};
use crate::protocol::{self, Response};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

pub(super) async fn handle_upload(stream: &mut TcpStream, state: &CoordinatorState) -> Result<()> {
    let filename = protocol::read_string(stream).await?;
    let total_size = protocol::read_size(stream).await?;

    if let Err(err) = validate_filename(&filename) {
        tracing::warn!("rejecting upload of {:?}: {}", filename, err);
        return protocol::write_response(stream, Response::ServerError).await;
    }

    let _op = state.file_op_lock.lock().await;

    // Block directories are keyed by stem, so two live files may not share
    // one. This also covers an exact duplicate name.
    let stem = file_stem(&filename);
    {
        let file_table = state.file_table.lock().await;
        if file_table.iter().any(|entry| file_stem(&entry.filename) == stem) {
            tracing::info!("rejecting upload of {}: name already in use", filename);
            return protocol::write_response(stream, Response::FileAlreadyExists).await;
        }
    }

    let required = total_size.div_ceil(state.options.block_size);
    {
        let block_table = state.block_table.lock().await;
        if !block_table.has_available(required) {
            tracing::info!(
                "rejecting upload of {}: {} blocks needed, {} free",
                filename,
                required,
                block_table.available_count()
            );
            return protocol::write_response(stream, Response::StorageFull).await;
        }
    }

    protocol::write_response(stream, Response::Success).await?;

    let reserved = {
        let mut block_table = state.block_table.lock().await;
        match block_table.reserve_blocks(required) {
            Ok(ids) => match block_table.save().await {
                Ok(()) => Some(ids),
                Err(err) => {
                    tracing::warn!("failed to persist reservations for {}: {}", filename, err);
                    // The rename never happened, so disk still holds the
                    // pre-reserve snapshot; cancelling restores agreement.
                    block_table.cancel_reservations(&ids);
                    None
                }
            },
            Err(err) => {
                tracing::warn!(
                    "failed to reserve {} blocks for {}: {}",
                    required,
                    filename,
                    err
                );
                None
            }
        }
    };
    let Some(reserved) = reserved else {
        return fail_upload(stream, total_size).await;
    };

    // Receive, place, and replicate one block at a time. Any failure from
    // here on unwinds the whole allocation.
    let mut placed: Vec<BlockTargets> = Vec::with_capacity(reserved.len());
    let mut consumed = 0u64;
    for index in 0..reserved.len() {
        let segment = state.options.block_size.min(total_size - consumed);
        let data = match protocol::read_payload(stream, segment).await {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!("upload of {} aborted mid-stream: {}", filename, err);
                unwind_allocation(state, &reserved, &placed, &filename).await;
                return Err(err);
            }
        };
        consumed += segment;

        let targets = match state.registry.select_targets(state.options.replica_count).await {
            Ok(targets) => targets,
            Err(err) => {
                tracing::warn!("no placement for block {} of {}: {}", index, filename, err);
                unwind_allocation(state, &reserved, &placed, &filename).await;
                return fail_upload(stream, total_size - consumed).await;
            }
        };

        let mut stored = state
            .node_client
            .write_block(&targets.primary, &filename, index as u32, &data)
            .await;
        if stored {
            for replica in &targets.replicas {
                if !state
                    .node_client
                    .write_block(replica, &filename, index as u32, &data)
                    .await
                {
                    stored = false;
                    break;
                }
            }
        }
        if !stored {
            state
                .registry
                .release_targets(&targets.primary, &targets.replicas)
                .await;
            unwind_allocation(state, &reserved, &placed, &filename).await;
            return fail_upload(stream, total_size - consumed).await;
        }
        placed.push(targets);
    }

    if let Err(err) = confirm_chain(state, &reserved, &placed).await {
        tracing::error!("failed to record block chain for {}: {}", filename, err);
        unwind_allocation(state, &reserved, &placed, &filename).await;
        return protocol::write_response(stream, Response::ServerError).await;
    }

    {
        let mut file_table = state.file_table.lock().await;
        let file_id = file_table.create_file(&filename, total_size)?;
        if let Some(&first) = reserved.first() {
            file_table.set_first_block(file_id, first)?;
        }
        file_table.update_block_count(file_id, reserved.len() as u64)?;
        if let Err(err) = file_table.save().await {
            tracing::warn!("failed to persist file table after storing {}: {}", filename, err);
        }
    }

    tracing::info!(
        "stored {} ({} bytes in {} blocks)",
        filename,
        total_size,
        reserved.len()
    );
    protocol::write_response(stream, Response::UploadComplete).await
}

/// Stamp node assignments and chain links onto the reserved blocks.
async fn confirm_chain(
    state: &CoordinatorState,
    reserved: &[u64],
    placed: &[BlockTargets],
) -> Result<()> {
    let mut block_table = state.block_table.lock().await;
    for (index, (&block_id, targets)) in reserved.iter().zip(placed).enumerate() {
        block_table.confirm_allocation(
            block_id,
            targets.primary.clone(),
            targets.replicas.clone(),
            index as u32,
            reserved.get(index + 1).copied(),
        )?;
    }
    block_table.save().await
}

/// Roll back a failed upload: free any confirmed prefix of the chain,
/// cancel the remaining reservations, return placement counters, and scrub
/// block data already written to nodes.
async fn unwind_allocation(
    state: &CoordinatorState,
    reserved: &[u64],
    placed: &[BlockTargets],
    filename: &str,
) {
    for targets in placed {
        state
            .registry
            .release_targets(&targets.primary, &targets.replicas)
            .await;
    }
    {
        let mut block_table = state.block_table.lock().await;
        if let Some(&first) = reserved.first() {
            block_table.free_chain(first);
        }
        block_table.cancel_reservations(reserved);
        if let Err(err) = block_table.save().await {
            tracing::warn!("failed to save block table after aborted upload: {}", err);
        }
    }
    let nodes = distinct_nodes(placed.iter().map(|t| (&t.primary, t.replicas.as_slice())));
    for node in &nodes {
        state.node_client.delete_blocks(node, filename).await;
    }
}

/// Consume the rest of an announced upload so the connection lands back on
/// a command boundary, then report the failure.
async fn fail_upload(stream: &mut TcpStream, remaining: u64) -> Result<()> {
    protocol::copy_payload(stream, &mut tokio::io::sink(), remaining).await?;
    protocol::write_response(stream, Response::ServerError).await
}

fn distinct_nodes<'a>(
    assignments: impl IntoIterator<Item = (&'a NodeAddr, &'a [NodeAddr])>,
) -> Vec<NodeAddr> {
    let mut seen = Vec::new();
    for (primary, replicas) in assignments {
        if !seen.contains(primary) {
            seen.push(primary.clone());
        }
        for replica in replicas {
            if !seen.contains(replica) {
                seen.push(replica.clone());
            }
        }
    }
    seen
}

pub(super) async fn handle_download(
    stream: &mut TcpStream,
    state: &CoordinatorState,
) -> Result<()> {
    let filename = protocol::read_string(stream).await?;

    // Held for the whole transfer so a concurrent delete cannot tear the
    // chain out from under the reads.
    let _op = state.file_op_lock.lock().await;

    let entry = {
        let file_table = state.file_table.lock().await;
        match file_table.get_by_name(&filename) {
            Some(entry) => entry.clone(),
            None => return protocol::write_response(stream, Response::FileNotFound).await,
        }
    };
    let chain = {
        let block_table = state.block_table.lock().await;
        match entry.first_block_id {
            Some(first) => block_table.chain(first),
            None => Vec::new(),
        }
    };

    protocol::write_response(stream, Response::Success).await?;
    for link in &chain {
        let block_name = format!("block_{}.bin", link.physical_number);
        match fetch_block(state, &filename, link).await {
            Some(data) => {
                protocol::write_string(stream, &block_name).await?;
                protocol::write_size(stream, data.len() as u64).await?;
                stream.write_all(&data).await?;
            }
            None => {
                tracing::warn!(
                    "block {} of {} is unreadable on every node, sending zero length",
                    link.physical_number,
                    filename
                );
                protocol::write_string(stream, &block_name).await?;
                protocol::write_size(stream, 0).await?;
            }
        }
    }
    protocol::write_response(stream, Response::DownloadComplete).await?;
    tracing::info!("served {} ({} blocks)", filename, chain.len());
    Ok(())
}

/// Read one block, trying the primary first and each replica after it.
async fn fetch_block(state: &CoordinatorState, filename: &str, link: &ChainEntry) -> Option<Bytes> {
    if let Some(data) = state
        .node_client
        .read_block(&link.primary, filename, link.physical_number)
        .await
    {
        return Some(data);
    }
    if !link.replicas.is_empty() {
        tracing::warn!(
            "primary {} missed block {} of {}, trying replicas",
            link.primary,
            link.physical_number,
            filename
        );
    }
    for replica in &link.replicas {
        if let Some(data) = state
            .node_client
            .read_block(replica, filename, link.physical_number)
            .await
        {
            return Some(data);
        }
    }
    None
}

pub(super) async fn handle_delete(stream: &mut TcpStream, state: &CoordinatorState) -> Result<()> {
    let filename = protocol::read_string(stream).await?;

    let _op = state.file_op_lock.lock().await;

    let entry = {
        let file_table = state.file_table.lock().await;
        match file_table.get_by_name(&filename) {
            Some(entry) => entry.clone(),
            None => return protocol::write_response(stream, Response::FileNotFound).await,
        }
    };

    let chain = {
        let mut block_table = state.block_table.lock().await;
        let chain = match entry.first_block_id {
            Some(first) => block_table.chain(first),
            None => Vec::new(),
        };
        if let Some(first) = entry.first_block_id {
            block_table.free_chain(first);
        }
        if let Err(err) = block_table.save().await {
            tracing::warn!("failed to persist block table after freeing {}: {}", filename, err);
        }
        chain
    };

    {
        let mut file_table = state.file_table.lock().await;
        file_table.delete_file(entry.id)?;
        if let Err(err) = file_table.save().await {
            tracing::warn!("failed to persist file table after deleting {}: {}", filename, err);
        }
    }

    for link in &chain {
        state
            .registry
            .release_targets(&link.primary, &link.replicas)
            .await;
    }
    let nodes = distinct_nodes(chain.iter().map(|link| (&link.primary, link.replicas.as_slice())));
    for node in &nodes {
        if !state.node_client.delete_blocks(node, &filename).await {
            tracing::warn!("node {} did not confirm deleting blocks of {}", node, filename);
        }
    }

    tracing::info!("deleted {} ({} blocks freed)", filename, chain.len());
    protocol::write_response(stream, Response::DeleteComplete).await
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileView {
    filename: String,
    size: u64,
    created_at: DateTime<Utc>,
    block_count: u64,
}

pub(super) async fn handle_list_files(
    stream: &mut TcpStream,
    state: &CoordinatorState,
) -> Result<()> {
    let files: Vec<FileView> = {
        let file_table = state.file_table.lock().await;
        file_table
            .iter()
            .map(|entry| FileView {
                filename: entry.filename.clone(),
                size: entry.total_size,
                created_at: entry.created_at,
                block_count: entry.block_count,
            })
            .collect()
    };
    protocol::write_response(stream, Response::Success).await?;
    protocol::write_json(stream, &files).await
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileInfoView {
    filename: String,
    size: u64,
    created_at: DateTime<Utc>,
    block_count: u64,
    first_block_id: Option<u64>,
    block_chain: Vec<u64>,
}

pub(super) async fn handle_file_info(
    stream: &mut TcpStream,
    state: &CoordinatorState,
) -> Result<()> {
    let filename = protocol::read_string(stream).await?;

    let entry = {
        let file_table = state.file_table.lock().await;
        match file_table.get_by_name(&filename) {
            Some(entry) => entry.clone(),
            None => return protocol::write_response(stream, Response::FileNotFound).await,
        }
    };
    let block_chain: Vec<u64> = {
        let block_table = state.block_table.lock().await;
        match entry.first_block_id {
            Some(first) => block_table.chain(first).iter().map(|link| link.id).collect(),
            None => Vec::new(),
        }
    };

    let view = FileInfoView {
        filename: entry.filename,
        size: entry.total_size,
        created_at: entry.created_at,
        block_count: entry.block_count,
        first_block_id: entry.first_block_id,
        block_chain,
    };
    protocol::write_response(stream, Response::Success).await?;
    protocol::write_json(stream, &view).await
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StorageStatusView {
    #[serde(flatten)]
    blocks: SystemStatus,
    file_count: u64,
    total_file_bytes: u64,
}

pub(super) async fn handle_storage_status(
    stream: &mut TcpStream,
    state: &CoordinatorState,
) -> Result<()> {
    let (file_count, total_file_bytes) = {
        let file_table = state.file_table.lock().await;
        let total = file_table.iter().map(|entry| entry.total_size).sum();
        (file_table.len() as u64, total)
    };
    let blocks = {
        let block_table = state.block_table.lock().await;
        block_table.system_status()
    };
    let view = StorageStatusView {
        blocks,
        file_count,
        total_file_bytes,
    };
    protocol::write_response(stream, Response::Success).await?;
    protocol::write_json(stream, &view).await
}

pub(super) async fn handle_block_table(
    stream: &mut TcpStream,
    state: &CoordinatorState,
) -> Result<()> {
    let dump = {
        let block_table = state.block_table.lock().await;
        block_table.dump()
    };
    protocol::write_response(stream, Response::Success).await?;
    protocol::write_json(stream, &dump).await
}
