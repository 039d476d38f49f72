//! Binary wire protocol shared by the client↔coordinator and
//! coordinator↔storage-node links.
//!
//! Every primitive is big-endian: 4-byte command/response codes, 4-byte
//! length prefixes for strings and JSON documents, 8-byte sizes, then raw
//! payload bytes. The framing is byte-identical on both links; only the
//! command vocabulary differs.

use crate::error::{BasaltError, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a length-prefixed string frame.
pub const MAX_STRING_LEN: u32 = 4 * 1024;

/// Upper bound on a length-prefixed JSON frame.
pub const MAX_JSON_LEN: u32 = 16 * 1024 * 1024;

const COPY_CHUNK: usize = 64 * 1024;

/// Commands a client issues to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Upload = 1,
    Download = 2,
    ListFiles = 3,
    Delete = 4,
    FileInfo = 5,
    StorageStatus = 6,
    BlockTable = 7,
    Disconnect = 8,
}

impl Command {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Upload),
            2 => Some(Self::Download),
            3 => Some(Self::ListFiles),
            4 => Some(Self::Delete),
            5 => Some(Self::FileInfo),
            6 => Some(Self::StorageStatus),
            7 => Some(Self::BlockTable),
            8 => Some(Self::Disconnect),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Commands the coordinator issues to a storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockCommand {
    UploadBlock = 1,
    DownloadBlock = 2,
    DeleteBlocks = 3,
    Ping = 4,
    NodeStatus = 5,
}

impl BlockCommand {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::UploadBlock),
            2 => Some(Self::DownloadBlock),
            3 => Some(Self::DeleteBlocks),
            4 => Some(Self::Ping),
            5 => Some(Self::NodeStatus),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Response codes. Every completed command ends with exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Response {
    Success = 1,
    ServerError = 2,
    InvalidCommand = 3,
    FileNotFound = 4,
    FileAlreadyExists = 5,
    StorageFull = 6,
    UploadComplete = 7,
    DownloadComplete = 8,
    DeleteComplete = 9,
}

impl Response {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Success),
            2 => Some(Self::ServerError),
            3 => Some(Self::InvalidCommand),
            4 => Some(Self::FileNotFound),
            5 => Some(Self::FileAlreadyExists),
            6 => Some(Self::StorageFull),
            7 => Some(Self::UploadComplete),
            8 => Some(Self::DownloadComplete),
            9 => Some(Self::DeleteComplete),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Metadata announcing a block write to a storage node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockUploadMeta {
    pub filename: String,
    pub physical_number: u32,
    pub size: u64,
}

/// Metadata requesting a block read from a storage node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockFetchMeta {
    pub filename: String,
    pub physical_number: u32,
}

/// Advisory counters a storage node reports for `NodeStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub block_count: u64,
    pub bytes_used: u64,
}

/// Read a raw 4-byte code. Decoding into a command is left to the caller
/// so dispatchers can answer unknown codes with `InvalidCommand`.
pub async fn read_code<R>(reader: &mut R) -> Result<u32>
where
    R: AsyncRead + Unpin,
{
    Ok(reader.read_u32().await?)
}

pub async fn write_command<W>(writer: &mut W, command: Command) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(command.code()).await?;
    Ok(())
}

pub async fn write_block_command<W>(writer: &mut W, command: BlockCommand) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(command.code()).await?;
    Ok(())
}

pub async fn write_response<W>(writer: &mut W, response: Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(response.code()).await?;
    Ok(())
}

pub async fn read_response<R>(reader: &mut R) -> Result<Response>
where
    R: AsyncRead + Unpin,
{
    let code = reader.read_u32().await?;
    Response::from_code(code)
        .ok_or_else(|| BasaltError::Protocol(format!("unknown response code {}", code)))
}

pub async fn write_string<W>(writer: &mut W, value: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = value.as_bytes();
    if bytes.len() > MAX_STRING_LEN as usize {
        return Err(BasaltError::Protocol(format!(
            "string frame of {} bytes exceeds the {} byte limit",
            bytes.len(),
            MAX_STRING_LEN
        )));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

pub async fn read_string<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await?;
    if len > MAX_STRING_LEN {
        return Err(BasaltError::Protocol(format!(
            "string frame of {} bytes exceeds the {} byte limit",
            len, MAX_STRING_LEN
        )));
    }
    let buf = read_frame(reader, len as usize).await?;
    String::from_utf8(buf)
        .map_err(|_| BasaltError::Protocol("string frame is not valid UTF-8".to_string()))
}

pub async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() > MAX_JSON_LEN as usize {
        return Err(BasaltError::Protocol(format!(
            "JSON frame of {} bytes exceeds the {} byte limit",
            bytes.len(),
            MAX_JSON_LEN
        )));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    Ok(())
}

pub async fn read_json<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await?;
    if len > MAX_JSON_LEN {
        return Err(BasaltError::Protocol(format!(
            "JSON frame of {} bytes exceeds the {} byte limit",
            len, MAX_JSON_LEN
        )));
    }
    let buf = read_frame(reader, len as usize).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// 8-byte file/block sizes.
pub async fn write_size<W>(writer: &mut W, value: u64) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u64(value).await?;
    Ok(())
}

pub async fn read_size<R>(reader: &mut R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    Ok(reader.read_u64().await?)
}

/// Read an announced payload into memory, looping until the declared byte
/// count is consumed. An early close surfaces as `TruncatedTransfer`.
pub async fn read_payload<R>(reader: &mut R, len: u64) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    read_frame(reader, len as usize).await.map(Bytes::from)
}

/// Copy an announced payload from `reader` to `writer` in fixed-size
/// chunks, without buffering the whole payload.
pub async fn copy_payload<R, W>(reader: &mut R, writer: &mut W, len: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if len == 0 {
        return Ok(());
    }
    let mut buf = vec![0u8; COPY_CHUNK.min(len as usize)];
    let mut remaining = len;
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(BasaltError::TruncatedTransfer {
                expected: len,
                received: len - remaining,
            });
        }
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

async fn read_frame<R>(reader: &mut R, len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    let mut received = 0usize;
    while received < len {
        let n = reader.read(&mut buf[received..]).await?;
        if n == 0 {
            return Err(BasaltError::TruncatedTransfer {
                expected: len as u64,
                received: received as u64,
            });
        }
        received += n;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_code_round_trips() {
        for code in 1..=8 {
            let command = Command::from_code(code).unwrap();
            assert_eq!(command.code(), code);
        }
        assert!(Command::from_code(0).is_none());
        assert!(Command::from_code(9).is_none());

        for code in 1..=5 {
            let command = BlockCommand::from_code(code).unwrap();
            assert_eq!(command.code(), code);
        }
        assert!(BlockCommand::from_code(6).is_none());

        for code in 1..=9 {
            let response = Response::from_code(code).unwrap();
            assert_eq!(response.code(), code);
        }
        assert!(Response::from_code(10).is_none());
    }

    #[tokio::test]
    async fn test_string_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_string(&mut client, "informe.pdf").await.unwrap();
        let value = read_string(&mut server).await.unwrap();
        assert_eq!(value, "informe.pdf");
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Meta {
            filename: String,
            size: u64,
        }

        let (mut client, mut server) = tokio::io::duplex(1024);
        let meta = Meta {
            filename: "a.bin".to_string(),
            size: 42,
        };

        write_json(&mut client, &meta).await.unwrap();
        let decoded: Meta = read_json(&mut server).await.unwrap();
        assert_eq!(decoded, meta);
    }

    #[tokio::test]
    async fn test_oversized_string_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client.write_u32(MAX_STRING_LEN + 1).await.unwrap();
        let err = read_string(&mut server).await.unwrap_err();
        assert!(matches!(err, BasaltError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_payload_round_trip_across_partial_reads() {
        let (mut client, mut server) = tokio::io::duplex(16);
        let data = vec![7u8; 100];

        let writer = tokio::spawn(async move {
            client.write_all(&data).await.unwrap();
            data
        });

        let payload = read_payload(&mut server, 100).await.unwrap();
        let sent = writer.await.unwrap();
        assert_eq!(payload.as_ref(), sent.as_slice());
    }

    #[tokio::test]
    async fn test_truncated_payload_reports_received_count() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        let err = read_payload(&mut server, 10).await.unwrap_err();
        match err {
            BasaltError::TruncatedTransfer { expected, received } => {
                assert_eq!(expected, 10);
                assert_eq!(received, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_copy_payload_streams_exact_bytes() {
        let (mut client, mut server) = tokio::io::duplex(32);
        let data: Vec<u8> = (0..200u8).collect();

        let writer = tokio::spawn(async move {
            client.write_all(&data).await.unwrap();
            // Trailing bytes past the announced payload must not be copied.
            client.write_all(b"extra").await.unwrap();
            data
        });

        let mut out = Vec::new();
        copy_payload(&mut server, &mut out, 200).await.unwrap();
        let sent = writer.await.unwrap();
        assert_eq!(out, sent);
    }

    #[tokio::test]
    async fn test_response_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64);

        write_response(&mut client, Response::StorageFull).await.unwrap();
        let response = read_response(&mut server).await.unwrap();
        assert_eq!(response, Response::StorageFull);
    }
}
