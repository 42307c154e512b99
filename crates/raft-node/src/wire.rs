//! # wire
//!
//! why: one framing for peer rpcs and client proposals on the same socket
//! relations: written by transport.rs (outbound) and read by server.rs (inbound)
//! what: Request/Response frames, newline-delimited json read/write helpers

use std::io;

use raft_core::{NodeId, RaftMessage};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::gateway::ProposalResult;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Longest frame accepted, newline included.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Request {
    /// A consensus rpc from peer `from`.
    Raft { from: NodeId, message: RaftMessage },
    /// A client command for the gateway.
    Propose { command: Vec<u8> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Response {
    Raft { message: RaftMessage },
    Proposal { result: ProposalResult },
}

/// Read one frame. `Ok(None)` means the peer closed the connection.
/// A frame longer than [`MAX_FRAME_BYTES`] is `InvalidData`.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    read_message_within(reader, MAX_FRAME_BYTES).await
}

async fn read_message_within<R, T>(reader: &mut R, limit: usize) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = (&mut *reader).take(limit as u64).read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes == limit && !line.ends_with('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {limit} bytes"),
            ));
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
