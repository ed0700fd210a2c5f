//! Task-to-engine IPC channel.
//!
//! The original design is a process's stdlib multiprocessing queue; the
//! redesign note in spec.md §9 asks for "a typed, many-producer
//! single-consumer channel carrying a tagged union". Since task workers here
//! are genuinely separate OS processes (see `worker.rs`), the channel is
//! realized as a Unix domain socket carrying length-prefixed JSON frames;
//! `serde`/`serde_json` are already the ambient (de)serialization stack this
//! crate uses for its TOML config, so reusing them for IPC framing avoids
//! pulling in a second wire format.

use crate::attacher::CircuitId;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// `IpcMsg = NewConn{circuit, port} | TaskDone{circuit}`, per the redesign
/// note. `NewConn` reports that a task's SOCKS client opened a connection
/// from `port` on `circuit`; `TaskDone` is the mandatory terminal message
/// every task worker sends exactly once, even on failure (baseline contract
/// (b) from spec.md §9's Open Questions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum IpcMsg {
    NewConn { circuit: CircuitId, port: u16 },
    TaskDone { circuit: CircuitId },
}

const MAX_FRAME_LEN: u32 = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error on IPC channel: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(u32),
    #[error("malformed IPC frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("IPC channel closed")]
    Closed,
}

/// Write one length-prefixed JSON frame: a 4-byte big-endian length followed
/// by that many bytes of JSON.
pub async fn send(stream: &mut UnixStream, msg: &IpcMsg) -> Result<(), IpcError> {
    let body = serde_json::to_vec(msg)?;
    let len = u32::try_from(body.len()).map_err(|_| IpcError::FrameTooLarge(u32::MAX))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame, or `Err(IpcError::Closed)` if the
/// peer closed the connection before a complete length prefix arrived.
pub async fn recv(stream: &mut UnixStream) -> Result<IpcMsg, IpcError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Err(IpcError::Closed),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_new_conn() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let msg = IpcMsg::NewConn { circuit: 7, port: 40001 };
        send(&mut a, &msg).await.unwrap();
        let got = recv(&mut b).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn round_trips_task_done() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let msg = IpcMsg::TaskDone { circuit: 42 };
        send(&mut a, &msg).await.unwrap();
        let got = recv(&mut b).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn recv_after_close_is_closed_error() {
        let (a, mut b) = UnixStream::pair().unwrap();
        drop(a);
        let err = recv(&mut b).await.unwrap_err();
        assert!(matches!(err, IpcError::Closed));
    }

    #[tokio::test]
    async fn multiple_frames_on_one_stream() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        send(&mut a, &IpcMsg::NewConn { circuit: 1, port: 1 }).await.unwrap();
        send(&mut a, &IpcMsg::TaskDone { circuit: 1 }).await.unwrap();
        assert_eq!(recv(&mut b).await.unwrap(), IpcMsg::NewConn { circuit: 1, port: 1 });
        assert_eq!(recv(&mut b).await.unwrap(), IpcMsg::TaskDone { circuit: 1 });
    }
}
