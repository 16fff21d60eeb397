//! Length-prefixed message framing over Iroh QUIC streams.
//!
//! Control messages travel as `[u32 LE length][JSON]` frames. Frames that
//! carry piece data (`Chunk`) declare a byte count and the raw bytes follow
//! the frame directly on the stream, so bulk data is never JSON-encoded.
//!
//! Peer disappearance is part of the protocol, not an anomaly: a clean stream
//! finish before a frame reads as [`FrameError::Closed`], a reset connection
//! as [`FrameError::Reset`]. Handlers treat both as the remote walking away.

use iroh::endpoint::{ReadExactError, RecvStream, SendStream};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Time to wait for the remote to acknowledge receipt before closing.
const RESPONSE_FINISH_TIMEOUT_SECS: u64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer finished the stream cleanly before the next frame.
    #[error("stream closed by peer")]
    Closed,
    /// The connection was reset or lost mid-frame.
    #[error("stream reset by peer: {0}")]
    Reset(String),
    /// The peer finished the stream in the middle of a frame.
    #[error("truncated frame")]
    Truncated,
    #[error("frame of {got} bytes exceeds limit of {limit}")]
    TooLarge { got: usize, limit: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("stream write failed: {0}")]
    Write(String),
}

impl FrameError {
    /// True when the error means the remote went away rather than misbehaved.
    pub fn is_peer_gone(&self) -> bool {
        matches!(self, FrameError::Closed | FrameError::Reset(_))
    }
}

fn map_read_exact(err: ReadExactError, at_frame_boundary: bool) -> FrameError {
    match err {
        ReadExactError::FinishedEarly(0) if at_frame_boundary => FrameError::Closed,
        ReadExactError::FinishedEarly(_) => FrameError::Truncated,
        ReadExactError::ReadError(e) => FrameError::Reset(e.to_string()),
    }
}

/// Read one JSON frame, enforcing `max_size` on the encoded length.
pub async fn read_frame<T: DeserializeOwned>(
    recv: &mut RecvStream,
    max_size: usize,
) -> Result<T, FrameError> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|e| map_read_exact(e, true))?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max_size {
        return Err(FrameError::TooLarge {
            got: len,
            limit: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf)
        .await
        .map_err(|e| map_read_exact(e, false))?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Read `len` raw payload bytes following a chunk frame.
pub async fn read_data(recv: &mut RecvStream, len: usize) -> Result<Vec<u8>, FrameError> {
    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf)
        .await
        .map_err(|e| map_read_exact(e, false))?;
    Ok(buf)
}

/// Write one JSON frame.
pub async fn write_frame<T: Serialize>(send: &mut SendStream, msg: &T) -> Result<(), FrameError> {
    let bytes = serde_json::to_vec(msg)?;
    let len = (bytes.len() as u32).to_le_bytes();
    send.write_all(&len)
        .await
        .map_err(|e| FrameError::Write(e.to_string()))?;
    send.write_all(&bytes)
        .await
        .map_err(|e| FrameError::Write(e.to_string()))?;
    Ok(())
}

/// Write one JSON frame followed by its raw payload bytes.
pub async fn write_frame_with_data<T: Serialize>(
    send: &mut SendStream,
    msg: &T,
    data: &[u8],
) -> Result<(), FrameError> {
    write_frame(send, msg).await?;
    send.write_all(data)
        .await
        .map_err(|e| FrameError::Write(e.to_string()))?;
    Ok(())
}

/// Finish the send side and wait briefly for the remote to receive the tail.
pub async fn finish_stream(send: &mut SendStream) -> Result<(), FrameError> {
    use tokio::io::AsyncWriteExt;
    send.flush()
        .await
        .map_err(|e| FrameError::Write(e.to_string()))?;
    let _ = send.finish();
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(RESPONSE_FINISH_TIMEOUT_SECS),
        send.stopped(),
    )
    .await;
    Ok(())
}

/// Send raw response bytes and finish the stream gracefully.
///
/// Used by the unary coordinator-control handlers where the whole response is
/// a single JSON message.
pub async fn send_response(send: &mut SendStream, data: &[u8]) -> Result<(), FrameError> {
    send.write_all(data)
        .await
        .map_err(|e| FrameError::Write(e.to_string()))?;
    finish_stream(send).await
}
