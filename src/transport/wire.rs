//! Wire framing utilities
//!
//! Every message travels as a 4-byte big-endian length followed by the payload.

use crate::error::DhtError;
use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted in a single frame
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Read a complete frame from the stream
pub async fn read_frame_from<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    let mut length_buf = [0u8; 4];
    reader.read_exact(&mut length_buf).await?;
    let length = u32::from_be_bytes(length_buf) as usize;

    if length > MAX_FRAME_LEN {
        return Err(DhtError::protocol_error_with_source(
            "Frame too large",
            format!("{} bytes, limit {}", length, MAX_FRAME_LEN),
        )
        .into());
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write a frame to the stream
pub async fn write_frame_to<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(DhtError::protocol_error_with_source(
            "Frame too large",
            format!("{} bytes, limit {}", payload.len(), MAX_FRAME_LEN),
        )
        .into());
    }

    let mut buf = BytesMut::with_capacity(4 + payload.len());
    write_frame(&mut buf, payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a length-prefixed frame to the buffer
pub fn write_frame(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}
