//! Wire format encoding and decoding.
//!
//! Every message starts with a 32-bit signed big-endian header:
//!
//! ```text
//! single request : <i32 L≥0> <L bytes>
//! single response: <i32 L≥0> <L bytes>
//! batch request  : <i32 -N> ( <i32 Lᵢ≥0> <Lᵢ bytes> ) × N
//! batch response : <i32 -N> ( <i32 Lᵢ≥0> <Lᵢ bytes> ) × N
//! ```
//!
//! A non-negative top-level header is the byte length of a single payload.
//! A negative header announces a batch of |H| length-prefixed sub-frames.
//! Sub-frame lengths are always non-negative; batches do not nest.

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TcplineError};

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest payload a single frame can carry (`i32::MAX`).
pub const MAX_FRAME_SIZE: usize = i32::MAX as usize;

/// Read the raw 4-byte big-endian header.
///
/// The value may be negative at the top level (batch announcement); use
/// [`read_frame`] where a negative length is a protocol violation.
pub async fn read_header<R>(r: &mut R) -> Result<i32>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_SIZE];
    r.read_exact(&mut buf).await?;
    Ok(i32::from_be_bytes(buf))
}

/// Write a raw 4-byte big-endian header.
pub async fn write_header<W>(w: &mut W, header: i32) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&header.to_be_bytes()).await?;
    Ok(())
}

/// Write a length-prefixed frame and return the payload bytes written.
pub async fn write_frame<W>(w: &mut W, payload: &[u8]) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    write_header(w, frame_len(payload)?).await?;
    w.write_all(payload).await?;
    Ok(payload.len())
}

/// Read a length-prefixed frame.
///
/// Fails on a negative length (reserved for the top-level batch header,
/// never valid for a sub-frame), a short read, or any I/O error.
pub async fn read_frame<R>(r: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = read_header(r).await?;
    if len < 0 {
        return Err(TcplineError::Protocol(format!(
            "negative frame length {len}"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Append a length-prefixed frame to an in-memory buffer.
///
/// Used by the pipeline to accumulate sub-frames before a flush.
pub fn put_frame<B>(buf: &mut B, payload: &[u8]) -> Result<usize>
where
    B: BufMut,
{
    buf.put_i32(frame_len(payload)?);
    buf.put_slice(payload);
    Ok(payload.len())
}

pub(crate) fn frame_len(payload: &[u8]) -> Result<i32> {
    i32::try_from(payload.len())
        .map_err(|_| TcplineError::Protocol(format!("frame too large: {} bytes", payload.len())))
}
