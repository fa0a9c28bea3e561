//! Binary side-channel chunk protocol (spec §4.5, §6).
//!
//! Used for the tail of a `ReadAt` response and for symmetric reads
//! issued by the client. The sender writes a sequence of
//! `(u32 LE chunk-length, chunk-bytes)` records; a chunk-length of 0
//! marks end-of-stream and is followed by a `u32 LE` final-total that
//! must equal the sum of the chunk lengths sent. The receiver reads
//! chunks straight into the caller's buffer.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::pool::BufferPool;
use crate::error::ArpcError;

/// Default chunk scratch buffer size for the binary side-channel (spec §4.5).
pub const CHUNK_POOL_BUFFER_SIZE: usize = 64 * 1024;

pub fn chunk_pool() -> BufferPool {
    BufferPool::new(CHUNK_POOL_BUFFER_SIZE, 8)
}

/// Streams up to `total_len` bytes from `reader` onto `stream` as chunked
/// binary-tail records, using `pool` for the intermediate scratch buffer
/// so no extra allocation happens per chunk. Returns the number of bytes
/// actually sent (may be less than `total_len` if `reader` hits EOF
/// early).
pub async fn write_chunks<R, S>(
    reader: &mut R,
    stream: &mut S,
    total_len: u64,
    pool: &BufferPool,
) -> Result<u64, ArpcError>
where
    R: AsyncRead + Unpin,
    S: AsyncWrite + Unpin,
{
    let mut sent: u64 = 0;
    let mut scratch = pool.acquire().await;
    while sent < total_len {
        let want = std::cmp::min(scratch.as_slice().len() as u64, total_len - sent) as usize;
        let n = reader.read(&mut scratch.as_mut_slice()[..want]).await.map_err(ArpcError::Io)?;
        if n == 0 {
            break;
        }
        write_chunk(stream, &scratch.as_slice()[..n]).await?;
        sent += n as u64;
    }
    write_terminator(stream, sent).await?;
    Ok(sent)
}

/// Writes a single chunk record; exposed for callers that already have
/// in-memory data (e.g. the client side's symmetric write path).
pub async fn write_chunk<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> Result<(), ArpcError> {
    stream.write_all(&(data.len() as u32).to_le_bytes()).await.map_err(ArpcError::Io)?;
    stream.write_all(data).await.map_err(ArpcError::Io)?;
    Ok(())
}

pub async fn write_terminator<S: AsyncWrite + Unpin>(
    stream: &mut S,
    final_total: u64,
) -> Result<(), ArpcError> {
    stream.write_all(&0u32.to_le_bytes()).await.map_err(ArpcError::Io)?;
    stream.write_all(&(final_total as u32).to_le_bytes()).await.map_err(ArpcError::Io)?;
    stream.flush().await.map_err(ArpcError::Io)?;
    Ok(())
}

/// Reads chunk records off `stream` into `buf`, stopping at the
/// terminator and validating the final total. Returns the number of
/// bytes written into `buf`.
pub async fn read_into<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut [u8]) -> Result<usize, ArpcError> {
    let mut written = 0usize;
    let mut running_total: u64 = 0;

    loop {
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).await.map_err(map_eof)?;
        let chunk_len = u32::from_le_bytes(len_bytes) as usize;

        if chunk_len == 0 {
            let mut total_bytes = [0u8; 4];
            stream.read_exact(&mut total_bytes).await.map_err(map_eof)?;
            let final_total = u32::from_le_bytes(total_bytes) as u64;
            if final_total != running_total {
                return Err(ArpcError::Protocol(format!(
                    "binary stream final total {final_total} does not match {running_total} bytes delivered"
                )));
            }
            return Ok(written);
        }

        if written + chunk_len > buf.len() {
            return Err(ArpcError::Protocol(format!(
                "binary stream chunk of {chunk_len} bytes overflows {}-byte buffer ({written} already written)",
                buf.len()
            )));
        }

        stream.read_exact(&mut buf[written..written + chunk_len]).await.map_err(map_eof)?;
        written += chunk_len;
        running_total += chunk_len as u64;
    }
}

fn map_eof(err: std::io::Error) -> ArpcError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ArpcError::ConnectionLost
    } else {
        ArpcError::Io(err)
    }
}
