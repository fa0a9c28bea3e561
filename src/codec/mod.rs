//! Framed message codec (spec §4.1, §6): every logical message on a
//! stream is a 4-byte big-endian length header followed by that many
//! bytes of payload. The length header is the one place in the wire
//! format that is big-endian "for historical reasons" (spec §4.1); every
//! integer inside a payload body is little-endian (see [`primitive`]).

pub mod pool;
pub mod primitive;

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ArpcError;

/// Maximum message size accepted on the wire (spec §4.1).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Messages at or below this size are read into a pooled buffer instead
/// of a fresh allocation (spec §4.1).
pub const SMALL_MESSAGE_THRESHOLD: usize = 4 * 1024;

const LENGTH_HEADER_SIZE: usize = 4;

/// Reads one length-prefixed frame from `stream`, returning the raw
/// payload bytes. Rejects frames whose declared length exceeds
/// [`MAX_MESSAGE_SIZE`] before attempting to read the body.
pub async fn read_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
    pool: &pool::BufferPool,
) -> Result<Vec<u8>, ArpcError> {
    let mut header = [0u8; LENGTH_HEADER_SIZE];
    stream.read_exact(&mut header).await.map_err(map_read_err)?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ArpcError::Protocol(format!(
            "frame length {len} exceeds max message size {MAX_MESSAGE_SIZE}"
        )));
    }

    if len <= SMALL_MESSAGE_THRESHOLD && len <= pool.buffer_size() {
        let mut pooled = pool.acquire().await;
        stream.read_exact(&mut pooled.as_mut_slice()[..len]).await.map_err(map_read_err)?;
        let mut out = pooled.into_vec();
        out.truncate(len);
        Ok(out)
    } else {
        let mut out = vec![0u8; len];
        stream.read_exact(&mut out).await.map_err(map_read_err)?;
        Ok(out)
    }
}

/// Writes one length-prefixed frame. Uses a vectored write so the header
/// and body go out in a single syscall where the transport supports it.
pub async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    payload: &[u8],
) -> Result<(), ArpcError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ArpcError::Protocol(format!(
            "payload length {} exceeds max message size {MAX_MESSAGE_SIZE}",
            payload.len()
        )));
    }
    let header = (payload.len() as u32).to_be_bytes();

    let mut framed = Vec::with_capacity(LENGTH_HEADER_SIZE + payload.len());
    framed.extend_from_slice(&header);
    framed.extend_from_slice(payload);
    stream.write_all(&framed).await.map_err(ArpcError::Io)?;
    stream.flush().await.map_err(ArpcError::Io)?;
    Ok(())
}

fn map_read_err(err: io::Error) -> ArpcError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ArpcError::ConnectionLost
    } else {
        ArpcError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_small_message() {
        let pool = pool::BufferPool::new(SMALL_MESSAGE_THRESHOLD, 4);
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let payload = b"hello world!".to_vec();
        let payload_clone = payload.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut client, &payload_clone).await.unwrap();
        });
        let got = read_frame(&mut server, &pool).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn frame_round_trips_large_message_bypassing_pool() {
        let pool = pool::BufferPool::new(SMALL_MESSAGE_THRESHOLD, 4);
        let (mut client, mut server) = tokio::io::duplex(256 * 1024);

        let payload = vec![0xABu8; SMALL_MESSAGE_THRESHOLD + 1024];
        let payload_clone = payload.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut client, &payload_clone).await.unwrap();
        });
        let got = read_frame(&mut server, &pool).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let pool = pool::BufferPool::new(SMALL_MESSAGE_THRESHOLD, 1);
        let (mut client, mut server) = tokio::io::duplex(64);

        let header = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
        let writer = tokio::spawn(async move {
            let _ = client.write_all(&header).await;
        });
        let result = read_frame(&mut server, &pool).await;
        writer.await.unwrap();
        assert!(matches!(result, Err(ArpcError::Protocol(_))));
    }
}
