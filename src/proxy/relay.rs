// src/proxy/relay.rs - Unidirectional copy halves with half-close semantics
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Per-direction relay buffer.
pub const RELAY_BUFFER_SIZE: usize = 4096;

/// Copy bytes from `reader` to `writer` until EOF.
///
/// The write is flushed before the next read, so a slow writer stalls its
/// reader; that is the backpressure contract. On EOF the write side of the
/// opposite socket is shut down (half-close) and the count of relayed
/// bytes is returned. The opposite direction keeps running independently.
///
/// `initial` carries bytes that were already read off the source (the
/// authentication peek); they are forwarded before the copy loop starts.
pub async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    initial: Option<&[u8]>,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total: u64 = 0;

    if let Some(chunk) = initial {
        if !chunk.is_empty() {
            writer.write_all(chunk).await?;
            writer.flush().await?;
            total += chunk.len() as u64;
        }
    }

    let mut buf = [0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // peer sent FIN; propagate the half-close and stop this
            // direction only
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}
