//! Bidirectional byte copy between two streams

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Copy buffer size per direction.
const COPY_BUF_SIZE: usize = 32 * 1024;

/// Copy bytes between `a` and `b` in both directions until one direction
/// finishes or errors, and return the byte count of that direction.
///
/// The other direction is not awaited: both endpoints are dropped when this
/// future resolves, which terminates the remaining copy. This gives the
/// half-close behavior a TLS proxy wants without coordinated shutdown.
pub async fn duplex_copy<A, B>(a: A, b: B) -> io::Result<u64>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::select! {
        res = copy_half(&mut a_read, &mut b_write) => res,
        res = copy_half(&mut b_read, &mut a_write) => res,
    }
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        match reader.read(&mut buf).await? {
            0 => {
                writer.shutdown().await.ok();
                return Ok(total);
            }
            n => {
                writer.write_all(&buf[..n]).await?;
                total += n as u64;
            }
        }
    }
}
