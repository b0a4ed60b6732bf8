//! Bidirectional stream splicing
//!
//! Copies bytes both ways between a local client socket and a forwarded
//! channel. When one side's read half ends, the other side's write half
//! is shut down, so half-closes propagate (needed by request/response
//! protocols that signal end of request with EOF).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

const SPLICE_BUFFER_SIZE: usize = 32 * 1024;

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Splice `a` and `b` until both directions have finished
pub async fn splice<A, B>(a: A, b: B) -> SpliceStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (a_to_b, b_to_a) = tokio::join!(
        copy_then_shutdown(a_read, b_write, "a->b"),
        copy_then_shutdown(b_read, a_write, "b->a"),
    );

    SpliceStats { a_to_b, b_to_a }
}

async fn copy_then_shutdown<R, W>(mut src: ReadHalf<R>, mut dst: WriteHalf<W>, dir: &str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; SPLICE_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = dst.write_all(&buf[..n]).await {
                    debug!("Splice {} write error: {}", dir, e);
                    break;
                }
                total += n as u64;
            }
            Err(e) => {
                debug!("Splice {} read error: {}", dir, e);
                break;
            }
        }
    }

    let _ = dst.flush().await;
    let _ = dst.shutdown().await;
    total
}
