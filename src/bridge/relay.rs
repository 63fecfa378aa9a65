//! Streaming relay between the executor and the caller.
//!
//! The executor writes into one end of an in-process pipe; the relay task reads
//! the other end in chunks of at most [`CHUNK_SIZE`] bytes and writes each chunk
//! to the destination, flushing after every chunk so the caller sees output as
//! soon as it is produced.
//!
//! The relay stops when the pipe reaches end-of-stream (the writer was dropped
//! or shut down), when a read fails, or when the destination stops accepting
//! data. In the last case the read end is dropped, so the executor's next write
//! fails and the remote command is abandoned.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Maximum bytes forwarded per write/flush
pub const CHUNK_SIZE: usize = 1024;

/// Bytes buffered inside the pipe before the executor has to wait
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Create the in-process pipe: `(writer, reader)`.
pub fn pipe() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(PIPE_CAPACITY)
}

/// Copy `reader` into `dest` chunk by chunk. Returns the bytes relayed.
pub async fn relay<R, W>(mut reader: R, mut dest: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; CHUNK_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Relay read failed: {}", e);
                break;
            }
        };

        if let Err(e) = dest.write_all(&buf[..n]).await {
            warn!("Relay write failed after {} bytes: {}", total, e);
            break;
        }
        if let Err(e) = dest.flush().await {
            warn!("Relay flush failed after {} bytes: {}", total, e);
            break;
        }

        total += n as u64;
    }

    drop(reader);
    debug!("Relay finished, {} bytes forwarded", total);
    total
}

/// Run [`relay`] on its own task.
pub fn spawn_relay<R, W>(reader: R, dest: W) -> JoinHandle<u64>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(relay(reader, dest))
}
