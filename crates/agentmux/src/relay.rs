//! Bidirectional copy between a logical connection and a local stream.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::connection::Connection;

/// Bytes moved by one [`relay`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Local stream → logical connection.
    pub sent: u64,
    /// Logical connection → local stream.
    pub received: u64,
}

/// Copy bytes both ways between `conn` and `stream` until either side ends.
///
/// Works for connections in any pre-close state: writes on a connection that
/// has not been accepted yet wait for the peer's answer. The two directions
/// run independently, so a local reader that stops draining never holds up the
/// upload. On exit the logical connection is closed with
/// [`Connection::close`] and the local write half is shut down.
pub async fn relay<S>(conn: Arc<Connection>, stream: S, chunk_size: usize) -> RelayStats
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = conn.id();
    let chunk_size = chunk_size.max(1);
    let (mut local_read, mut local_write) = tokio::io::split(stream);
    let (stop_tx, stop_rx) = watch::channel(false);

    let upload = async {
        let mut stop = stop_rx.clone();
        let mut buf = vec![0u8; chunk_size];
        let mut sent = 0u64;
        loop {
            let n = tokio::select! {
                result = local_read.read(&mut buf) => match result {
                    Ok(0) => {
                        debug!(connection_id = id, "local stream closed");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!(connection_id = id, error = %e, "local read error");
                        break;
                    }
                },
                _ = stop.wait_for(|stopped| *stopped) => break,
            };
            // Not raced against `stop`: an abandoned write would leave a
            // partial record on the shared transport.
            if let Err(e) = conn.write(&buf[..n]).await {
                debug!(connection_id = id, error = %e, "logical write failed, ending relay");
                break;
            }
            sent += n as u64;
        }
        stop_tx.send_replace(true);
        sent
    };

    let download = async {
        let mut stop = stop_rx.clone();
        let mut buf = vec![0u8; chunk_size];
        let mut received = 0u64;
        loop {
            let n = tokio::select! {
                result = conn.read(&mut buf) => match result {
                    Ok(0) => {
                        debug!(connection_id = id, "logical connection closed");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!(connection_id = id, error = %e, "logical read error");
                        break;
                    }
                },
                _ = stop.wait_for(|stopped| *stopped) => break,
            };
            tokio::select! {
                result = local_write.write_all(&buf[..n]) => {
                    if let Err(e) = result {
                        warn!(connection_id = id, error = %e, "local write error");
                        break;
                    }
                }
                _ = stop.wait_for(|stopped| *stopped) => break,
            }
            received += n as u64;
        }
        stop_tx.send_replace(true);
        received
    };

    let (sent, received) = tokio::join!(upload, download);
    let stats = RelayStats { sent, received };

    if let Err(e) = conn.close().await {
        debug!(connection_id = id, error = %e, "close after relay failed");
    }
    let _ = local_write.shutdown().await;
    debug!(connection_id = id, sent = stats.sent, received = stats.received, "relay ended");
    stats
}
