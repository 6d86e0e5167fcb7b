//! Connection Pipe
//!
//! Relays one accepted connection: two single-direction pipes run as
//! separate tasks sharing a per-connection cancellation token. Whichever
//! pipe stops first (EOF, read/write error, cancellation) cancels the token,
//! so its partner never blocks on a half-closed socket.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::stats::TrafficCounters;

/// Which way bytes flow through a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client -> remote, counted as sent
    LocalToRemote,
    /// Remote -> client, counted as received
    RemoteToLocal,
}

impl Direction {
    fn record(self, counters: &TrafficCounters, n: usize) {
        match self {
            Direction::LocalToRemote => counters.record_sent(n as u64),
            Direction::RemoteToLocal => counters.record_recv(n as u64),
        }
    }
}

/// Copy `src` into `dst` until EOF, error or cancellation.
///
/// Returns the number of bytes relayed. Always cancels `token` on exit.
pub async fn pipe<R, W>(
    mut src: R,
    mut dst: W,
    direction: Direction,
    buffer_size: usize,
    counters: &TrafficCounters,
    token: &CancellationToken,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut relayed = 0u64;

    loop {
        let n = tokio::select! {
            _ = token.cancelled() => break,
            read = src.read(&mut buf) => match read {
                Ok(0) => break, // EOF
                Ok(n) => n,
                Err(e) => {
                    debug!("{:?} read error: {}", direction, e);
                    break;
                }
            },
        };

        let written = tokio::select! {
            _ = token.cancelled() => break,
            written = dst.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            debug!("{:?} write error: {}", direction, e);
            break;
        }

        direction.record(counters, n);
        relayed += n as u64;
    }

    token.cancel();
    relayed
}

/// Relay both directions of a connection and return once both pipes ended.
/// Both sockets are closed when this returns.
pub(crate) async fn relay(
    local: TcpStream,
    remote: TcpStream,
    buffer_size: usize,
    counters: Arc<TrafficCounters>,
    token: CancellationToken,
) -> (u64, u64) {
    let (local_read, local_write) = local.into_split();
    let (remote_read, remote_write) = remote.into_split();

    let upstream = tokio::spawn({
        let counters = counters.clone();
        let token = token.clone();
        async move {
            pipe(
                local_read,
                remote_write,
                Direction::LocalToRemote,
                buffer_size,
                &counters,
                &token,
            )
            .await
        }
    });
    let downstream = tokio::spawn(async move {
        pipe(
            remote_read,
            local_write,
            Direction::RemoteToLocal,
            buffer_size,
            &counters,
            &token,
        )
        .await
    });

    let (sent, received) = tokio::join!(upstream, downstream);
    let sent = sent.unwrap_or_else(|e| {
        warn!("Upstream pipe task failed: {}", e);
        0
    });
    let received = received.unwrap_or_else(|e| {
        warn!("Downstream pipe task failed: {}", e);
        0
    });
    (sent, received)
}
