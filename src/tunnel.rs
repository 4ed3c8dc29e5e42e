use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Outcome of a finished [`tunnel`].
#[derive(Debug)]
pub struct TunnelStats {
    /// Result of copying client bytes to the destination.
    pub client_to_destination: io::Result<u64>,
    /// Result of copying destination bytes to the client.
    pub destination_to_client: io::Result<u64>,
}

/// Copies bytes between `client` and `destination` in both directions until both
/// sides are done.
///
/// Each direction shuts down its writer once its reader reaches EOF or fails, so the
/// peer on the other end sees the close. Copy errors are reported in the returned
/// stats and never propagated.
pub async fn tunnel(
    client: impl AsyncRead + AsyncWrite + Send + Unpin,
    destination: impl AsyncRead + AsyncWrite + Send + Unpin,
) -> TunnelStats {
    let start = n0_future::time::Instant::now();
    let (mut client_recv, mut client_send) = tokio::io::split(client);
    let (mut dest_recv, mut dest_send) = tokio::io::split(destination);
    let (up, down) = tokio::join!(
        async {
            let res = tokio::io::copy(&mut client_recv, &mut dest_send).await;
            dest_send.shutdown().await.ok();
            trace!(?res, elapsed=?start.elapsed(), "client-to-destination finished");
            res
        },
        async {
            let res = tokio::io::copy(&mut dest_recv, &mut client_send).await;
            client_send.shutdown().await.ok();
            trace!(?res, elapsed=?start.elapsed(), "destination-to-client finished");
            res
        }
    );
    let stats = TunnelStats {
        client_to_destination: up,
        destination_to_client: down,
    };
    debug!(?stats, elapsed=?start.elapsed(), "tunnel closed");
    stats
}
