//! UDP listener: one task loops on receive, every datagram is processed on
//! a fresh task so the listener never blocks on upstream I/O.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::bufpool::BufferPool;

use super::QueryPipeline;

pub(crate) async fn serve(
    socket: Arc<UdpSocket>,
    pipeline: Arc<QueryPipeline>,
    pool: BufferPool,
    cancel: CancellationToken,
) {
    loop {
        let mut buffer = pool.pull();

        let (len, from) = tokio::select! {
            () = cancel.cancelled() => break,
            received = socket.recv_from(&mut buffer) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("UDP receive failed: {e}");
                    continue;
                }
            },
        };

        let socket = Arc::clone(&socket);
        let pipeline = Arc::clone(&pipeline);

        tokio::spawn(async move {
            let Some(response) = pipeline.handle(&buffer[..len]).await else {
                return;
            };

            if let Err(e) = socket.send_to(&response, from).await {
                tracing::debug!(client = %from, "Failed to send UDP response: {e}");
            }
        });
    }

    tracing::debug!("UDP listener stopped");
}
